use std::path::Path;

use persist::Store;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::operator::helper::OFFSETS_BUCKET;

/// Runs the agent until interrupted. Returns a process exit code: 1 for
/// configuration and startup failures, 2 for unrecoverable runtime
/// failures.
pub async fn run_agent(config_path: &Path, database: Option<&Path>) -> i32 {
    let config = match Config::from_path(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return 1;
        }
    };

    let store = match database {
        Some(path) => match Store::open(path) {
            Ok(store) => store,
            Err(err) => {
                eprintln!("open database {}: {err}", path.display());
                return 1;
            }
        },
        None => Store::stub(),
    };

    let pipeline = match config.build_pipeline(store.clone()) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            eprintln!("invalid pipeline: {err}");
            return 1;
        }
    };

    let shutdown = CancellationToken::new();
    if let Err(err) = pipeline.start(shutdown.clone()).await {
        eprintln!("start pipeline: {err}");
        return 1;
    }
    info!("pipeline started");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received interrupt, shutting down"),
        Err(err) => error!(%err, "failed to listen for shutdown signal"),
    }

    shutdown.cancel();
    pipeline.stop().await;

    if let Err(err) = store.sync().and_then(|_| store.close()) {
        error!(%err, "failed to close the offsets database");
        return 2;
    }

    0
}

/// Prints the pipeline graph in dot format.
pub fn print_graph(config_path: &Path) -> i32 {
    let rendered = Config::from_path(config_path)
        .and_then(|config| config.build_pipeline(Store::stub()))
        .map(|pipeline| pipeline.render());

    match rendered {
        Ok(graph) => {
            print!("{graph}");
            0
        }
        Err(err) => {
            eprintln!("{err}");
            1
        }
    }
}

/// Input-operator ids with persisted offsets, in lexicographic order.
pub fn list_offset_scopes(database: &Path) -> Result<Vec<String>, persist::Error> {
    let store = Store::open(database)?;
    let mut scopes = Vec::new();
    store.view(|txn| {
        if let Some(offsets) = txn.existing_bucket(OFFSETS_BUCKET)? {
            scopes = offsets.children()?;
        }
        Ok(())
    })?;
    Ok(scopes)
}

/// Prints input-operator ids with persisted offsets, one per line.
pub fn offsets_list(database: &Path) -> i32 {
    match list_offset_scopes(database) {
        Ok(scopes) => {
            for scope in scopes {
                println!("{scope}");
            }
            0
        }
        Err(err) => {
            eprintln!("{err}");
            1
        }
    }
}

/// Deletes persisted offsets for the named operators, or all of them.
pub fn offsets_clear(database: &Path, all: bool, operator_ids: &[String]) -> i32 {
    if !all && operator_ids.is_empty() {
        eprintln!("specify operator ids to clear, or --all");
        return 1;
    }

    let result = Store::open(database).and_then(|store| {
        store.update(|txn| {
            if all {
                return txn.delete_bucket(OFFSETS_BUCKET);
            }

            if let Some(offsets) = txn.existing_bucket(OFFSETS_BUCKET)? {
                for id in operator_ids {
                    offsets.delete_child(id)?;
                }
            }
            Ok(())
        })
    });

    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{err}");
            1
        }
    }
}
