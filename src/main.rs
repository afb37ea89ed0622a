mod commands;

use commands::{Command, OffsetsSubcommand, RootCommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

fn main() {
    let opts: RootCommand = argh::from_env();

    if opts.version {
        show_version();
        return;
    }

    let Some(command) = opts.command else {
        eprintln!("no command given; try `lumber run --config config.yaml`");
        std::process::exit(1);
    };

    let code = match command {
        Command::Version(_) => {
            show_version();
            exitcode::OK
        }
        Command::Graph(graph) => lumber::app::print_graph(&graph.config),
        Command::Offsets(offsets) => match offsets.command {
            OffsetsSubcommand::List(list) => lumber::app::offsets_list(&list.database),
            OffsetsSubcommand::Clear(clear) => {
                lumber::app::offsets_clear(&clear.database, clear.all, &clear.operator_ids)
            }
        },
        Command::Run(run) => {
            init_tracing(&run.log_level);

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .thread_name("lumber-worker")
                .enable_io()
                .enable_time()
                .build()
                .expect("build tokio runtime");

            runtime.block_on(lumber::app::run_agent(&run.config, run.database.as_deref()))
        }
    };

    std::process::exit(code);
}

fn init_tracing(log_level: &str) {
    let filter = std::env::var("LUMBER_LOG").unwrap_or_else(|_| log_level.to_owned());

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::new(filter))
        .init();
}

fn show_version() {
    println!("lumber {}", env!("CARGO_PKG_VERSION"));
}
