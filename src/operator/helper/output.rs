use std::sync::{Arc, Mutex};
use std::time::Duration;

use buffer::{Buffer, BufferConfig};
use entry::Entry;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::flusher::{Flusher, FlusherConfig};
use crate::operator::BuildContext;
use crate::{Error, Result};

/// Where an output's entries actually go: a cloud client, a forwarder, a
/// file, standard output. Send either delivers the whole batch or fails;
/// the flusher handles retries.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    async fn send(&self, ctx: &CancellationToken, entries: &[Entry]) -> Result<()>;
}

/// Configuration shared by output operators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    pub id: Option<String>,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub flusher: FlusherConfig,
}

/// How long `stop` waits for one last delivery of unflushed entries.
const LAST_CHANCE_TIMEOUT: Duration = Duration::from_secs(10);

/// The shared half of an output operator.
///
/// `process` lands entries in the buffer; a background driver drains the
/// buffer in chunks and hands each chunk to the flusher, which calls the
/// sink and marks the chunk flushed on success. `stop` closes the buffer
/// and makes one bounded-time attempt to deliver whatever never flushed.
pub struct Output {
    pub id: String,
    buffer: Arc<Buffer>,
    flusher: Arc<Flusher>,
    sink: Arc<dyn Sink>,
    shutdown: CancellationToken,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Output {
    pub fn build(
        config: &OutputConfig,
        operator_type: &str,
        context: &BuildContext,
        sink: Arc<dyn Sink>,
    ) -> Result<Output> {
        let id = context.prepend_namespace(config.id.as_deref().unwrap_or(operator_type));
        let buffer = config
            .buffer
            .build()
            .map_err(|err| Error::config(format!("build buffer for {id}: {err}")))?;

        Ok(Output {
            id,
            buffer: Arc::new(buffer),
            flusher: Arc::new(Flusher::new(&config.flusher)),
            sink,
            shutdown: CancellationToken::new(),
            driver: Mutex::new(None),
        })
    }

    pub async fn process(&self, ctx: &CancellationToken, entry: Entry) -> Result<()> {
        self.buffer.add(ctx, entry).await?;
        Ok(())
    }

    pub fn start(&self) {
        let handle = tokio::spawn(drive(
            self.buffer.clone(),
            self.flusher.clone(),
            self.sink.clone(),
            self.shutdown.clone(),
        ));
        *self.driver.lock().expect("driver lock") = Some(handle);
    }

    pub async fn stop(&self) -> Result<()> {
        self.shutdown.cancel();
        let handle = self.driver.lock().expect("driver lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.flusher.stop().await;

        let residual = match self.buffer.close() {
            Ok(residual) => residual,
            Err(buffer::Error::Closed) => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        if residual.is_empty() {
            return Ok(());
        }

        // One last bounded-time attempt; anything still undelivered is
        // either on disk for the next run or logged as lost.
        let ctx = CancellationToken::new();
        match tokio::time::timeout(LAST_CHANCE_TIMEOUT, self.sink.send(&ctx, &residual)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(
                operator_id = %self.id,
                count = residual.len(),
                %err,
                "failed last-chance delivery of unflushed entries"
            ),
            Err(_) => warn!(
                operator_id = %self.id,
                count = residual.len(),
                "timed out delivering unflushed entries"
            ),
        }

        Ok(())
    }
}

async fn drive(
    buffer: Arc<Buffer>,
    flusher: Arc<Flusher>,
    sink: Arc<dyn Sink>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let chunk = match buffer.read(&shutdown).await {
            Ok(chunk) => chunk,
            Err(buffer::Error::Closed) | Err(buffer::Error::Cancelled) => return,
            Err(err) => {
                error!(%err, "failed to read from buffer");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    _ = shutdown.cancelled() => return,
                }
            }
        };

        if chunk.is_empty() {
            continue;
        }

        let entries = Arc::new(chunk.entries);
        let token = chunk.token;
        let buffer = buffer.clone();
        let sink = sink.clone();

        let submitted = flusher
            .submit(&shutdown, move |ctx| {
                let entries = entries.clone();
                let buffer = buffer.clone();
                let sink = sink.clone();
                async move {
                    sink.send(&ctx, &entries).await?;
                    buffer.mark_flushed(token)?;
                    Ok(())
                }
            })
            .await;

        if submitted.is_err() {
            // Cancelled while waiting for a slot; the chunk stays
            // unflushed and will be re-read or recovered.
            return;
        }
    }
}
