use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::Backoff;
use buffer::{AcquireError, Semaphore};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, warn};

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlusherConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u64,

    /// Cap on a single retry backoff interval.
    #[serde(default = "default_max_retry_interval", with = "duration")]
    pub max_retry_interval: Duration,

    /// Total time to keep retrying one chunk before dropping it.
    #[serde(default = "default_max_retry_elapsed", with = "duration")]
    pub max_retry_elapsed: Duration,
}

impl Default for FlusherConfig {
    fn default() -> Self {
        FlusherConfig {
            max_concurrency: default_max_concurrency(),
            max_retry_interval: default_max_retry_interval(),
            max_retry_elapsed: default_max_retry_elapsed(),
        }
    }
}

fn default_max_concurrency() -> u64 {
    16
}

fn default_max_retry_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retry_elapsed() -> Duration {
    Duration::from_secs(300)
}

/// A bounded-concurrency retry scheduler.
///
/// `submit` takes one of `max_concurrency` slots, then runs the flush
/// function on its own task, retrying failures with randomized
/// exponential backoff until success, cancellation, or the elapsed
/// ceiling. The flusher knows nothing about buffers or entries; the
/// caller captures those in the closure.
pub struct Flusher {
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
    stop: CancellationToken,
    max_retry_interval: Duration,
    max_retry_elapsed: Duration,
}

impl Flusher {
    pub fn new(config: &FlusherConfig) -> Flusher {
        Flusher {
            slots: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            tracker: TaskTracker::new(),
            stop: CancellationToken::new(),
            max_retry_interval: config.max_retry_interval,
            max_retry_elapsed: config.max_retry_elapsed,
        }
    }

    /// Queues one flush. Blocks until a concurrency slot frees up or
    /// `ctx` cancels; the flush itself runs in the background.
    pub async fn submit<F, Fut>(&self, ctx: &CancellationToken, flush: F) -> Result<()>
    where
        F: Fn(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        match self.slots.acquire(ctx, 1).await {
            Ok(()) => {}
            Err(AcquireError::Cancelled) => return Err(Error::Buffer(buffer::Error::Cancelled)),
            Err(AcquireError::Closed) => return Err(Error::Buffer(buffer::Error::Closed)),
        }

        if self.stop.is_cancelled() {
            self.slots.increment(1);
            return Err(Error::Buffer(buffer::Error::Closed));
        }

        let slots = self.slots.clone();
        let stop = self.stop.clone();
        let ctx = ctx.clone();
        let mut backoff = Backoff::from_millis(50)
            .randomization(0.5)
            .multiplier(1.5)
            .max_interval(self.max_retry_interval)
            .max_elapsed(self.max_retry_elapsed);

        self.tracker.spawn(async move {
            loop {
                match flush(ctx.clone()).await {
                    Ok(()) => break,
                    Err(err) => {
                        let Some(delay) = backoff.next() else {
                            error!(
                                %err,
                                "reached max elapsed time retrying flush, dropping chunk"
                            );
                            break;
                        };

                        warn!(%err, delay_ms = delay.as_millis() as u64, "flush failed, retrying");

                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = stop.cancelled() => break,
                            _ = ctx.cancelled() => break,
                        }
                    }
                }
            }

            slots.increment(1);
        });

        Ok(())
    }

    /// Signals in-flight flushes to stop and waits for their tasks.
    pub async fn stop(&self) {
        self.stop.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Duration fields reuse the buffer crate's human-friendly forms; a local
/// copy keeps the config module self-contained.
mod duration {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", d.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(secs) if secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
            Raw::Number(secs) => Err(D::Error::custom(format!("negative duration {secs}"))),
            Raw::Text(text) => parse(&text).map_err(D::Error::custom),
        }
    }

    fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        let split = text
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(text.len());
        let (number, unit) = text.split_at(split);

        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration '{text}'"))?;

        let multiplier = match unit.trim() {
            "" | "s" => 1.0,
            "ms" => 1e-3,
            "m" => 60.0,
            "h" => 3600.0,
            other => return Err(format!("unknown duration unit '{other}'")),
        };

        Ok(Duration::from_secs_f64(value * multiplier))
    }
}
