use std::sync::{Arc, Mutex};
use std::time::Duration;

use entry::{Entry, Value};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::operator::helper::{Input, InputConfig};
use crate::operator::{BuildContext, Operator, OperatorConfig};
use crate::{Error, Result};

/// Produces a configured entry over and over. Useful for smoke-testing a
/// pipeline and as the reference input implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateInputConfig {
    #[serde(flatten)]
    input: InputConfig,

    /// Body of each generated entry.
    entry: Value,

    /// How many entries to produce; 0 means unbounded.
    #[serde(default)]
    count: u64,

    /// Pause between entries in milliseconds; 0 produces as fast as the
    /// pipeline drains.
    #[serde(default)]
    interval_ms: u64,
}

#[typetag::serde(name = "generate_input")]
impl OperatorConfig for GenerateInputConfig {
    fn build(&self, context: &BuildContext) -> Result<Arc<dyn Operator>> {
        Ok(Arc::new(GenerateInput {
            input: Arc::new(Input::build(&self.input, "generate_input", context)),
            body: self.entry.clone(),
            count: self.count,
            interval: Duration::from_millis(self.interval_ms),
            running: Mutex::new(None),
        }))
    }

    fn type_name(&self) -> &'static str {
        "generate_input"
    }

    fn id(&self) -> Option<&str> {
        self.input.writer.id.as_deref()
    }

    fn declared_outputs(&self) -> &[String] {
        &self.input.writer.output.0
    }
}

struct GenerateInput {
    input: Arc<Input>,
    body: Value,
    count: u64,
    interval: Duration,
    running: Mutex<Option<(CancellationToken, tokio::task::JoinHandle<()>)>>,
}

#[async_trait::async_trait]
impl Operator for GenerateInput {
    fn id(&self) -> &str {
        &self.input.id
    }

    fn operator_type(&self) -> &'static str {
        "generate_input"
    }

    fn can_process(&self) -> bool {
        false
    }

    async fn process(&self, _ctx: &CancellationToken, _entry: Entry) -> Result<()> {
        Err(Error::config(format!(
            "operator {} is an input and can not process entries",
            self.id()
        )))
    }

    fn output_ids(&self) -> Vec<String> {
        self.input.writer.output_ids()
    }

    fn outputs(&self) -> Vec<Arc<dyn Operator>> {
        self.input.writer.outputs()
    }

    fn set_outputs(&self, candidates: &[Arc<dyn Operator>]) -> Result<()> {
        self.input.writer.set_outputs(candidates)
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let stop = shutdown.child_token();
        let body = self.body.clone();
        let count = self.count;
        let interval = self.interval;
        let input = self.input.clone();

        let token = stop.clone();
        let handle = tokio::spawn(async move {
            let mut produced = 0u64;
            while count == 0 || produced < count {
                if token.is_cancelled() {
                    return;
                }

                let entry = input.new_entry(body.clone());
                input.write(&token, entry).await;
                produced += 1;

                if interval.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = token.cancelled() => return,
                    }
                }
            }
        });

        *self.running.lock().expect("generator lock") = Some((stop, handle));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let running = self.running.lock().expect("generator lock").take();
        if let Some((stop, handle)) = running {
            stop.cancel();
            let _ = handle.await;
        }
        Ok(())
    }
}
