use std::io::Write;
use std::sync::Arc;

use entry::Entry;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::operator::helper::{Output, OutputConfig, Sink};
use crate::operator::{BuildContext, Operator, OperatorConfig};
use crate::Result;

/// Writes entries to standard output, one JSON document per line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StdoutConfig {
    #[serde(flatten)]
    output: OutputConfig,
}

#[typetag::serde(name = "stdout")]
impl OperatorConfig for StdoutConfig {
    fn build(&self, context: &BuildContext) -> Result<Arc<dyn Operator>> {
        let output = Output::build(&self.output, "stdout", context, Arc::new(StdoutSink))?;
        Ok(Arc::new(StdoutOperator { output }))
    }

    fn type_name(&self) -> &'static str {
        "stdout"
    }

    fn id(&self) -> Option<&str> {
        self.output.id.as_deref()
    }

    fn declared_outputs(&self) -> &[String] {
        &[]
    }

    fn is_output(&self) -> bool {
        true
    }
}

struct StdoutSink;

#[async_trait::async_trait]
impl Sink for StdoutSink {
    async fn send(&self, _ctx: &CancellationToken, entries: &[Entry]) -> Result<()> {
        // One lock for the whole batch so entries from concurrent flushes
        // do not interleave mid-line.
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        for entry in entries {
            serde_json::to_writer(&mut handle, entry)?;
            handle.write_all(b"\n")?;
        }
        handle.flush()?;
        Ok(())
    }
}

struct StdoutOperator {
    output: Output,
}

#[async_trait::async_trait]
impl Operator for StdoutOperator {
    fn id(&self) -> &str {
        &self.output.id
    }

    fn operator_type(&self) -> &'static str {
        "stdout"
    }

    fn can_output(&self) -> bool {
        false
    }

    async fn process(&self, ctx: &CancellationToken, entry: Entry) -> Result<()> {
        self.output.process(ctx, entry).await
    }

    async fn start(&self, _shutdown: CancellationToken) -> Result<()> {
        self.output.start();
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.output.stop().await
    }
}
