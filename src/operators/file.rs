use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use entry::Entry;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::operator::helper::{Output, OutputConfig, Sink};
use crate::operator::{BuildContext, Operator, OperatorConfig};
use crate::Result;

/// Appends entries to a file, one JSON document per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutputConfig {
    #[serde(flatten)]
    output: OutputConfig,

    path: PathBuf,
}

#[typetag::serde(name = "file_output")]
impl OperatorConfig for FileOutputConfig {
    fn build(&self, context: &BuildContext) -> Result<Arc<dyn Operator>> {
        let sink = Arc::new(FileSink {
            path: self.path.clone(),
            file: Mutex::new(None),
        });
        let output = Output::build(&self.output, "file_output", context, sink)?;
        Ok(Arc::new(FileOutput { output }))
    }

    fn type_name(&self) -> &'static str {
        "file_output"
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

struct FileSink {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

#[async_trait::async_trait]
impl Sink for FileSink {
    async fn send(&self, _ctx: &CancellationToken, entries: &[Entry]) -> Result<()> {
        let mut guard = self.file.lock().expect("file sink lock");
        if guard.is_none() {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            *guard = Some(file);
        }

        let file = guard.as_mut().expect("file is open");
        for entry in entries {
            serde_json::to_writer(&mut *file, entry)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        Ok(())
    }
}

struct FileOutput {
    output: Output,
}

#[async_trait::async_trait]
impl Operator for FileOutput {
    fn id(&self) -> &str {
        &self.output.id
    }

    fn operator_type(&self) -> &'static str {
        "file_output"
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
