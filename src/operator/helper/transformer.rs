use std::panic::AssertUnwindSafe;

use entry::Entry;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::condition::Expression;
use crate::operator::BuildContext;
use crate::{Error, Result};

use super::{Writer, WriterConfig};

/// What a transformer does with an entry its transform could not handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Log the failure and send the entry through unmodified.
    #[default]
    Send,

    /// Drop the entry silently.
    Drop,

    /// Log the failure and keep the entry back.
    SendQuiet,
}

/// Configuration shared by transformer operators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformerConfig {
    #[serde(flatten)]
    pub writer: WriterConfig,

    /// Only entries matching this predicate are transformed; the rest
    /// pass through untouched.
    #[serde(rename = "if")]
    pub predicate: Option<Expression>,

    #[serde(default)]
    pub on_error: ErrorPolicy,
}

/// The shared half of a transformer operator: predicate gating, error
/// policy, and fan-out to successors.
pub struct Transformer {
    pub id: String,
    pub writer: Writer,
    predicate: Option<Expression>,
    on_error: ErrorPolicy,
}

impl Transformer {
    pub fn build(
        config: &TransformerConfig,
        operator_type: &str,
        context: &BuildContext,
    ) -> Transformer {
        Transformer {
            id: context.prepend_namespace(config.writer.id.as_deref().unwrap_or(operator_type)),
            writer: Writer::build(&config.writer, context),
            predicate: config.predicate.clone(),
            on_error: config.on_error,
        }
    }

    /// Runs `transform` on the entry and writes the result onward,
    /// applying the predicate and the error policy. Panics out of the
    /// transform are contained here and treated as data errors.
    pub async fn process_with<F>(
        &self,
        ctx: &CancellationToken,
        mut entry: Entry,
        transform: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Entry) -> Result<()>,
    {
        if let Some(predicate) = &self.predicate {
            if !predicate.eval(&entry) {
                self.writer.write(ctx, entry).await;
                return Ok(());
            }
        }

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| transform(&mut entry)))
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "transform panicked".to_owned());
                Err(Error::data(message))
            });

        match outcome {
            Ok(()) => {
                self.writer.write(ctx, entry).await;
                Ok(())
            }
            Err(err) => self.handle_failure(ctx, entry, err).await,
        }
    }

    async fn handle_failure(
        &self,
        ctx: &CancellationToken,
        entry: Entry,
        err: Error,
    ) -> Result<()> {
        match self.on_error {
            ErrorPolicy::Send => {
                warn!(operator_id = %self.id, %err, "transform failed, sending entry unmodified");
                self.writer.write(ctx, entry).await;
            }
            ErrorPolicy::Drop => {}
            ErrorPolicy::SendQuiet => {
                warn!(operator_id = %self.id, %err, "transform failed, entry withheld");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use persist::Store;

    use crate::operator::Operator;
    use crate::operator::helper::testing::Collector;

    use super::*;

    fn transformer(yaml: &str) -> (Transformer, Arc<Collector>) {
        let context = BuildContext::new(Store::stub());
        let config: TransformerConfig = serde_yaml::from_str(yaml).unwrap();
        let transformer = Transformer::build(&config, "noop", &context);

        let collector = Collector::new();
        let candidates: Vec<Arc<dyn Operator>> = vec![collector.clone()];
        transformer.writer.set_outputs(&candidates).unwrap();
        (transformer, collector)
    }

    fn entry_with_status(status: i64) -> Entry {
        let mut entry = Entry::empty();
        entry
            .set(&entry::Field::body(["status"]), status)
            .unwrap();
        entry
    }

    #[tokio::test]
    async fn transform_applies_and_sends() {
        let (transformer, collector) = transformer("output: collector");

        transformer
            .process_with(&CancellationToken::new(), entry_with_status(200), |entry| {
                entry.set(&entry::Field::body(["seen"]), true)?;
                Ok(())
            })
            .await
            .unwrap();

        let entries = collector.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0]
                .get(&entry::Field::body(["seen"]))
                .unwrap()
                .as_ref(),
            &entry::Value::Bool(true)
        );
    }

    #[tokio::test]
    async fn false_predicate_passes_entry_through() {
        let (transformer, collector) =
            transformer("output: collector\nif: $.status == 500");

        transformer
            .process_with(&CancellationToken::new(), entry_with_status(200), |entry| {
                entry.set(&entry::Field::body(["seen"]), true)?;
                Ok(())
            })
            .await
            .unwrap();

        let entries = collector.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].get(&entry::Field::body(["seen"])), None);
    }

    #[tokio::test]
    async fn on_error_send_forwards_unmodified() {
        let (transformer, collector) = transformer("output: collector\non_error: send");

        transformer
            .process_with(&CancellationToken::new(), entry_with_status(200), |_| {
                Err(Error::data("malformed"))
            })
            .await
            .unwrap();

        let entries = collector.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], entry_with_status(200));
    }

    #[tokio::test]
    async fn on_error_drop_swallows_entry() {
        let (transformer, collector) = transformer("output: collector\non_error: drop");

        transformer
            .process_with(&CancellationToken::new(), entry_with_status(200), |_| {
                Err(Error::data("malformed"))
            })
            .await
            .unwrap();

        assert!(collector.entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn panic_in_transform_is_contained() {
        let (transformer, collector) = transformer("output: collector\non_error: send");

        transformer
            .process_with(&CancellationToken::new(), entry_with_status(200), |_| {
                panic!("user code exploded")
            })
            .await
            .unwrap();

        assert_eq!(collector.entries.lock().unwrap().len(), 1);
    }
}
