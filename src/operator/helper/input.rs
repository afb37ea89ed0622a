use entry::{Entry, Field, Value};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::operator::BuildContext;

use super::{Persister, Writer, WriterConfig};

/// Configuration shared by input operators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(flatten)]
    pub writer: WriterConfig,

    /// Where produced values land in new entries; the whole body by
    /// default.
    #[serde(default)]
    pub write_to: Field,

    /// Stamped onto every entry as the `log_type` attribute.
    pub log_type: Option<String>,
}

/// The shared half of an input operator: entry construction, fan-out to
/// successors, and durable offset state.
pub struct Input {
    pub id: String,
    pub writer: Writer,
    write_to: Field,
    log_type: String,
    persister: Persister,
}

impl Input {
    pub fn build(config: &InputConfig, operator_type: &str, context: &BuildContext) -> Input {
        let id = context.prepend_namespace(config.writer.id.as_deref().unwrap_or(operator_type));

        Input {
            writer: Writer::build(&config.writer, context),
            write_to: config.write_to.clone(),
            log_type: config
                .log_type
                .clone()
                .unwrap_or_else(|| operator_type.to_owned()),
            persister: Persister::new(context.store.clone(), &id),
            id,
        }
    }

    /// A fresh entry with `value` at the configured field and the input's
    /// `log_type` attribute.
    pub fn new_entry(&self, value: impl Into<Value>) -> Entry {
        let mut entry = Entry::new();
        // The write target is a plain field; this cannot fail for a fresh
        // null body.
        let _ = entry.set(&self.write_to, value.into());
        entry.add_attribute("log_type", self.log_type.clone());
        entry
    }

    /// Sends an entry to every successor.
    pub async fn write(&self, ctx: &CancellationToken, entry: Entry) {
        self.writer.write(ctx, entry).await;
    }

    /// Durable resume-point storage scoped to this operator.
    pub fn persister(&self) -> &Persister {
        &self.persister
    }
}

#[cfg(test)]
mod tests {
    use persist::Store;

    use super::*;

    #[test]
    fn new_entry_carries_log_type_and_write_to() {
        let context = BuildContext::new(Store::stub());
        let config: InputConfig =
            serde_yaml::from_str("write_to: $.message\nlog_type: tomcat").unwrap();
        let input = Input::build(&config, "file_input", &context);

        assert_eq!(input.id, "$.file_input");

        let entry = input.new_entry("hello");
        assert_eq!(
            entry.get(&Field::body(["message"])).unwrap().as_ref(),
            &Value::from("hello")
        );
        assert_eq!(
            entry.attributes.get("log_type").map(String::as_str),
            Some("tomcat")
        );
    }
}
