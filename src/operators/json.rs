use std::sync::Arc;

use entry::{Entry, Field, Value};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::operator::helper::{Transformer, TransformerConfig};
use crate::operator::{BuildContext, Operator, OperatorConfig};
use crate::{Error, Result};

/// Parses a string field as JSON and writes the structured result back
/// into the entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonParserConfig {
    #[serde(flatten)]
    transformer: TransformerConfig,

    /// Field holding the JSON text; the whole body by default.
    #[serde(default)]
    parse_from: Field,

    /// Where the parsed value lands; the whole body by default.
    #[serde(default)]
    parse_to: Field,

    /// Keeps the original text at this field instead of dropping it.
    preserve_to: Option<Field>,
}

#[typetag::serde(name = "json_parser")]
impl OperatorConfig for JsonParserConfig {
    fn build(&self, context: &BuildContext) -> Result<Arc<dyn Operator>> {
        Ok(Arc::new(JsonParser {
            transformer: Transformer::build(&self.transformer, "json_parser", context),
            parse_from: self.parse_from.clone(),
            parse_to: self.parse_to.clone(),
            preserve_to: self.preserve_to.clone(),
        }))
    }

    fn type_name(&self) -> &'static str {
        "json_parser"
    }

    fn id(&self) -> Option<&str> {
        self.transformer.writer.id.as_deref()
    }

    fn declared_outputs(&self) -> &[String] {
        &self.transformer.writer.output.0
    }
}

struct JsonParser {
    transformer: Transformer,
    parse_from: Field,
    parse_to: Field,
    preserve_to: Option<Field>,
}

#[async_trait::async_trait]
impl Operator for JsonParser {
    fn id(&self) -> &str {
        &self.transformer.id
    }

    fn operator_type(&self) -> &'static str {
        "json_parser"
    }

    fn output_ids(&self) -> Vec<String> {
        self.transformer.writer.output_ids()
    }

    fn outputs(&self) -> Vec<Arc<dyn Operator>> {
        self.transformer.writer.outputs()
    }

    fn set_outputs(&self, candidates: &[Arc<dyn Operator>]) -> Result<()> {
        self.transformer.writer.set_outputs(candidates)
    }

    async fn process(&self, ctx: &CancellationToken, entry: Entry) -> Result<()> {
        self.transformer
            .process_with(ctx, entry, |entry| {
                let original = self
                    .parse_from
                    .delete(entry)
                    .ok_or_else(|| {
                        Error::data(format!("field {} is not present", self.parse_from))
                    })?;

                let raw = match &original {
                    Value::String(s) => s.as_str(),
                    other => {
                        let kind = kind_name(other);
                        // Put the value back where it was; nothing changed.
                        let _ = self.parse_from.set(entry, original.clone());
                        return Err(Error::data(format!(
                            "json_parser expects a string, field {} holds {kind}",
                            self.parse_from
                        )));
                    }
                };

                let parsed: serde_json::Value = serde_json::from_str(raw).map_err(|err| {
                    let _ = self.parse_from.set(entry, original.clone());
                    Error::data(format!("parse json: {err}"))
                })?;

                self.parse_to.set(entry, Value::from(parsed))?;
                if let Some(preserve_to) = &self.preserve_to {
                    preserve_to.set(entry, original)?;
                }
                Ok(())
            })
            .await
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Integer(_) | Value::UInteger(_) => "an integer",
        Value::Float(_) => "a float",
        Value::String(_) => "a string",
        Value::Bytes(_) => "bytes",
        Value::Array(_) => "an array",
        Value::Map(_) => "a map",
    }
}

#[cfg(test)]
mod tests {
    use persist::Store;

    use crate::operator::helper::testing::Collector;

    use super::*;

    fn parser(yaml: &str) -> (Arc<dyn Operator>, Arc<Collector>) {
        let config: JsonParserConfig = serde_yaml::from_str(yaml).unwrap();
        let context = BuildContext::new(Store::stub());
        let parser = config.build(&context).unwrap();

        let collector = Collector::new();
        let candidates: Vec<Arc<dyn Operator>> = vec![collector.clone()];
        parser.set_outputs(&candidates).unwrap();
        (parser, collector)
    }

    fn entry_with_body(body: impl Into<Value>) -> Entry {
        let mut entry = Entry::empty();
        entry.body = body.into();
        entry
    }

    #[tokio::test]
    async fn parses_body_json() {
        let (parser, collector) = parser("output: collector");

        parser
            .process(
                &CancellationToken::new(),
                entry_with_body(r#"{"test":"value"}"#),
            )
            .await
            .unwrap();

        let entries = collector.entries.lock().unwrap();
        assert_eq!(
            entries[0].get(&Field::body(["test"])).unwrap().as_ref(),
            &Value::from("value")
        );
    }

    #[tokio::test]
    async fn parses_nested_field_to_target() {
        let (parser, collector) =
            parser("output: collector\nparse_from: $.raw\nparse_to: $.parsed");

        let mut entry = Entry::empty();
        entry
            .set(&Field::body(["raw"]), r#"{"count": 3}"#)
            .unwrap();

        parser
            .process(&CancellationToken::new(), entry)
            .await
            .unwrap();

        let entries = collector.entries.lock().unwrap();
        assert_eq!(
            entries[0]
                .get(&Field::body(["parsed", "count"]))
                .unwrap()
                .as_ref(),
            &Value::Integer(3)
        );
        // The source field was consumed.
        assert_eq!(entries[0].get(&Field::body(["raw"])), None);
    }

    #[tokio::test]
    async fn preserve_to_keeps_the_original() {
        let (parser, collector) = parser("output: collector\npreserve_to: $.original");

        parser
            .process(&CancellationToken::new(), entry_with_body(r#"{"a":1}"#))
            .await
            .unwrap();

        let entries = collector.entries.lock().unwrap();
        assert_eq!(
            entries[0]
                .get(&Field::body(["original"]))
                .unwrap()
                .as_ref(),
            &Value::from(r#"{"a":1}"#)
        );
    }

    #[tokio::test]
    async fn malformed_json_with_on_error_send_passes_through() {
        let (parser, collector) = parser("output: collector\non_error: send");

        parser
            .process(&CancellationToken::new(), entry_with_body("not json"))
            .await
            .unwrap();

        let entries = collector.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].body, Value::from("not json"));
    }
}
