use std::collections::BTreeMap;
use std::sync::Arc;

use entry::{Entry, Field, Value};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::operator::helper::{Transformer, TransformerConfig};
use crate::operator::{BuildContext, Operator, OperatorConfig};
use crate::{Error, Result};

/// Parses a string field with a regular expression, mapping named capture
/// groups to keys of the target map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegexParserConfig {
    #[serde(flatten)]
    transformer: TransformerConfig,

    regex: String,

    #[serde(default)]
    parse_from: Field,

    #[serde(default)]
    parse_to: Field,

    preserve_to: Option<Field>,
}

#[typetag::serde(name = "regex_parser")]
impl OperatorConfig for RegexParserConfig {
    fn build(&self, context: &BuildContext) -> Result<Arc<dyn Operator>> {
        let regex = regex::Regex::new(&self.regex)
            .map_err(|err| Error::config(format!("compile regex: {err}")))?;

        if regex.capture_names().flatten().next().is_none() {
            return Err(Error::config(
                "regex must contain at least one named capture group like (?P<name>...)",
            ));
        }

        Ok(Arc::new(RegexParser {
            transformer: Transformer::build(&self.transformer, "regex_parser", context),
            regex,
            parse_from: self.parse_from.clone(),
            parse_to: self.parse_to.clone(),
            preserve_to: self.preserve_to.clone(),
        }))
    }

    fn type_name(&self) -> &'static str {
        "regex_parser"
    }

    fn id(&self) -> Option<&str> {
        self.transformer.writer.id.as_deref()
    }

    fn declared_outputs(&self) -> &[String] {
        &self.transformer.writer.output.0
    }
}

struct RegexParser {
    transformer: Transformer,
    regex: regex::Regex,
    parse_from: Field,
    parse_to: Field,
    preserve_to: Option<Field>,
}

#[async_trait::async_trait]
impl Operator for RegexParser {
    fn id(&self) -> &str {
        &self.transformer.id
    }

    fn operator_type(&self) -> &'static str {
        "regex_parser"
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
                let original = self.parse_from.delete(entry).ok_or_else(|| {
                    Error::data(format!("field {} is not present", self.parse_from))
                })?;

                let raw = original.coerce_string();
                let captures = match self.regex.captures(&raw) {
                    Some(captures) => captures,
                    None => {
                        let _ = self.parse_from.set(entry, original.clone());
                        return Err(Error::data(format!(
                            "regex pattern does not match field {}",
                            self.parse_from
                        )));
                    }
                };

                let mut parsed = BTreeMap::new();
                for name in self.regex.capture_names().flatten() {
                    if let Some(capture) = captures.name(name) {
                        parsed.insert(
                            name.to_owned(),
                            Value::String(capture.as_str().to_owned()),
                        );
                    }
                }

                self.parse_to.set(entry, Value::Map(parsed))?;
                if let Some(preserve_to) = &self.preserve_to {
                    preserve_to.set(entry, original)?;
                }
                Ok(())
            })
            .await
    }
}
