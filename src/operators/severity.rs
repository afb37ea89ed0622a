use std::sync::Arc;

use entry::Entry;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::operator::helper::{
    SeverityParser, SeverityParserConfig, Transformer, TransformerConfig,
};
use crate::operator::{BuildContext, Operator, OperatorConfig};
use crate::Result;

/// Assigns a numeric severity from a field's value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityOperatorConfig {
    #[serde(flatten)]
    transformer: TransformerConfig,

    #[serde(flatten)]
    severity: SeverityParserConfig,
}

#[typetag::serde(name = "severity_parser")]
impl OperatorConfig for SeverityOperatorConfig {
    fn build(&self, context: &BuildContext) -> Result<Arc<dyn Operator>> {
        Ok(Arc::new(SeverityOperator {
            transformer: Transformer::build(&self.transformer, "severity_parser", context),
            parser: self.severity.build(context)?,
        }))
    }

    fn type_name(&self) -> &'static str {
        "severity_parser"
    }

    fn id(&self) -> Option<&str> {
        self.transformer.writer.id.as_deref()
    }

    fn declared_outputs(&self) -> &[String] {
        &self.transformer.writer.output.0
    }
}

struct SeverityOperator {
    transformer: Transformer,
    parser: SeverityParser,
}

#[async_trait::async_trait]
impl Operator for SeverityOperator {
    fn id(&self) -> &str {
        &self.transformer.id
    }

    fn operator_type(&self) -> &'static str {
        "severity_parser"
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
            .process_with(ctx, entry, |entry| self.parser.parse(entry))
            .await
    }
}
