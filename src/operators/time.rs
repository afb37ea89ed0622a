use std::sync::Arc;

use entry::Entry;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::operator::helper::{TimeParser, TimeParserConfig, Transformer, TransformerConfig};
use crate::operator::{BuildContext, Operator, OperatorConfig};
use crate::Result;

/// Sets the entry timestamp from a field's value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeOperatorConfig {
    #[serde(flatten)]
    transformer: TransformerConfig,

    #[serde(flatten)]
    time: TimeParserConfig,
}

#[typetag::serde(name = "time_parser")]
impl OperatorConfig for TimeOperatorConfig {
    fn build(&self, context: &BuildContext) -> Result<Arc<dyn Operator>> {
        Ok(Arc::new(TimeOperator {
            transformer: Transformer::build(&self.transformer, "time_parser", context),
            parser: self.time.build(context)?,
        }))
    }

    fn type_name(&self) -> &'static str {
        "time_parser"
    }

    fn id(&self) -> Option<&str> {
        self.transformer.writer.id.as_deref()
    }

    fn declared_outputs(&self) -> &[String] {
        &self.transformer.writer.output.0
    }
}

struct TimeOperator {
    transformer: Transformer,
    parser: TimeParser,
}

#[async_trait::async_trait]
impl Operator for TimeOperator {
    fn id(&self) -> &str {
        &self.transformer.id
    }

    fn operator_type(&self) -> &'static str {
        "time_parser"
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
