use std::sync::{Arc, OnceLock};

use entry::Entry;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::operator::{BuildContext, Operator};

/// Configuration shared by every operator that writes to successors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriterConfig {
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "OutputIds::is_empty")]
    pub output: OutputIds,
}

/// The `output` field: a single id or a list of ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputIds(pub Vec<String>);

impl OutputIds {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for OutputIds {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OutputIds {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::One(id) => OutputIds(vec![id]),
            Raw::Many(ids) => OutputIds(ids),
        })
    }
}

/// Fan-out to resolved successors. The entry is cloned for every
/// successor but the last, which takes ownership.
pub struct Writer {
    output_ids: Vec<String>,
    outputs: OnceLock<Vec<Arc<dyn Operator>>>,
}

impl Writer {
    pub fn build(config: &WriterConfig, context: &BuildContext) -> Writer {
        let output_ids = if config.output.is_empty() {
            context.default_outputs.clone()
        } else {
            config
                .output
                .0
                .iter()
                .map(|id| context.prepend_namespace(id))
                .collect()
        };

        Writer {
            output_ids,
            outputs: OnceLock::new(),
        }
    }

    pub fn output_ids(&self) -> Vec<String> {
        self.output_ids.clone()
    }

    pub fn outputs(&self) -> Vec<Arc<dyn Operator>> {
        self.outputs.get().cloned().unwrap_or_default()
    }

    pub fn set_outputs(&self, candidates: &[Arc<dyn Operator>]) -> Result<(), Error> {
        let mut resolved = Vec::with_capacity(self.output_ids.len());
        for id in &self.output_ids {
            let operator = candidates
                .iter()
                .find(|candidate| candidate.id() == id)
                .ok_or_else(|| Error::config(format!("operator '{id}' does not exist")))?;

            if !operator.can_process() {
                return Err(Error::config(format!(
                    "operator '{id}' can not process entries"
                )));
            }

            resolved.push(operator.clone());
        }

        self.outputs
            .set(resolved)
            .map_err(|_| Error::config("operator outputs were already resolved"))
    }

    /// Writes an entry to every successor. Failures are logged and do not
    /// stop delivery to the remaining successors.
    pub async fn write(&self, ctx: &CancellationToken, entry: Entry) {
        let Some(outputs) = self.outputs.get() else {
            return;
        };

        let Some((last, rest)) = outputs.split_last() else {
            return;
        };

        for operator in rest {
            if let Err(err) = operator.process(ctx, entry.clone()).await {
                tracing::error!(
                    operator_id = operator.id(),
                    operator_type = operator.operator_type(),
                    %err,
                    "failed to write entry"
                );
            }
        }

        if let Err(err) = last.process(ctx, entry).await {
            tracing::error!(
                operator_id = last.id(),
                operator_type = last.operator_type(),
                %err,
                "failed to write entry"
            );
        }
    }
}
