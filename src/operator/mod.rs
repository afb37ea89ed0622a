pub mod helper;

use std::fmt::Debug;
use std::sync::Arc;

use entry::Entry;
use persist::Store;
use tokio_util::sync::CancellationToken;

use crate::Error;

/// A unit of work in the pipeline. Inputs produce entries, transformers
/// rewrite them, outputs deliver them; the pipeline wires them into a
/// directed acyclic graph and drives their lifecycle.
#[async_trait::async_trait]
pub trait Operator: Send + Sync {
    /// Namespaced id, unique within the pipeline (`$.my_parser`).
    fn id(&self) -> &str;

    /// Registered type name (`json_parser`).
    fn operator_type(&self) -> &'static str;

    /// Whether this operator accepts entries from predecessors. Inputs
    /// return false.
    fn can_process(&self) -> bool {
        true
    }

    /// Handles one entry on the caller's task.
    async fn process(&self, ctx: &CancellationToken, entry: Entry) -> Result<(), Error>;

    /// Whether this operator sends entries onward. Outputs return false.
    fn can_output(&self) -> bool {
        true
    }

    /// Ids of declared successors, namespaced.
    fn output_ids(&self) -> Vec<String> {
        Vec::new()
    }

    /// Resolved successors, once `set_outputs` ran.
    fn outputs(&self) -> Vec<Arc<dyn Operator>> {
        Vec::new()
    }

    /// Resolves declared output ids against the pipeline's operators.
    fn set_outputs(&self, _candidates: &[Arc<dyn Operator>]) -> Result<(), Error> {
        Ok(())
    }

    /// Starts background work. Called in reverse topological order, so
    /// every successor is running before its producers start.
    async fn start(&self, _shutdown: CancellationToken) -> Result<(), Error> {
        Ok(())
    }

    /// Stops the operator. Called in topological order, so producers quit
    /// before their consumers tear down.
    async fn stop(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Everything an operator config needs to build its operator.
#[derive(Clone)]
pub struct BuildContext {
    /// The agent's persistence store, for offset tracking.
    pub store: Store,

    /// Namespace for operator ids; `$` at the top level, `$.<plugin_id>`
    /// inside a plugin instance.
    pub namespace: String,

    /// Output ids to use when a config declares none: the next operator
    /// in the pipeline, already namespaced.
    pub default_outputs: Vec<String>,
}

impl BuildContext {
    pub fn new(store: Store) -> BuildContext {
        BuildContext {
            store,
            namespace: "$".to_owned(),
            default_outputs: Vec::new(),
        }
    }

    /// Qualifies a bare id with the namespace: `my_parser` becomes
    /// `$.my_parser`. Ids that already carry a namespace pass through.
    pub fn prepend_namespace(&self, id: &str) -> String {
        if id.starts_with("$.") || id == "$" {
            return id.to_owned();
        }
        format!("{}.{}", self.namespace, id)
    }

    pub fn with_default_outputs(&self, default_outputs: Vec<String>) -> BuildContext {
        BuildContext {
            default_outputs,
            ..self.clone()
        }
    }
}

/// A deserialized operator configuration. The `type` field in the config
/// document picks the implementation through the process-wide registry
/// that `typetag` assembles before `main` runs; the registry is frozen by
/// the time any pipeline is built.
#[typetag::serde(tag = "type")]
pub trait OperatorConfig: Debug + Send + Sync {
    /// Builds the operator. `context` carries the namespace and default
    /// outputs resolved by the pipeline.
    fn build(&self, context: &BuildContext) -> Result<Arc<dyn Operator>, Error>;

    /// The registered type name; used as the default id.
    fn type_name(&self) -> &'static str;

    /// The explicit `id` field, if the user set one. Defaults to the
    /// operator type.
    fn id(&self) -> Option<&str>;

    /// The declared `output` list, un-namespaced.
    fn declared_outputs(&self) -> &[String];

    /// Whether the built operator has no successors; such operators never
    /// receive a defaulted output.
    fn is_output(&self) -> bool {
        false
    }
}
