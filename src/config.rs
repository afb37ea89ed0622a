use std::path::Path;

use persist::Store;
use serde::{Deserialize, Serialize};

use crate::operator::{BuildContext, OperatorConfig};
use crate::pipeline::Pipeline;
use crate::{Error, Result};

/// The agent configuration document: an ordered list of operator configs.
///
/// ```yaml
/// pipeline:
///   - type: generate_input
///     entry:
///       test: value
///     count: 1
///   - type: json_parser
///   - type: stdout
/// ```
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub pipeline: Vec<Box<dyn OperatorConfig>>,
}

impl Config {
    pub fn from_str(raw: &str) -> Result<Config> {
        serde_yaml::from_str(raw).map_err(|err| Error::config(format!("parse config: {err}")))
    }

    pub fn from_path(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::config(format!("read config {}: {err}", path.display()))
        })?;
        Config::from_str(&raw)
    }

    pub fn build_pipeline(&self, store: Store) -> Result<Pipeline> {
        Pipeline::build(&self.pipeline, &BuildContext::new(store))
    }
}
