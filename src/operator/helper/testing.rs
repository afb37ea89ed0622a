use std::sync::{Arc, Mutex};

use entry::Entry;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::operator::Operator;

/// A terminal operator that records every entry it receives.
pub struct Collector {
    pub id: String,
    pub entries: Mutex<Vec<Entry>>,
}

impl Collector {
    pub fn new() -> Arc<Collector> {
        Collector::with_id("$.collector")
    }

    pub fn with_id(id: &str) -> Arc<Collector> {
        Arc::new(Collector {
            id: id.to_owned(),
            entries: Mutex::new(Vec::new()),
        })
    }

    pub fn collected(&self) -> Vec<Entry> {
        self.entries.lock().expect("collector lock").clone()
    }
}

#[async_trait::async_trait]
impl Operator for Collector {
    fn id(&self) -> &str {
        &self.id
    }

    fn operator_type(&self) -> &'static str {
        "collector"
    }

    fn can_output(&self) -> bool {
        false
    }

    async fn process(&self, _ctx: &CancellationToken, entry: Entry) -> Result<()> {
        self.entries.lock().expect("collector lock").push(entry);
        Ok(())
    }
}
