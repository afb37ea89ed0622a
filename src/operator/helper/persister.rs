use std::collections::HashMap;
use std::sync::Mutex;

use persist::Store;

use crate::Result;

/// Top-level bucket holding one child bucket of offsets per input
/// operator id.
pub const OFFSETS_BUCKET: &str = "offsets";

/// Write-through cache over an input operator's offset bucket. Reads and
/// writes hit the in-memory map; `sync` persists the map and `load`
/// replaces it from disk.
pub struct Persister {
    store: Store,
    scope: String,
    cache: Mutex<HashMap<String, Vec<u8>>>,
}

impl Persister {
    pub fn new(store: Store, scope: &str) -> Persister {
        Persister {
            store,
            scope: scope.to_owned(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.cache.lock().expect("persister lock").get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Vec<u8>) {
        self.cache
            .lock()
            .expect("persister lock")
            .insert(key.to_owned(), value);
    }

    /// Persists the cache, creating the scoped bucket as needed.
    pub fn sync(&self) -> Result<()> {
        let cache = self.cache.lock().expect("persister lock").clone();
        self.store.update(|txn| {
            let bucket = txn.bucket(OFFSETS_BUCKET)?.child(&self.scope)?;
            for (key, value) in &cache {
                bucket.put(key.as_bytes(), value)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Replaces the cache with the persisted offsets.
    pub fn load(&self) -> Result<()> {
        let mut loaded = HashMap::new();
        self.store.update(|txn| {
            let bucket = txn.bucket(OFFSETS_BUCKET)?.child(&self.scope)?;
            for (key, value) in bucket.entries()? {
                loaded.insert(String::from_utf8_lossy(&key).into_owned(), value);
            }
            Ok(())
        })?;

        *self.cache.lock().expect("persister lock") = loaded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_survive_a_sync_load_cycle() {
        let store = Store::open(&testify::temp_dir().join("agent.db")).unwrap();

        let persister = Persister::new(store.clone(), "$.file_input");
        persister.set("access.log", b"1024".to_vec());
        persister.sync().unwrap();

        let fresh = Persister::new(store, "$.file_input");
        fresh.load().unwrap();
        assert_eq!(fresh.get("access.log"), Some(b"1024".to_vec()));
    }

    #[test]
    fn scopes_are_isolated() {
        let store = Store::open(&testify::temp_dir().join("agent.db")).unwrap();

        let first = Persister::new(store.clone(), "$.one");
        first.set("k", b"1".to_vec());
        first.sync().unwrap();

        let second = Persister::new(store, "$.two");
        second.load().unwrap();
        assert_eq!(second.get("k"), None);
    }

    #[test]
    fn stub_store_loads_empty() {
        let persister = Persister::new(Store::stub(), "$.op");
        persister.set("k", b"v".to_vec());
        persister.sync().unwrap();
        persister.load().unwrap();
        // The stub persists nothing; load clears the cache.
        assert_eq!(persister.get("k"), None);
    }
}
