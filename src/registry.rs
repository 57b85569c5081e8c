use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::ingest::{MetaValue, Metadata};

/// Every string metadata value observed during ingestion, by key. Monotonic
/// for the process lifetime; the search tool's advertised schema constrains
/// each metadata field to an enum drawn from here. Numeric chunk bookkeeping
/// is excluded.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    values: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, metadata: &Metadata) {
        let mut values = self.values.lock().expect("metadata registry poisoned");
        for (key, value) in metadata {
            if let MetaValue::Str(s) = value {
                values.entry(key.clone()).or_default().insert(s.clone());
            }
        }
    }

    /// Key → sorted values, for schema generation and validation.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.values
            .lock()
            .expect("metadata registry poisoned")
            .iter()
            .map(|(k, vs)| (k.clone(), vs.iter().cloned().collect()))
            .collect()
    }

    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.values
            .lock()
            .expect("metadata registry poisoned")
            .get(key)
            .is_some_and(|vs| vs.contains(value))
    }
}
