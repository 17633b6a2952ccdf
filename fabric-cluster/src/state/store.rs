//! Bucketed key-value model store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Entities grouped into buckets by type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStore {
    buckets: BTreeMap<String, BTreeMap<String, Value>>,
}

impl ModelStore {
    /// Look up an entity.
    pub fn get(&self, bucket: &str, key: &str) -> Option<&Value> {
        self.buckets.get(bucket).and_then(|b| b.get(key))
    }

    /// Whether an entity exists.
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.get(bucket, key).is_some()
    }

    /// Ids in a bucket, in order.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of entities in a bucket.
    pub fn len(&self, bucket: &str) -> usize {
        self.buckets.get(bucket).map(BTreeMap::len).unwrap_or(0)
    }

    /// Whether the store holds no entities at all.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(BTreeMap::is_empty)
    }

    /// Start a transaction. Dropping it without [`Transaction::commit`]
    /// discards its writes.
    pub fn begin(&mut self) -> Transaction<'_> {
        Transaction {
            store: self,
            writes: BTreeMap::new(),
        }
    }
}

/// Buffered writes against a [`ModelStore`].
///
/// Reads see the transaction's own writes first.
pub struct Transaction<'a> {
    store: &'a mut ModelStore,
    writes: BTreeMap<(String, String), Option<Value>>,
}

impl Transaction<'_> {
    /// Look up an entity.
    pub fn get(&self, bucket: &str, key: &str) -> Option<&Value> {
        match self.writes.get(&(bucket.to_string(), key.to_string())) {
            Some(pending) => pending.as_ref(),
            None => self.store.get(bucket, key),
        }
    }

    /// Whether an entity exists.
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.get(bucket, key).is_some()
    }

    /// Insert or replace an entity.
    pub fn put(&mut self, bucket: &str, key: &str, value: Value) {
        self.writes
            .insert((bucket.to_string(), key.to_string()), Some(value));
    }

    /// Delete an entity. Returns whether it existed.
    pub fn delete(&mut self, bucket: &str, key: &str) -> bool {
        let existed = self.contains(bucket, key);
        if existed {
            self.writes
                .insert((bucket.to_string(), key.to_string()), None);
        }
        existed
    }

    /// Apply all buffered writes. Returns how many were applied.
    pub fn commit(self) -> usize {
        let count = self.writes.len();
        for ((bucket, key), value) in self.writes {
            match value {
                Some(value) => {
                    self.store
                        .buckets
                        .entry(bucket)
                        .or_default()
                        .insert(key, value);
                }
                None => {
                    if let Some(entries) = self.store.buckets.get_mut(&bucket) {
                        entries.remove(&key);
                        if entries.is_empty() {
                            self.store.buckets.remove(&bucket);
                        }
                    }
                }
            }
        }
        count
    }
}
