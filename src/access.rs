// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-node tuple cache interface and an in-memory implementation.
//!
//! The RM reads through this cache: a hit serves the operation locally, a
//! miss triggers a DSB read whose result is inserted back on arrival.

use dashmap::DashMap;

use crate::{ShardId, TableId, Tuple, TupleId};

/// Shared tuple cache. Implementations must be internally thread-safe.
pub trait AccessCache: Send + Sync {
    /// Look up a cached tuple.
    fn get(&self, table_id: TableId, shard_id: ShardId, key: TupleId) -> Option<Tuple>;

    /// Insert or replace a cached tuple.
    fn put(&self, table_id: TableId, shard_id: ShardId, key: TupleId, tuple: Tuple);
}

/// Concurrent in-memory tuple cache.
#[derive(Default)]
pub struct MemoryAccessCache {
    tuples: DashMap<(TableId, ShardId, TupleId), Tuple>,
}

impl MemoryAccessCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }
}

impl AccessCache for MemoryAccessCache {
    fn get(&self, table_id: TableId, shard_id: ShardId, key: TupleId) -> Option<Tuple> {
        self.tuples
            .get(&(table_id, shard_id, key))
            .map(|t| t.clone())
    }

    fn put(&self, table_id: TableId, shard_id: ShardId, key: TupleId, tuple: Tuple) {
        self.tuples.insert((table_id, shard_id, key), tuple);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_returns_none() {
        let cache = MemoryAccessCache::new();
        assert!(cache.get(1, 1, 7).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_then_get() {
        let cache = MemoryAccessCache::new();
        cache.put(1, 1, 7, vec![1, 2, 3]);
        assert_eq!(cache.get(1, 1, 7), Some(vec![1, 2, 3]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_put_replaces() {
        let cache = MemoryAccessCache::new();
        cache.put(1, 1, 7, vec![1]);
        cache.put(1, 1, 7, vec![2]);
        assert_eq!(cache.get(1, 1, 7), Some(vec![2]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_keys_are_scoped_by_table_and_shard() {
        let cache = MemoryAccessCache::new();
        cache.put(1, 1, 7, vec![1]);
        assert!(cache.get(2, 1, 7).is_none());
        assert!(cache.get(1, 2, 7).is_none());
    }
}
