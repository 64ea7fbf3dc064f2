//! Disk-backed adjacency store: an LSM-style key-value substrate (via
//! `redb`) fronted by an LRU cache, for graphs whose adjacency lists may
//! exceed memory.
//!
//! Two tables, one per direction — nodes, edges, and labels stay
//! core-owned in-memory state regardless of this backend; only the
//! outgoing/incoming adjacency lists move to disk. Keys are
//! big-endian-packed byte strings so table scans return entries in the
//! same order the original flat-keyspace design would.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::error::Result;

const OUTGOING: TableDefinition<&[u8], ()> = TableDefinition::new("outgoing");
const INCOMING: TableDefinition<&[u8], ()> = TableDefinition::new("incoming");

pub const DEFAULT_EDGE_CACHE_SIZE: usize = 10_000;

/// One endpoint of an adjacency entry: the edge id and the node at the
/// other end of that edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjEntry {
    pub edge_id: u64,
    pub peer: u64,
}

fn adjacency_key(node: u64, peer: u64, edge_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&node.to_be_bytes());
    key.extend_from_slice(&peer.to_be_bytes());
    key.extend_from_slice(&edge_id.to_be_bytes());
    key
}

fn adjacency_prefix(node: u64) -> Vec<u8> {
    node.to_be_bytes().to_vec()
}

fn adjacency_range(node: u64) -> (Vec<u8>, Vec<u8>) {
    let mut lo = adjacency_prefix(node);
    lo.extend_from_slice(&[0u8; 16]);
    let mut hi = adjacency_prefix(node);
    hi.extend_from_slice(&[0xffu8; 16]);
    (lo, hi)
}

fn decode_adjacency_key(key: &[u8]) -> AdjEntry {
    let peer = u64::from_be_bytes(key[8..16].try_into().unwrap());
    let edge_id = u64::from_be_bytes(key[16..24].try_into().unwrap());
    AdjEntry { edge_id, peer }
}

pub struct EdgeStore {
    db: Database,
    out_cache: Mutex<LruCache<u64, Arc<Vec<AdjEntry>>>>,
    in_cache: Mutex<LruCache<u64, Arc<Vec<AdjEntry>>>>,
}

impl EdgeStore {
    pub fn open(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let db = Database::create(path)?;
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(OUTGOING)?;
            write_txn.open_table(INCOMING)?;
            write_txn.commit()?;
        }
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap();
        Ok(EdgeStore {
            db,
            out_cache: Mutex::new(LruCache::new(capacity)),
            in_cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    fn scan_adjacency(&self, table_def: TableDefinition<&[u8], ()>, node: u64) -> Result<Vec<AdjEntry>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(table_def)?;
        let (lo, hi) = adjacency_range(node);
        let mut out = Vec::new();
        for entry in table.range(lo.as_slice()..=hi.as_slice())? {
            let (key, _) = entry?;
            out.push(decode_adjacency_key(key.value()));
        }
        Ok(out)
    }

    pub fn get_outgoing(&self, node: u64) -> Result<Arc<Vec<AdjEntry>>> {
        let mut cache = self.out_cache.lock().unwrap();
        if let Some(hit) = cache.get(&node) {
            return Ok(Arc::clone(hit));
        }
        let entries = Arc::new(self.scan_adjacency(OUTGOING, node)?);
        cache.put(node, Arc::clone(&entries));
        Ok(entries)
    }

    pub fn get_incoming(&self, node: u64) -> Result<Arc<Vec<AdjEntry>>> {
        let mut cache = self.in_cache.lock().unwrap();
        if let Some(hit) = cache.get(&node) {
            return Ok(Arc::clone(hit));
        }
        let entries = Arc::new(self.scan_adjacency(INCOMING, node)?);
        cache.put(node, Arc::clone(&entries));
        Ok(entries)
    }

    /// Replaces the full outgoing-adjacency prefix for `node` atomically,
    /// with the cache lock held across the commit so concurrent readers
    /// never observe a state between "old rows committed" and "cache
    /// updated".
    pub fn store_outgoing(&self, node: u64, entries: &[AdjEntry]) -> Result<()> {
        let mut cache = self.out_cache.lock().unwrap();
        self.replace_adjacency(OUTGOING, node, entries)?;
        cache.put(node, Arc::new(entries.to_vec()));
        Ok(())
    }

    pub fn store_incoming(&self, node: u64, entries: &[AdjEntry]) -> Result<()> {
        let mut cache = self.in_cache.lock().unwrap();
        self.replace_adjacency(INCOMING, node, entries)?;
        cache.put(node, Arc::new(entries.to_vec()));
        Ok(())
    }

    fn replace_adjacency(
        &self,
        table_def: TableDefinition<&[u8], ()>,
        node: u64,
        entries: &[AdjEntry],
    ) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table_def)?;
            let (lo, hi) = adjacency_range(node);
            let stale: Vec<Vec<u8>> = table
                .range(lo.as_slice()..=hi.as_slice())?
                .filter_map(|r| r.ok())
                .map(|(k, _)| k.value().to_vec())
                .collect();
            for key in stale {
                table.remove(key.as_slice())?;
            }
            for entry in entries {
                let key = adjacency_key(node, entry.peer, entry.edge_id);
                table.insert(key.as_slice(), ())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Flushes cache state and releases LSM resources. `redb` persists on
    /// every commit, so there is no separate durable-flush step here
    /// beyond dropping the cached adjacency lists.
    pub fn close(&self) -> Result<()> {
        self.out_cache.lock().unwrap().clear();
        self.in_cache.lock().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn store_and_get_outgoing_roundtrips() {
        let dir = tempdir().unwrap();
        let store = EdgeStore::open(dir.path().join("edges.redb"), 10).unwrap();
        let entries = vec![
            AdjEntry { edge_id: 1, peer: 2 },
            AdjEntry { edge_id: 2, peer: 3 },
        ];
        store.store_outgoing(1, &entries).unwrap();
        let got = store.get_outgoing(1).unwrap();
        assert_eq!(got.len(), 2);
        assert!(got.contains(&AdjEntry { edge_id: 1, peer: 2 }));
        assert!(got.contains(&AdjEntry { edge_id: 2, peer: 3 }));
    }

    #[test]
    fn store_outgoing_replaces_previous_entries() {
        let dir = tempdir().unwrap();
        let store = EdgeStore::open(dir.path().join("edges.redb"), 10).unwrap();
        store
            .store_outgoing(1, &[AdjEntry { edge_id: 1, peer: 2 }])
            .unwrap();
        store
            .store_outgoing(1, &[AdjEntry { edge_id: 5, peer: 9 }])
            .unwrap();
        let got = store.get_outgoing(1).unwrap();
        assert_eq!(got.as_slice(), &[AdjEntry { edge_id: 5, peer: 9 }]);
    }

    #[test]
    fn cache_eviction_does_not_corrupt_subsequent_reads() {
        let dir = tempdir().unwrap();
        let store = EdgeStore::open(dir.path().join("edges.redb"), 2).unwrap();
        for node in 0..5u64 {
            store
                .store_outgoing(node, &[AdjEntry { edge_id: node, peer: node + 100 }])
                .unwrap();
        }
        for node in 0..5u64 {
            let got = store.get_outgoing(node).unwrap();
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].edge_id, node);
        }
    }
}
