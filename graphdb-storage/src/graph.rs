//! The graph core: owns every node and edge, their derived indexes, and
//! ties the WAL, EdgeStore, property indexes, and vector indexes
//! together into the public `GraphDb` engine.
//!
//! Concurrency: `mu` is a single `RwLock` guarding the whole in-memory
//! state — the coarse lock the spec allows implementers to prefer over
//! fine-grained locking until contention proves otherwise. `shard_locks`
//! layers an additional per-node lock on top for the single-node
//! adjacency reads (`GetOutgoingEdges`/`GetIncomingEdges`), matching the
//! spec's "readers that touch only a single node's adjacency may use the
//! shard lock" carve-out without weakening `mu`'s own guarantees.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use fs2::FileExt;
use graphdb_api::{Edge, Node, Statistics, Value};
use indexmap::IndexSet;

use crate::config::GraphDbConfig;
use crate::edge_store::{AdjEntry, EdgeStore};
use crate::adjacency::CompressedAdjacency;
use crate::error::{Error, Result};
use crate::property_index::PropertyIndexManager;
use crate::shard_lock::ShardLocks;
use crate::snapshot::{self, EncryptionEngine, SnapshotContent};
use crate::stats::Stats;
use crate::vector_index::VectorIndexManager;
use crate::wal::{BatchedWal, CompressedWal, NoopWal, PlainWal, WalOp, WalWriter};

#[derive(Debug, Default)]
struct MemoryAdjacency {
    outgoing_pending: HashMap<u64, Vec<u64>>,
    outgoing_compressed: HashMap<u64, CompressedAdjacency>,
    incoming_pending: HashMap<u64, Vec<u64>>,
    incoming_compressed: HashMap<u64, CompressedAdjacency>,
}

fn merged_sorted(pending: Option<&Vec<u64>>, compressed: Option<&CompressedAdjacency>) -> Vec<u64> {
    match (pending, compressed) {
        (Some(p), Some(c)) => c.merged_with(p),
        (Some(p), None) => {
            let mut v = p.clone();
            v.sort_unstable();
            v.dedup();
            v
        }
        (None, Some(c)) => c.decompress(),
        (None, None) => Vec::new(),
    }
}

impl MemoryAdjacency {
    fn get_outgoing(&self, node: u64) -> Vec<u64> {
        merged_sorted(
            self.outgoing_pending.get(&node),
            self.outgoing_compressed.get(&node),
        )
    }

    fn get_incoming(&self, node: u64) -> Vec<u64> {
        merged_sorted(
            self.incoming_pending.get(&node),
            self.incoming_compressed.get(&node),
        )
    }

    fn add_outgoing(&mut self, node: u64, edge_id: u64) {
        self.outgoing_pending.entry(node).or_default().push(edge_id);
    }

    fn add_incoming(&mut self, node: u64, edge_id: u64) {
        self.incoming_pending.entry(node).or_default().push(edge_id);
    }

    fn remove_outgoing(&mut self, node: u64, edge_id: u64) {
        let mut ids = self.get_outgoing(node);
        ids.retain(|&x| x != edge_id);
        self.outgoing_compressed.remove(&node);
        if ids.is_empty() {
            self.outgoing_pending.remove(&node);
        } else {
            self.outgoing_pending.insert(node, ids);
        }
    }

    fn remove_incoming(&mut self, node: u64, edge_id: u64) {
        let mut ids = self.get_incoming(node);
        ids.retain(|&x| x != edge_id);
        self.incoming_compressed.remove(&node);
        if ids.is_empty() {
            self.incoming_pending.remove(&node);
        } else {
            self.incoming_pending.insert(node, ids);
        }
    }

    /// Compresses every outstanding adjacency list and empties the
    /// pending vectors, per the snapshot-time memory-reduction pass.
    fn compress_all(&mut self) {
        let nodes: Vec<u64> = self.outgoing_pending.keys().copied().collect();
        for node in nodes {
            let ids = self.get_outgoing(node);
            self.outgoing_compressed
                .insert(node, CompressedAdjacency::compress(&ids));
        }
        self.outgoing_pending.clear();

        let nodes: Vec<u64> = self.incoming_pending.keys().copied().collect();
        for node in nodes {
            let ids = self.get_incoming(node);
            self.incoming_compressed
                .insert(node, CompressedAdjacency::compress(&ids));
        }
        self.incoming_pending.clear();
    }

    /// Drops the node's own outgoing/incoming entries outright. Called
    /// once a node's incident edges have already been unlinked from
    /// their other endpoints, so nothing but this node's own now-stale
    /// adjacency rows remains to reclaim.
    fn forget_node(&mut self, node: u64) {
        self.outgoing_pending.remove(&node);
        self.outgoing_compressed.remove(&node);
        self.incoming_pending.remove(&node);
        self.incoming_compressed.remove(&node);
    }
}

enum Adjacency {
    Memory(MemoryAdjacency),
    Disk(EdgeStore),
}

impl Adjacency {
    fn get_outgoing(&self, node: u64) -> Result<Vec<u64>> {
        match self {
            Adjacency::Memory(m) => Ok(m.get_outgoing(node)),
            Adjacency::Disk(store) => Ok(store.get_outgoing(node)?.iter().map(|e| e.edge_id).collect()),
        }
    }

    fn get_incoming(&self, node: u64) -> Result<Vec<u64>> {
        match self {
            Adjacency::Memory(m) => Ok(m.get_incoming(node)),
            Adjacency::Disk(store) => Ok(store.get_incoming(node)?.iter().map(|e| e.edge_id).collect()),
        }
    }

    fn add_outgoing(&mut self, node: u64, edge_id: u64, peer: u64) -> Result<()> {
        match self {
            Adjacency::Memory(m) => {
                m.add_outgoing(node, edge_id);
                Ok(())
            }
            Adjacency::Disk(store) => {
                let mut entries = store.get_outgoing(node)?.as_ref().clone();
                entries.push(AdjEntry { edge_id, peer });
                store.store_outgoing(node, &entries)
            }
        }
    }

    fn add_incoming(&mut self, node: u64, edge_id: u64, peer: u64) -> Result<()> {
        match self {
            Adjacency::Memory(m) => {
                m.add_incoming(node, edge_id);
                Ok(())
            }
            Adjacency::Disk(store) => {
                let mut entries = store.get_incoming(node)?.as_ref().clone();
                entries.push(AdjEntry { edge_id, peer });
                store.store_incoming(node, &entries)
            }
        }
    }

    fn remove_outgoing(&mut self, node: u64, edge_id: u64) -> Result<()> {
        match self {
            Adjacency::Memory(m) => {
                m.remove_outgoing(node, edge_id);
                Ok(())
            }
            Adjacency::Disk(store) => {
                let entries: Vec<AdjEntry> = store
                    .get_outgoing(node)?
                    .iter()
                    .copied()
                    .filter(|e| e.edge_id != edge_id)
                    .collect();
                store.store_outgoing(node, &entries)
            }
        }
    }

    fn remove_incoming(&mut self, node: u64, edge_id: u64) -> Result<()> {
        match self {
            Adjacency::Memory(m) => {
                m.remove_incoming(node, edge_id);
                Ok(())
            }
            Adjacency::Disk(store) => {
                let entries: Vec<AdjEntry> = store
                    .get_incoming(node)?
                    .iter()
                    .copied()
                    .filter(|e| e.edge_id != edge_id)
                    .collect();
                store.store_incoming(node, &entries)
            }
        }
    }

    fn compress_all(&mut self) {
        if let Adjacency::Memory(m) = self {
            m.compress_all();
        }
    }

    /// Discards a deleted node's own outgoing/incoming rows. Must be
    /// called only after every incident edge has already been unlinked
    /// from its other endpoint, or it would silently drop live edges.
    fn forget_node(&mut self, node: u64) -> Result<()> {
        match self {
            Adjacency::Memory(m) => {
                m.forget_node(node);
                Ok(())
            }
            Adjacency::Disk(store) => {
                store.store_outgoing(node, &[])?;
                store.store_incoming(node, &[])
            }
        }
    }

    fn full_adjacency_for_snapshot(&self, nodes: impl Iterator<Item = u64>) -> Result<(HashMap<u64, Vec<u64>>, HashMap<u64, Vec<u64>>)> {
        let mut outgoing = HashMap::new();
        let mut incoming = HashMap::new();
        for node in nodes {
            let out = self.get_outgoing(node)?;
            if !out.is_empty() {
                outgoing.insert(node, out);
            }
            let inc = self.get_incoming(node)?;
            if !inc.is_empty() {
                incoming.insert(node, inc);
            }
        }
        Ok((outgoing, incoming))
    }
}

struct GraphState {
    nodes: HashMap<u64, Node>,
    edges: HashMap<u64, Edge>,
    nodes_by_label: HashMap<String, IndexSet<u64>>,
    edges_by_type: HashMap<String, IndexSet<u64>>,
    adjacency: Adjacency,
    property_indexes: PropertyIndexManager,
    next_node_id: u64,
    next_edge_id: u64,
}

impl GraphState {
    fn allocate_node_id(&mut self) -> Result<u64> {
        if self.next_node_id == u64::MAX {
            return Err(Error::IdExhausted);
        }
        let id = self.next_node_id;
        self.next_node_id += 1;
        Ok(id)
    }

    fn allocate_edge_id(&mut self) -> Result<u64> {
        if self.next_edge_id == u64::MAX {
            return Err(Error::IdExhausted);
        }
        let id = self.next_edge_id;
        self.next_edge_id += 1;
        Ok(id)
    }

    fn observe_node_id(&mut self, id: u64) {
        if id >= self.next_node_id {
            self.next_node_id = id + 1;
        }
    }

    fn observe_edge_id(&mut self, id: u64) {
        if id >= self.next_edge_id {
            self.next_edge_id = id + 1;
        }
    }
}

/// Engine configuration plus a handle to the data directory's background
/// flusher thread. Constructed by [`GraphDb::open`].
pub struct GraphDb {
    config: GraphDbConfig,
    state: RwLock<GraphState>,
    shard_locks: ShardLocks,
    stats: Stats,
    wal: Arc<dyn WalWriter>,
    vector_indexes: VectorIndexManager,
    encryption_engine: Option<Arc<dyn EncryptionEngine>>,
    closed: AtomicBool,
    flusher: Mutex<Option<JoinHandle<()>>>,
    flusher_stop: Arc<(Mutex<bool>, Condvar)>,
    /// Held for the lifetime of the engine; an OS advisory lock (not a
    /// lockfile-exists check), so it is released automatically if the
    /// process dies without calling `close`, letting a later `open` of
    /// the same directory succeed after a crash while still rejecting a
    /// second *live* process on the same directory.
    _directory_lock: File,
}

fn check_index_type(props: &BTreeMap<String, Value>, indexes: &PropertyIndexManager) -> Result<()> {
    for (key, value) in props {
        if let Some(index) = indexes.get(key) {
            if index.value_tag() != value.tag_byte() {
                let declared = graphdb_api::tag_name(index.value_tag()).unwrap_or("unknown");
                return Err(Error::InvalidArgument(format!(
                    "property {key:?} is indexed as {declared}, got {}",
                    value.type_name()
                )));
            }
        }
    }
    Ok(())
}

impl GraphDb {
    pub fn open(config: GraphDbConfig) -> Result<Self> {
        let data_dir = config.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;
        set_dir_permissions(&data_dir)?;

        let lock_path = data_dir.join(".lock");
        let directory_lock = acquire_directory_lock(&lock_path)?;

        let wal_dir = data_dir.join("wal");
        std::fs::create_dir_all(&wal_dir)?;
        set_dir_permissions(&wal_dir)?;
        let wal_path = wal_dir.join("wal.log");

        let wal: Arc<dyn WalWriter> = if config.bulk_import_mode {
            Arc::new(NoopWal::new())
        } else if config.enable_compression {
            Arc::new(CompressedWal::open(&wal_path)?)
        } else if config.enable_batching {
            Arc::new(BatchedWal::open(&wal_path, config.batch_size, config.flush_interval)?)
        } else {
            Arc::new(PlainWal::open(&wal_path)?)
        };

        let adjacency = if config.use_disk_backed_edges {
            let edge_dir = data_dir.join("edgestore");
            if edge_dir.exists() {
                std::fs::remove_dir_all(&edge_dir)?;
            }
            std::fs::create_dir_all(&edge_dir)?;
            Adjacency::Disk(EdgeStore::open(edge_dir.join("edges.redb"), config.edge_cache_size)?)
        } else {
            Adjacency::Memory(MemoryAdjacency::default())
        };

        let stats = Stats::new();
        let mut state = GraphState {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            nodes_by_label: HashMap::new(),
            edges_by_type: HashMap::new(),
            adjacency,
            property_indexes: PropertyIndexManager::new(),
            next_node_id: 1,
            next_edge_id: 1,
        };

        let encryption_engine = config.encryption_engine.clone();
        if let Some(content) = snapshot::load(&data_dir, encryption_engine.as_ref())? {
            apply_snapshot(&mut state, content, &stats)?;
        }

        for (lsn, op) in wal.replay()? {
            let _ = lsn;
            apply_wal_op(&mut state, &stats, op)?;
        }

        let vector_indexes = VectorIndexManager::new(&data_dir);

        let db = GraphDb {
            config,
            state: RwLock::new(state),
            shard_locks: ShardLocks::new(),
            stats,
            wal,
            vector_indexes,
            encryption_engine,
            closed: AtomicBool::new(false),
            flusher: Mutex::new(None),
            flusher_stop: Arc::new((Mutex::new(false), Condvar::new())),
            _directory_lock: directory_lock,
        };
        db.spawn_flusher_if_needed();
        Ok(db)
    }

    /// Spawns the background flusher thread for WAL variants that buffer
    /// entries (currently only `BatchedWal`). The thread wakes every
    /// `flush_interval`, or immediately when `close` signals
    /// `flusher_stop`, and performs a durable flush each time.
    fn spawn_flusher_if_needed(&self) {
        let Some(interval) = self.wal.flush_interval() else {
            return;
        };
        let wal = Arc::clone(&self.wal);
        let stop = Arc::clone(&self.flusher_stop);
        let handle = std::thread::spawn(move || {
            let (lock, cvar) = &*stop;
            loop {
                let guard = lock.lock().unwrap();
                let (guard, _timeout) = cvar.wait_timeout(guard, interval).unwrap();
                let should_stop = *guard;
                drop(guard);
                if should_stop {
                    break;
                }
                let _ = wal.flush();
            }
        });
        *self.flusher.lock().unwrap() = Some(handle);
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn record_mutation_wal(&self, op: WalOp) -> Result<u64> {
        self.wal.append(op)
    }

    // ---- Node operations ----

    pub fn create_node(&self, labels: Vec<String>, properties: BTreeMap<String, Value>) -> Result<Node> {
        self.check_open()?;
        let mut state = self.state.write().unwrap();
        check_index_type(&properties, &state.property_indexes)?;
        let id = state.allocate_node_id()?;
        let now = Utc::now();
        self.record_mutation_wal(WalOp::CreateNode {
            id,
            labels: labels.clone(),
            properties: properties.clone(),
            created_at: now.timestamp(),
            updated_at: now.timestamp(),
        })?;
        for label in &labels {
            state.nodes_by_label.entry(label.clone()).or_default().insert(id);
        }
        for (key, value) in &properties {
            state.property_indexes.on_property_changed(id, key, None, Some(value))?;
        }
        let node = Node {
            id,
            labels,
            properties,
            created_at: now,
            updated_at: now,
        };
        state.nodes.insert(id, node.clone());
        self.stats.record_node_created();
        Ok(node)
    }

    pub fn get_node(&self, id: u64) -> Result<Node> {
        self.check_open()?;
        let started = Instant::now();
        let state = self.state.read().unwrap();
        let node = state.nodes.get(&id).cloned().ok_or(Error::NodeNotFound(id))?;
        self.stats.record_query(started.elapsed());
        Ok(node)
    }

    pub fn update_node(&self, id: u64, properties: BTreeMap<String, Value>) -> Result<Node> {
        self.check_open()?;
        let mut state = self.state.write().unwrap();
        if !state.nodes.contains_key(&id) {
            return Err(Error::NodeNotFound(id));
        }
        check_index_type(&properties, &state.property_indexes)?;
        let now = Utc::now();
        self.record_mutation_wal(WalOp::UpdateNode {
            id,
            properties: properties.clone(),
            updated_at: now.timestamp(),
        })?;
        let GraphState { nodes, property_indexes, .. } = &mut *state;
        let node = nodes.get_mut(&id).unwrap();
        for (key, value) in &properties {
            let old = node.properties.insert(key.clone(), value.clone());
            property_indexes.on_property_changed(id, key, old.as_ref(), Some(value))?;
        }
        node.updated_at = now;
        Ok(node.clone())
    }

    pub fn delete_node(&self, id: u64) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.write().unwrap();
        let node = state.nodes.get(&id).cloned().ok_or(Error::NodeNotFound(id))?;
        self.record_mutation_wal(WalOp::DeleteNode { id })?;
        self.cascade_delete_node(&mut state, id, &node)
    }

    fn cascade_delete_node(&self, state: &mut GraphState, id: u64, node: &Node) -> Result<()> {
        let outgoing = state.adjacency.get_outgoing(id)?;
        let incoming = state.adjacency.get_incoming(id)?;
        let mut incident: HashSet<u64> = outgoing.iter().copied().collect();
        incident.extend(incoming.iter().copied());

        for edge_id in incident {
            let Some(edge) = state.edges.remove(&edge_id) else {
                continue;
            };
            if let Some(set) = state.edges_by_type.get_mut(&edge.edge_type) {
                set.shift_remove(&edge_id);
            }
            // A self-loop (`edge.from == edge.to == id`) takes both
            // branches' effective cleanup via `forget_node` below, since
            // `other` is `id` itself either way.
            let other = if edge.from == id { edge.to } else { edge.from };
            if edge.from == id {
                state.adjacency.remove_incoming(other, edge_id)?;
            } else {
                state.adjacency.remove_outgoing(other, edge_id)?;
            }
            self.stats.record_edge_deleted();
        }

        for label in &node.labels {
            if let Some(set) = state.nodes_by_label.get_mut(label) {
                set.shift_remove(&id);
            }
        }
        for (key, value) in &node.properties {
            state.property_indexes.on_property_changed(id, key, Some(value), None)?;
        }
        state.adjacency.forget_node(id)?;
        state.nodes.remove(&id);
        self.stats.record_node_deleted();
        Ok(())
    }

    // ---- Edge operations ----

    pub fn create_edge(
        &self,
        from: u64,
        to: u64,
        edge_type: String,
        properties: BTreeMap<String, Value>,
        weight: f64,
    ) -> Result<Edge> {
        self.check_open()?;
        let mut state = self.state.write().unwrap();
        if !state.nodes.contains_key(&from) {
            return Err(Error::NodeNotFound(from));
        }
        if !state.nodes.contains_key(&to) {
            return Err(Error::NodeNotFound(to));
        }
        let id = state.allocate_edge_id()?;
        let now = Utc::now();
        self.record_mutation_wal(WalOp::CreateEdge {
            id,
            from,
            to,
            edge_type: edge_type.clone(),
            properties: properties.clone(),
            weight,
            created_at: now.timestamp(),
        })?;
        self.apply_create_edge(&mut state, id, from, to, edge_type, properties, weight, now.timestamp())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_create_edge(
        &self,
        state: &mut GraphState,
        id: u64,
        from: u64,
        to: u64,
        edge_type: String,
        properties: BTreeMap<String, Value>,
        weight: f64,
        created_at_secs: i64,
    ) -> Result<Edge> {
        let created_at = chrono::DateTime::from_timestamp(created_at_secs, 0).unwrap_or_else(Utc::now);
        let edge = Edge {
            id,
            from,
            to,
            edge_type: edge_type.clone(),
            properties,
            weight,
            created_at,
        };
        state.edges.insert(id, edge.clone());
        state.edges_by_type.entry(edge_type).or_default().insert(id);
        state.adjacency.add_outgoing(from, id, to)?;
        state.adjacency.add_incoming(to, id, from)?;
        self.stats.record_edge_created();
        Ok(edge)
    }

    pub fn get_edge(&self, id: u64) -> Result<Edge> {
        self.check_open()?;
        let started = Instant::now();
        let state = self.state.read().unwrap();
        let edge = state.edges.get(&id).cloned().ok_or(Error::EdgeNotFound(id))?;
        self.stats.record_query(started.elapsed());
        Ok(edge)
    }

    pub fn delete_edge(&self, id: u64) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.write().unwrap();
        if !state.edges.contains_key(&id) {
            return Err(Error::EdgeNotFound(id));
        }
        self.record_mutation_wal(WalOp::DeleteEdge { id })?;
        self.apply_delete_edge(&mut state, id)
    }

    fn apply_delete_edge(&self, state: &mut GraphState, id: u64) -> Result<()> {
        let Some(edge) = state.edges.remove(&id) else {
            return Ok(());
        };
        if let Some(set) = state.edges_by_type.get_mut(&edge.edge_type) {
            set.shift_remove(&id);
        }
        state.adjacency.remove_outgoing(edge.from, id)?;
        state.adjacency.remove_incoming(edge.to, id)?;
        self.stats.record_edge_deleted();
        Ok(())
    }

    pub fn get_outgoing_edges(&self, node: u64) -> Result<Vec<Edge>> {
        self.check_open()?;
        let started = Instant::now();
        let state = self.state.read().unwrap();
        let _shard = self.shard_locks.read(node);
        let ids = state.adjacency.get_outgoing(node)?;
        let edges = ids.into_iter().filter_map(|id| state.edges.get(&id).cloned()).collect();
        self.stats.record_query(started.elapsed());
        Ok(edges)
    }

    pub fn get_incoming_edges(&self, node: u64) -> Result<Vec<Edge>> {
        self.check_open()?;
        let started = Instant::now();
        let state = self.state.read().unwrap();
        let _shard = self.shard_locks.read(node);
        let ids = state.adjacency.get_incoming(node)?;
        let edges = ids.into_iter().filter_map(|id| state.edges.get(&id).cloned()).collect();
        self.stats.record_query(started.elapsed());
        Ok(edges)
    }

    pub fn find_edge_between(&self, from: u64, to: u64, edge_type: &str) -> Result<Option<Edge>> {
        self.check_open()?;
        let started = Instant::now();
        let state = self.state.read().unwrap();
        let ids = state.adjacency.get_outgoing(from)?;
        let found = ids.into_iter().find_map(|id| {
            state.edges.get(&id).filter(|e| e.to == to && e.edge_type == edge_type).cloned()
        });
        self.stats.record_query(started.elapsed());
        Ok(found)
    }

    pub fn find_all_edges_between(&self, from: u64, to: u64) -> Result<Vec<Edge>> {
        self.check_open()?;
        let started = Instant::now();
        let state = self.state.read().unwrap();
        let ids = state.adjacency.get_outgoing(from)?;
        let found = ids
            .into_iter()
            .filter_map(|id| state.edges.get(&id).filter(|e| e.to == to).cloned())
            .collect();
        self.stats.record_query(started.elapsed());
        Ok(found)
    }

    pub fn upsert_edge(
        &self,
        from: u64,
        to: u64,
        edge_type: String,
        properties: BTreeMap<String, Value>,
        weight: f64,
    ) -> Result<(Edge, bool)> {
        self.check_open()?;
        let mut state = self.state.write().unwrap();
        if !state.nodes.contains_key(&from) {
            return Err(Error::NodeNotFound(from));
        }
        if !state.nodes.contains_key(&to) {
            return Err(Error::NodeNotFound(to));
        }
        let existing_id = state
            .adjacency
            .get_outgoing(from)?
            .into_iter()
            .find(|id| {
                state
                    .edges
                    .get(id)
                    .is_some_and(|e| e.to == to && e.edge_type == edge_type)
            });

        match existing_id {
            None => {
                let id = state.allocate_edge_id()?;
                let now = Utc::now();
                self.record_mutation_wal(WalOp::CreateEdge {
                    id,
                    from,
                    to,
                    edge_type: edge_type.clone(),
                    properties: properties.clone(),
                    weight,
                    created_at: now.timestamp(),
                })?;
                let edge = self.apply_create_edge(&mut state, id, from, to, edge_type, properties, weight, now.timestamp())?;
                Ok((edge, true))
            }
            Some(id) => {
                let existing = state.edges.get(&id).unwrap().clone();
                let mut merged_props = existing.properties.clone();
                for (k, v) in &properties {
                    merged_props.insert(k.clone(), v.clone());
                }
                // No dedicated WAL op exists for an in-place edge
                // update; a delete-then-recreate pair with the same id
                // reconstructs the merged edge on replay without
                // disturbing id continuity in the live state.
                self.record_mutation_wal(WalOp::DeleteEdge { id })?;
                self.record_mutation_wal(WalOp::CreateEdge {
                    id,
                    from,
                    to,
                    edge_type: existing.edge_type.clone(),
                    properties: merged_props.clone(),
                    weight,
                    created_at: existing.created_at.timestamp(),
                })?;
                let updated = Edge {
                    id,
                    from,
                    to,
                    edge_type: existing.edge_type,
                    properties: merged_props,
                    weight,
                    created_at: existing.created_at,
                };
                state.edges.insert(id, updated.clone());
                Ok((updated, false))
            }
        }
    }

    pub fn delete_edge_between(&self, from: u64, to: u64, edge_type: &str) -> Result<bool> {
        self.check_open()?;
        let mut state = self.state.write().unwrap();
        let ids = state.adjacency.get_outgoing(from)?;
        let found = ids.into_iter().find(|id| {
            state
                .edges
                .get(id)
                .is_some_and(|e| e.to == to && e.edge_type == edge_type)
        });
        let Some(id) = found else {
            return Ok(false);
        };
        self.record_mutation_wal(WalOp::DeleteEdge { id })?;
        self.apply_delete_edge(&mut state, id)?;
        Ok(true)
    }

    // ---- Label / type / property lookups ----

    pub fn find_nodes_by_label(&self, label: &str) -> Result<Vec<Node>> {
        self.check_open()?;
        let started = Instant::now();
        let state = self.state.read().unwrap();
        let nodes = state
            .nodes_by_label
            .get(label)
            .map(|ids| ids.iter().filter_map(|id| state.nodes.get(id).cloned()).collect())
            .unwrap_or_default();
        self.stats.record_query(started.elapsed());
        Ok(nodes)
    }

    pub fn find_edges_by_type(&self, edge_type: &str) -> Result<Vec<Edge>> {
        self.check_open()?;
        let started = Instant::now();
        let state = self.state.read().unwrap();
        let edges = state
            .edges_by_type
            .get(edge_type)
            .map(|ids| ids.iter().filter_map(|id| state.edges.get(id).cloned()).collect())
            .unwrap_or_default();
        self.stats.record_query(started.elapsed());
        Ok(edges)
    }

    /// Unindexed linear scan; works regardless of whether `key` has a
    /// property index.
    pub fn find_nodes_by_property(&self, key: &str, value: &Value) -> Result<Vec<Node>> {
        self.check_open()?;
        let started = Instant::now();
        let state = self.state.read().unwrap();
        let nodes = state
            .nodes
            .values()
            .filter(|n| n.properties.get(key) == Some(value))
            .cloned()
            .collect();
        self.stats.record_query(started.elapsed());
        Ok(nodes)
    }

    pub fn find_nodes_by_property_indexed(&self, key: &str, value: &Value) -> Result<Vec<Node>> {
        self.check_open()?;
        let started = Instant::now();
        let state = self.state.read().unwrap();
        let index = state.property_indexes.get(key).ok_or_else(|| Error::IndexNotFound(key.to_string()))?;
        let ids = index.lookup_eq(value);
        let found = ids.into_iter().filter_map(|id| state.nodes.get(&id).cloned()).collect();
        self.stats.record_query(started.elapsed());
        Ok(found)
    }

    pub fn find_nodes_by_property_range(&self, key: &str, lo: Option<&Value>, hi: Option<&Value>) -> Result<Vec<Node>> {
        self.check_open()?;
        let started = Instant::now();
        let state = self.state.read().unwrap();
        let index = state.property_indexes.get(key).ok_or_else(|| Error::IndexNotFound(key.to_string()))?;
        let ids = index.lookup_range(lo, hi);
        let found = ids.into_iter().filter_map(|id| state.nodes.get(&id).cloned()).collect();
        self.stats.record_query(started.elapsed());
        Ok(found)
    }

    pub fn find_nodes_by_property_prefix(&self, key: &str, prefix: &str) -> Result<Vec<Node>> {
        self.check_open()?;
        let started = Instant::now();
        let state = self.state.read().unwrap();
        let index = state.property_indexes.get(key).ok_or_else(|| Error::IndexNotFound(key.to_string()))?;
        let ids = index.lookup_prefix(prefix)?;
        let found = ids.into_iter().filter_map(|id| state.nodes.get(&id).cloned()).collect();
        self.stats.record_query(started.elapsed());
        Ok(found)
    }

    pub fn create_property_index(&self, key: &str, value_tag: u8) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.write().unwrap();
        if state.property_indexes.has_index(key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        self.record_mutation_wal(WalOp::CreatePropertyIndex {
            key: key.to_string(),
            value_tag,
        })?;
        state.property_indexes.create_index(key, value_tag)?;
        let matching: Vec<(u64, Value)> = state
            .nodes
            .values()
            .filter_map(|n| n.properties.get(key).filter(|v| v.tag_byte() == value_tag).map(|v| (n.id, v.clone())))
            .collect();
        let index = state.property_indexes.get_mut(key).unwrap();
        for (id, value) in matching {
            index.insert(&value, id)?;
        }
        Ok(())
    }

    pub fn drop_property_index(&self, key: &str) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.write().unwrap();
        if !state.property_indexes.has_index(key) {
            return Err(Error::IndexNotFound(key.to_string()));
        }
        self.record_mutation_wal(WalOp::DropPropertyIndex { key: key.to_string() })?;
        state.property_indexes.drop_index(key)
    }

    pub fn get_statistics(&self) -> Statistics {
        self.stats.snapshot()
    }

    // ---- Vector index passthrough ----

    pub fn vector_indexes(&self) -> &VectorIndexManager {
        &self.vector_indexes
    }

    // ---- Lifecycle ----

    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.state.write().unwrap();
        self.snapshot_locked(&mut state)?;
        if let Adjacency::Disk(store) = &state.adjacency {
            store.close()?;
        }
        self.vector_indexes.flush()?;
        self.wal.truncate()?;
        self.wal.close()?;

        {
            let (lock, cvar) = &*self.flusher_stop;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            let _ = handle.join();
        }
        let _ = FileExt::unlock(&self._directory_lock);
        Ok(())
    }

    fn snapshot_locked(&self, state: &mut GraphState) -> Result<()> {
        if self.config.enable_edge_compression {
            state.adjacency.compress_all();
        }
        let all_nodes: Vec<u64> = state.nodes.keys().copied().collect();
        let (outgoing, incoming) = state.adjacency.full_adjacency_for_snapshot(all_nodes.into_iter())?;
        let now = Utc::now();
        let content = SnapshotContent {
            nodes: state.nodes.values().cloned().collect(),
            edges: state.edges.values().cloned().collect(),
            nodes_by_label: state
                .nodes_by_label
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().copied().collect()))
                .collect(),
            edges_by_type: state
                .edges_by_type
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().copied().collect()))
                .collect(),
            outgoing,
            incoming,
            property_indexes: state
                .property_indexes
                .iter()
                .map(|(k, idx)| (k.clone(), idx.clone()))
                .collect(),
            next_node_id: state.next_node_id,
            next_edge_id: state.next_edge_id,
            node_count: self.stats.node_count(),
            edge_count: self.stats.edge_count(),
            last_snapshot: Some(now),
        };
        snapshot::save(self.config.data_dir(), content, self.encryption_engine.as_ref())?;
        self.stats.record_snapshot(now);
        self.wal.truncate()?;
        Ok(())
    }
}

fn apply_snapshot(state: &mut GraphState, content: SnapshotContent, stats: &Stats) -> Result<()> {
    for node in content.nodes {
        state.observe_node_id(node.id);
        state.nodes.insert(node.id, node);
    }
    for edge in content.edges {
        state.observe_edge_id(edge.id);
        state.edges.insert(edge.id, edge);
    }
    for (label, ids) in content.nodes_by_label {
        state.nodes_by_label.insert(label, ids.into_iter().collect());
    }
    for (edge_type, ids) in content.edges_by_type {
        state.edges_by_type.insert(edge_type, ids.into_iter().collect());
    }
    for (node, ids) in content.outgoing {
        for edge_id in ids {
            let peer = state.edges.get(&edge_id).map(|e| e.to).unwrap_or(0);
            state.adjacency.add_outgoing(node, edge_id, peer)?;
        }
    }
    for (node, ids) in content.incoming {
        for edge_id in ids {
            let peer = state.edges.get(&edge_id).map(|e| e.from).unwrap_or(0);
            state.adjacency.add_incoming(node, edge_id, peer)?;
        }
    }
    state.property_indexes = PropertyIndexManager::restore(content.property_indexes);
    state.next_node_id = state.next_node_id.max(content.next_node_id);
    state.next_edge_id = state.next_edge_id.max(content.next_edge_id);
    stats.restore_from_snapshot(content.node_count, content.edge_count, content.last_snapshot);
    Ok(())
}

fn apply_wal_op(state: &mut GraphState, stats: &Stats, op: WalOp) -> Result<()> {
    match op {
        WalOp::CreateNode {
            id,
            labels,
            properties,
            created_at,
            updated_at,
        } => {
            if state.nodes.contains_key(&id) {
                return Ok(());
            }
            state.observe_node_id(id);
            for label in &labels {
                state.nodes_by_label.entry(label.clone()).or_default().insert(id);
            }
            for (key, value) in &properties {
                state.property_indexes.on_property_changed(id, key, None, Some(value))?;
            }
            let created = chrono::DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now);
            let updated = chrono::DateTime::from_timestamp(updated_at, 0).unwrap_or_else(Utc::now);
            state.nodes.insert(
                id,
                Node {
                    id,
                    labels,
                    properties,
                    created_at: created,
                    updated_at: updated,
                },
            );
            stats.record_node_created();
        }
        WalOp::UpdateNode { id, properties, updated_at } => {
            let GraphState { nodes, property_indexes, .. } = &mut *state;
            let Some(node) = nodes.get_mut(&id) else {
                return Ok(());
            };
            for (key, value) in &properties {
                let old = node.properties.insert(key.clone(), value.clone());
                property_indexes.on_property_changed(id, key, old.as_ref(), Some(value))?;
            }
            node.updated_at = chrono::DateTime::from_timestamp(updated_at, 0).unwrap_or_else(Utc::now);
        }
        WalOp::DeleteNode { id } => {
            let Some(node) = state.nodes.get(&id).cloned() else {
                return Ok(());
            };
            let outgoing = state.adjacency.get_outgoing(id)?;
            let incoming = state.adjacency.get_incoming(id)?;
            let mut incident: HashSet<u64> = outgoing.into_iter().collect();
            incident.extend(incoming);
            for edge_id in incident {
                let Some(edge) = state.edges.remove(&edge_id) else {
                    continue;
                };
                if let Some(set) = state.edges_by_type.get_mut(&edge.edge_type) {
                    set.shift_remove(&edge_id);
                }
                let other = if edge.from == id { edge.to } else { edge.from };
                if edge.from == id {
                    state.adjacency.remove_incoming(other, edge_id)?;
                } else {
                    state.adjacency.remove_outgoing(other, edge_id)?;
                }
                stats.record_edge_deleted();
            }
            for label in &node.labels {
                if let Some(set) = state.nodes_by_label.get_mut(label) {
                    set.shift_remove(&id);
                }
            }
            for (key, value) in &node.properties {
                state.property_indexes.on_property_changed(id, key, Some(value), None)?;
            }
            state.adjacency.forget_node(id)?;
            state.nodes.remove(&id);
            stats.record_node_deleted();
        }
        WalOp::CreateEdge {
            id,
            from,
            to,
            edge_type,
            properties,
            weight,
            created_at,
        } => {
            if state.edges.contains_key(&id) {
                return Ok(());
            }
            state.observe_edge_id(id);
            let created = chrono::DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now);
            state.edges.insert(
                id,
                Edge {
                    id,
                    from,
                    to,
                    edge_type: edge_type.clone(),
                    properties,
                    weight,
                    created_at: created,
                },
            );
            state.edges_by_type.entry(edge_type).or_default().insert(id);
            state.adjacency.add_outgoing(from, id, to)?;
            state.adjacency.add_incoming(to, id, from)?;
            stats.record_edge_created();
        }
        WalOp::DeleteEdge { id } => {
            let Some(edge) = state.edges.remove(&id) else {
                return Ok(());
            };
            if let Some(set) = state.edges_by_type.get_mut(&edge.edge_type) {
                set.shift_remove(&id);
            }
            state.adjacency.remove_outgoing(edge.from, id)?;
            state.adjacency.remove_incoming(edge.to, id)?;
            stats.record_edge_deleted();
        }
        WalOp::CreatePropertyIndex { key, value_tag } => {
            if state.property_indexes.has_index(&key) {
                return Ok(());
            }
            state.property_indexes.create_index_idempotent(&key, value_tag);
            let matching: Vec<(u64, Value)> = state
                .nodes
                .values()
                .filter_map(|n| n.properties.get(&key).filter(|v| v.tag_byte() == value_tag).map(|v| (n.id, v.clone())))
                .collect();
            let index = state.property_indexes.get_mut(&key).unwrap();
            for (id, value) in matching {
                index.insert(&value, id)?;
            }
        }
        WalOp::DropPropertyIndex { key } => {
            let _ = state.property_indexes.drop_index(&key);
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Opens (creating if necessary) `path` and takes an OS advisory
/// exclusive lock on it, failing with `AlreadyLocked` if another live
/// process already holds it. Unlike a plain "create, fail if exists"
/// lockfile, the OS releases an advisory lock automatically when the
/// holding process exits for any reason — including an unclean crash —
/// so a later `open` of the same directory is not permanently wedged by
/// a prior crash, while two *concurrently live* processes still
/// correctly conflict per the "multi-writer is undefined" contract.
fn acquire_directory_lock(path: &PathBuf) -> Result<File> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(_) => Err(Error::AlreadyLocked(path.display().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path) -> GraphDb {
        GraphDb::open(GraphDbConfig::new(dir)).unwrap()
    }

    #[test]
    fn s1_basic_crud() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let a = db.create_node(vec!["Person".into()], BTreeMap::from([("name".into(), Value::String("Alice".into()))])).unwrap();
        let b = db.create_node(vec!["Person".into()], BTreeMap::from([("name".into(), Value::String("Bob".into()))])).unwrap();
        let e1 = db
            .create_edge(a.id, b.id, "KNOWS".into(), BTreeMap::from([("since".into(), Value::Int(2020))]), 1.0)
            .unwrap();

        let out_a = db.get_outgoing_edges(a.id).unwrap();
        assert_eq!(out_a.iter().map(|e| e.id).collect::<Vec<_>>(), vec![e1.id]);
        let in_b = db.get_incoming_edges(b.id).unwrap();
        assert_eq!(in_b.iter().map(|e| e.id).collect::<Vec<_>>(), vec![e1.id]);
        assert!(db.get_incoming_edges(a.id).unwrap().is_empty());
    }

    #[test]
    fn s2_cascade_delete() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let a = db.create_node(vec![], BTreeMap::new()).unwrap();
        let b = db.create_node(vec![], BTreeMap::new()).unwrap();
        let c = db.create_node(vec![], BTreeMap::new()).unwrap();
        let e1 = db.create_edge(a.id, b.id, "KNOWS".into(), BTreeMap::new(), 1.0).unwrap();
        let e2 = db.create_edge(b.id, c.id, "KNOWS".into(), BTreeMap::new(), 1.0).unwrap();
        let e3 = db.create_edge(a.id, c.id, "KNOWS".into(), BTreeMap::new(), 1.0).unwrap();

        db.delete_node(b.id).unwrap();

        assert!(matches!(db.get_edge(e1.id), Err(Error::EdgeNotFound(_))));
        assert!(matches!(db.get_edge(e2.id), Err(Error::EdgeNotFound(_))));
        assert!(db.get_edge(e3.id).is_ok());
        assert_eq!(db.get_outgoing_edges(a.id).unwrap().iter().map(|e| e.id).collect::<Vec<_>>(), vec![e3.id]);
        assert_eq!(db.get_incoming_edges(c.id).unwrap().iter().map(|e| e.id).collect::<Vec<_>>(), vec![e3.id]);
    }

    #[test]
    fn deleted_node_own_adjacency_is_reclaimed_not_just_orphaned() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let a = db.create_node(vec![], BTreeMap::new()).unwrap();
        let b = db.create_node(vec![], BTreeMap::new()).unwrap();
        db.create_edge(a.id, b.id, "KNOWS".into(), BTreeMap::new(), 1.0).unwrap();
        db.delete_node(a.id).unwrap();
        let state = db.state.read().unwrap();
        let Adjacency::Memory(mem) = &state.adjacency else {
            panic!("expected in-memory adjacency");
        };
        assert!(!mem.outgoing_pending.contains_key(&a.id));
        assert!(!mem.outgoing_compressed.contains_key(&a.id));
    }

    #[test]
    fn s3_clean_close_durability() {
        let dir = tempdir().unwrap();
        {
            let db = open(dir.path());
            let mut ids = Vec::new();
            for i in 0..7 {
                let n = db.create_node(vec!["Person".into()], BTreeMap::from([("i".into(), Value::Int(i))])).unwrap();
                ids.push(n.id);
            }
            for i in 0..12 {
                db.create_edge(ids[i % 7], ids[(i + 1) % 7], "KNOWS".into(), BTreeMap::new(), 1.0).unwrap();
            }
            db.close().unwrap();
        }
        let db = open(dir.path());
        let stats = db.get_statistics();
        assert_eq!(stats.node_count, 7);
        assert_eq!(stats.edge_count, 12);
        assert_eq!(db.find_nodes_by_label("Person").unwrap().len(), 7);
    }

    #[test]
    fn s4_crash_durability_under_plain_wal() {
        let dir = tempdir().unwrap();
        {
            let db = open(dir.path());
            for _ in 0..10 {
                db.create_node(vec![], BTreeMap::new()).unwrap();
            }
            // No `close()` call: simulates the process being killed right
            // after the last durable append.
        }
        let db = open(dir.path());
        assert_eq!(db.get_statistics().node_count, 10);
    }

    #[test]
    fn s4_crash_durability_under_batched_wal_after_flush_interval() {
        let dir = tempdir().unwrap();
        {
            let db = GraphDb::open(
                GraphDbConfig::new(dir.path())
                    .with_batching(true)
                    .with_batch_size(1000)
                    .with_flush_interval(Duration::from_millis(20)),
            )
            .unwrap();
            for _ in 0..10 {
                db.create_node(vec![], BTreeMap::new()).unwrap();
            }
            // Give the background flusher time to durably flush the batch
            // before the simulated crash (dropping `db` without `close`).
            std::thread::sleep(Duration::from_millis(200));
        }
        let db = open(dir.path());
        assert_eq!(db.get_statistics().node_count, 10);
    }

    #[test]
    fn s5_deleted_edge_stays_deleted_across_crash() {
        let dir = tempdir().unwrap();
        let (a_id, b_id, e2_id) = {
            let db = open(dir.path());
            let a = db.create_node(vec![], BTreeMap::new()).unwrap();
            let b = db.create_node(vec![], BTreeMap::new()).unwrap();
            let e1 = db.create_edge(a.id, b.id, "KNOWS".into(), BTreeMap::new(), 1.0).unwrap();
            let e2 = db.create_edge(a.id, b.id, "KNOWS".into(), BTreeMap::new(), 1.0).unwrap();
            db.delete_edge(e1.id).unwrap();
            (a.id, b.id, e2.id)
            // Dropped without `close()`: simulated crash after the delete's
            // WAL append returned successfully.
        };
        let db = open(dir.path());
        let out = db.get_outgoing_edges(a_id).unwrap();
        assert_eq!(out.iter().map(|e| e.id).collect::<Vec<_>>(), vec![e2_id]);
        let _ = b_id;
    }

    #[test]
    fn s6_concurrent_identical_delete_has_exactly_one_winner() {
        let dir = tempdir().unwrap();
        let db = Arc::new(open(dir.path()));
        let a = db.create_node(vec![], BTreeMap::new()).unwrap();
        let b = db.create_node(vec![], BTreeMap::new()).unwrap();
        let e = db.create_edge(a.id, b.id, "KNOWS".into(), BTreeMap::new(), 1.0).unwrap();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let db = Arc::clone(&db);
                let id = e.id;
                std::thread::spawn(move || db.delete_edge(id))
            })
            .collect();
        let results: Vec<Result<()>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        assert_eq!(results.iter().filter(|r| matches!(r, Err(Error::EdgeNotFound(_)))).count(), 9);
        assert!(db.get_outgoing_edges(a.id).unwrap().is_empty());
    }

    #[test]
    fn upsert_edge_reports_created_then_merges_on_second_call() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let a = db.create_node(vec![], BTreeMap::new()).unwrap();
        let b = db.create_node(vec![], BTreeMap::new()).unwrap();
        let (first, created) = db
            .upsert_edge(a.id, b.id, "KNOWS".into(), BTreeMap::from([("since".into(), Value::Int(2020))]), 1.0)
            .unwrap();
        assert!(created);
        let (second, created) = db
            .upsert_edge(a.id, b.id, "KNOWS".into(), BTreeMap::from([("weight_note".into(), Value::String("close".into()))]), 2.0)
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.properties.get("since"), Some(&Value::Int(2020)));
        assert_eq!(second.properties.get("weight_note"), Some(&Value::String("close".into())));
        assert_eq!(second.weight, 2.0);
    }

    #[test]
    fn create_property_index_rejects_duplicate_and_finds_by_value() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        db.create_node(vec![], BTreeMap::from([("age".into(), Value::Int(30))])).unwrap();
        let n2 = db.create_node(vec![], BTreeMap::from([("age".into(), Value::Int(40))])).unwrap();
        db.create_property_index("age", Value::Int(0).tag_byte()).unwrap();
        assert!(matches!(db.create_property_index("age", Value::Int(0).tag_byte()), Err(Error::AlreadyExists(_))));
        let found = db.find_nodes_by_property_indexed("age", &Value::Int(40)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, n2.id);
    }
}
