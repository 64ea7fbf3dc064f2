//! Engine configuration: a consuming-self builder, in the same idiom as
//! the teacher's `Options`/`PartitionConfig`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::edge_store::DEFAULT_EDGE_CACHE_SIZE;
use crate::snapshot::EncryptionEngine;

#[derive(Clone)]
pub struct GraphDbConfig {
    pub(crate) data_dir: PathBuf,
    pub(crate) enable_batching: bool,
    pub(crate) enable_compression: bool,
    pub(crate) enable_edge_compression: bool,
    pub(crate) batch_size: usize,
    pub(crate) flush_interval: Duration,
    pub(crate) use_disk_backed_edges: bool,
    pub(crate) edge_cache_size: usize,
    pub(crate) bulk_import_mode: bool,
    pub(crate) encryption_engine: Option<Arc<dyn EncryptionEngine>>,
}

impl fmt::Debug for GraphDbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphDbConfig")
            .field("data_dir", &self.data_dir)
            .field("enable_batching", &self.enable_batching)
            .field("enable_compression", &self.enable_compression)
            .field("enable_edge_compression", &self.enable_edge_compression)
            .field("batch_size", &self.batch_size)
            .field("flush_interval", &self.flush_interval)
            .field("use_disk_backed_edges", &self.use_disk_backed_edges)
            .field("edge_cache_size", &self.edge_cache_size)
            .field("bulk_import_mode", &self.bulk_import_mode)
            .field("encryption_engine", &self.encryption_engine.is_some())
            .finish()
    }
}

impl GraphDbConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        GraphDbConfig {
            data_dir: data_dir.as_ref().to_owned(),
            enable_batching: false,
            enable_compression: false,
            enable_edge_compression: true,
            batch_size: 100,
            flush_interval: Duration::from_millis(50),
            use_disk_backed_edges: false,
            edge_cache_size: DEFAULT_EDGE_CACHE_SIZE,
            bulk_import_mode: false,
            encryption_engine: None,
        }
    }

    pub fn with_batching(mut self, enabled: bool) -> Self {
        self.enable_batching = enabled;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.enable_compression = enabled;
        self
    }

    pub fn with_edge_compression(mut self, enabled: bool) -> Self {
        self.enable_edge_compression = enabled;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_disk_backed_edges(mut self, enabled: bool) -> Self {
        self.use_disk_backed_edges = enabled;
        self
    }

    pub fn with_edge_cache_size(mut self, size: usize) -> Self {
        self.edge_cache_size = size;
        self
    }

    pub fn with_bulk_import_mode(mut self, enabled: bool) -> Self {
        self.bulk_import_mode = enabled;
        self
    }

    /// Installs at-rest encryption for the snapshot file. The WAL itself
    /// is never encrypted by this engine (out of scope: see spec's
    /// external-collaborator notes on encryption).
    pub fn with_encryption_engine(mut self, engine: Arc<dyn EncryptionEngine>) -> Self {
        self.encryption_engine = Some(engine);
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}
