//! Named HNSW-class vector indexes. The HNSW core itself (`usearch`) is
//! an external collaborator; this module owns only the management
//! surface: named index lifecycle, config persistence, and the
//! add/search/remove calls that forward into it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorMetric {
    Cosine,
    InnerProduct,
    L2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorIndexConfig {
    pub dim: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub metric: VectorMetric,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorMatch {
    pub node_id: u64,
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SidecarMeta {
    version: u32,
    config: VectorIndexConfig,
}

const SIDECAR_VERSION: u32 = 1;

fn sidecar_meta_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.usearch.meta.json"))
}

fn sidecar_index_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.usearch"))
}

fn write_sidecar_meta(dir: &Path, name: &str, config: &VectorIndexConfig) -> Result<()> {
    let meta = SidecarMeta {
        version: SIDECAR_VERSION,
        config: config.clone(),
    };
    let bytes = serde_json::to_vec(&meta)
        .map_err(|e| Error::DurabilityError(format!("failed to encode vector index meta: {e}")))?;
    std::fs::write(sidecar_meta_path(dir, name), bytes)?;
    Ok(())
}

fn read_sidecar_meta(dir: &Path, name: &str) -> Option<SidecarMeta> {
    let bytes = std::fs::read(sidecar_meta_path(dir, name)).ok()?;
    let meta: SidecarMeta = serde_json::from_slice(&bytes).ok()?;
    if meta.version != SIDECAR_VERSION {
        return None;
    }
    Some(meta)
}

#[cfg(feature = "vector-index")]
mod backend {
    use super::*;

    pub struct Backend {
        index: usearch::Index,
    }

    fn metric_kind(metric: VectorMetric) -> usearch::MetricKind {
        match metric {
            VectorMetric::Cosine => usearch::MetricKind::Cos,
            VectorMetric::InnerProduct => usearch::MetricKind::IP,
            VectorMetric::L2 => usearch::MetricKind::L2sq,
        }
    }

    impl Backend {
        pub fn create(config: &VectorIndexConfig) -> Result<Self> {
            let index = usearch::Index::new(&usearch::IndexOptions {
                dimensions: config.dim,
                metric: metric_kind(config.metric),
                quantization: usearch::ScalarKind::F32,
                connectivity: config.m,
                expansion_add: config.ef_construction,
                expansion_search: config.ef_construction,
                multi: false,
            })
            .map_err(|e| Error::DurabilityError(format!("failed to create vector index: {e}")))?;
            index
                .reserve(1)
                .map_err(|e| Error::DurabilityError(format!("failed to reserve vector index: {e}")))?;
            Ok(Backend { index })
        }

        pub fn open(path: &Path, config: &VectorIndexConfig) -> Result<Self> {
            let backend = Self::create(config)?;
            let path_str = path
                .to_str()
                .ok_or_else(|| Error::InvalidArgument("vector sidecar path is not UTF-8".into()))?;
            backend
                .index
                .load(path_str)
                .map_err(|e| Error::DurabilityError(format!("failed to load vector index: {e}")))?;
            Ok(backend)
        }

        pub fn add(&self, node_id: u64, vector: &[f32]) -> Result<()> {
            if self.index.size() + 1 > self.index.capacity() {
                let wanted = (self.index.capacity().max(1) * 2).max(self.index.size() + 1);
                self.index
                    .reserve(wanted)
                    .map_err(|e| Error::DurabilityError(format!("failed to reserve: {e}")))?;
            }
            if self.index.contains(node_id) {
                let _ = self.index.remove(node_id);
            }
            self.index
                .add(node_id, vector)
                .map_err(|e| Error::DurabilityError(format!("failed to add vector: {e}")))?;
            Ok(())
        }

        pub fn remove(&self, node_id: u64) -> Result<()> {
            let _ = self.index.remove(node_id);
            Ok(())
        }

        pub fn search(&self, query: &[f32], k: usize, ef: usize, metric: VectorMetric) -> Result<Vec<VectorMatch>> {
            self.index.change_expansion_search(ef);
            let matches = self
                .index
                .search(query, k)
                .map_err(|e| Error::DurabilityError(format!("vector search failed: {e}")))?;
            Ok(matches
                .keys
                .into_iter()
                .zip(matches.distances)
                .map(|(node_id, dist)| VectorMatch {
                    node_id,
                    distance: match metric {
                        VectorMetric::Cosine | VectorMetric::InnerProduct => 1.0 - dist,
                        VectorMetric::L2 => -dist,
                    },
                })
                .collect())
        }

        pub fn save(&self, path: &Path) -> Result<()> {
            let path_str = path
                .to_str()
                .ok_or_else(|| Error::InvalidArgument("vector sidecar path is not UTF-8".into()))?;
            self.index
                .save(path_str)
                .map_err(|e| Error::DurabilityError(format!("failed to save vector index: {e}")))
        }
    }
}

#[cfg(not(feature = "vector-index"))]
mod backend {
    use super::*;

    pub struct Backend;

    impl Backend {
        pub fn create(_config: &VectorIndexConfig) -> Result<Self> {
            Err(Error::InvalidArgument(
                "vector-index feature is not enabled in this build".into(),
            ))
        }

        pub fn open(_path: &Path, _config: &VectorIndexConfig) -> Result<Self> {
            Self::create(_config)
        }

        pub fn add(&self, _node_id: u64, _vector: &[f32]) -> Result<()> {
            unreachable!("Backend cannot be constructed without the vector-index feature")
        }

        pub fn remove(&self, _node_id: u64) -> Result<()> {
            unreachable!("Backend cannot be constructed without the vector-index feature")
        }

        pub fn search(
            &self,
            _query: &[f32],
            _k: usize,
            _ef: usize,
            _metric: VectorMetric,
        ) -> Result<Vec<VectorMatch>> {
            unreachable!("Backend cannot be constructed without the vector-index feature")
        }

        pub fn save(&self, _path: &Path) -> Result<()> {
            unreachable!("Backend cannot be constructed without the vector-index feature")
        }
    }
}

use backend::Backend;

struct NamedIndex {
    config: VectorIndexConfig,
    backend: Backend,
    dirty: bool,
}

/// `property-name -> HNSW index` manager, behind a per-index mutex so
/// concurrent add/search on distinct or the same index is safe.
pub struct VectorIndexManager {
    dir: PathBuf,
    indexes: Mutex<HashMap<String, Mutex<NamedIndex>>>,
}

impl VectorIndexManager {
    /// Scans `dir` for `*.usearch.meta.json` sidecars left by a previous
    /// session and reopens every index they describe, so named vector
    /// indexes survive a restart the same way the property/label indexes
    /// do via the snapshot.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_owned();
        let mut indexes = HashMap::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let Some(file_name) = file_name.to_str() else { continue };
                let Some(name) = file_name.strip_suffix(".usearch.meta.json") else { continue };
                let Some(meta) = read_sidecar_meta(&dir, name) else { continue };
                let path = sidecar_index_path(&dir, name);
                if let Ok(backend) = Backend::open(&path, &meta.config) {
                    indexes.insert(
                        name.to_string(),
                        Mutex::new(NamedIndex {
                            config: meta.config,
                            backend,
                            dirty: false,
                        }),
                    );
                }
            }
        }
        VectorIndexManager {
            dir,
            indexes: Mutex::new(indexes),
        }
    }

    pub fn create_index(&self, name: &str, config: VectorIndexConfig) -> Result<()> {
        let mut indexes = self.indexes.lock().unwrap();
        if indexes.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        let backend = Backend::create(&config)?;
        indexes.insert(
            name.to_string(),
            Mutex::new(NamedIndex {
                config,
                backend,
                dirty: true,
            }),
        );
        Ok(())
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        let mut indexes = self.indexes.lock().unwrap();
        indexes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))?;
        let _ = std::fs::remove_file(sidecar_index_path(&self.dir, name));
        let _ = std::fs::remove_file(sidecar_meta_path(&self.dir, name));
        Ok(())
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.lock().unwrap().contains_key(name)
    }

    pub fn list_indexes(&self) -> Vec<String> {
        self.indexes.lock().unwrap().keys().cloned().collect()
    }

    fn with_index<T>(&self, name: &str, f: impl FnOnce(&mut NamedIndex) -> Result<T>) -> Result<T> {
        let indexes = self.indexes.lock().unwrap();
        let entry = indexes
            .get(name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))?;
        let mut guard = entry.lock().unwrap();
        f(&mut guard)
    }

    pub fn add_vector(&self, name: &str, node_id: u64, vector: &[f32]) -> Result<()> {
        self.with_index(name, |idx| {
            if vector.len() != idx.config.dim {
                return Err(Error::InvalidArgument(format!(
                    "expected a {}-dimensional vector, got {}",
                    idx.config.dim,
                    vector.len()
                )));
            }
            idx.backend.add(node_id, vector)?;
            idx.dirty = true;
            Ok(())
        })
    }

    pub fn remove_vector(&self, name: &str, node_id: u64) -> Result<()> {
        self.with_index(name, |idx| {
            idx.backend.remove(node_id)?;
            idx.dirty = true;
            Ok(())
        })
    }

    pub fn search(&self, name: &str, query: &[f32], k: usize, ef: usize) -> Result<Vec<VectorMatch>> {
        self.with_index(name, |idx| {
            if query.len() != idx.config.dim {
                return Err(Error::InvalidArgument(format!(
                    "expected a {}-dimensional query vector, got {}",
                    idx.config.dim,
                    query.len()
                )));
            }
            idx.backend.search(query, k, ef, idx.config.metric)
        })
    }

    /// Persists every dirty index's backend state and sidecar metadata.
    pub fn flush(&self) -> Result<()> {
        let indexes = self.indexes.lock().unwrap();
        for (name, entry) in indexes.iter() {
            let mut idx = entry.lock().unwrap();
            if !idx.dirty {
                continue;
            }
            idx.backend.save(&sidecar_index_path(&self.dir, name))?;
            write_sidecar_meta(&self.dir, name, &idx.config)?;
            idx.dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg(feature = "vector-index")]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> VectorIndexConfig {
        VectorIndexConfig {
            dim: 4,
            m: 16,
            ef_construction: 64,
            metric: VectorMetric::Cosine,
        }
    }

    #[test]
    fn create_index_rejects_duplicate_name() {
        let dir = tempdir().unwrap();
        let mgr = VectorIndexManager::new(dir.path());
        mgr.create_index("embedding", config()).unwrap();
        let err = mgr.create_index("embedding", config()).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn operations_on_unknown_index_fail() {
        let dir = tempdir().unwrap();
        let mgr = VectorIndexManager::new(dir.path());
        let err = mgr.add_vector("missing", 1, &[0.0, 0.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(err, Error::IndexNotFound(_)));
    }

    #[test]
    fn index_survives_manager_restart_after_flush() {
        let dir = tempdir().unwrap();
        {
            let mgr = VectorIndexManager::new(dir.path());
            mgr.create_index("embedding", config()).unwrap();
            mgr.add_vector("embedding", 1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
            mgr.flush().unwrap();
        }
        let mgr = VectorIndexManager::new(dir.path());
        assert!(mgr.has_index("embedding"));
        let results = mgr.search("embedding", &[1.0, 0.0, 0.0, 0.0], 1, 64).unwrap();
        assert_eq!(results[0].node_id, 1);
    }

    #[test]
    fn add_then_search_finds_the_vector() {
        let dir = tempdir().unwrap();
        let mgr = VectorIndexManager::new(dir.path());
        mgr.create_index("embedding", config()).unwrap();
        mgr.add_vector("embedding", 1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        mgr.add_vector("embedding", 2, &[0.0, 1.0, 0.0, 0.0]).unwrap();
        let results = mgr.search("embedding", &[1.0, 0.0, 0.0, 0.0], 1, 64).unwrap();
        assert_eq!(results[0].node_id, 1);
    }

    #[test]
    fn search_accepts_a_per_query_expansion_override() {
        let dir = tempdir().unwrap();
        let mgr = VectorIndexManager::new(dir.path());
        mgr.create_index("embedding", config()).unwrap();
        mgr.add_vector("embedding", 1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        mgr.add_vector("embedding", 2, &[0.0, 1.0, 0.0, 0.0]).unwrap();
        let results = mgr.search("embedding", &[1.0, 0.0, 0.0, 0.0], 2, 8).unwrap();
        assert_eq!(results.len(), 2);
    }
}
