//! Secondary index on a single property key, supporting equality, range,
//! and string-prefix lookups.
//!
//! Value bytes are encoded so that lexicographic byte order matches value
//! order — int/float/timestamp bits are transformed so big-endian byte
//! comparison agrees with numeric comparison, and strings are
//! null-byte-stuffed with an explicit terminator so prefix scans and
//! embedded NUL bytes cannot be confused.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use graphdb_api::Value;

use crate::error::{Error, Result};

/// Encodes a value so that unsigned lexicographic byte order matches the
/// value's own order. Only called after the caller has checked the value
/// matches the index's declared tag.
pub fn encode_ordered_value(v: &Value) -> Vec<u8> {
    match v {
        Value::Bool(b) => vec![u8::from(*b)],
        Value::Int(i) => {
            let u = (*i as u64) ^ 0x8000_0000_0000_0000;
            u.to_be_bytes().to_vec()
        }
        Value::Timestamp(t) => {
            let u = (*t as u64) ^ 0x8000_0000_0000_0000;
            u.to_be_bytes().to_vec()
        }
        Value::Float(f) => sortable_float_bytes(*f).to_vec(),
        Value::String(s) => stuff_bytes(s.as_bytes()),
        Value::Bytes(b) => stuff_bytes(b),
        // Arrays/vectors have no natural total order; fall back to the
        // raw tagged encoding. Equality lookups still work; range/prefix
        // queries on these types are rejected by the caller.
        other => other.encode(),
    }
}

fn sortable_float_bytes(f: f64) -> [u8; 8] {
    let bits = f.to_bits();
    let sortable = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits ^ (1 << 63)
    };
    sortable.to_be_bytes()
}

fn stuff_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 2);
    for &b in bytes {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xff);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x00);
    out
}

fn string_prefix_bytes(prefix: &str) -> Vec<u8> {
    // Same byte-stuffing as `stuff_bytes`, without the terminator, so it
    // can be used as a range lower bound that matches any continuation.
    let mut out = Vec::with_capacity(prefix.len());
    for &b in prefix.as_bytes() {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xff);
        } else {
            out.push(b);
        }
    }
    out
}

/// A single indexed property key: declared value type plus an ordered
/// map from encoded value bytes to the set of nodes holding that value.
#[derive(Debug, Clone)]
pub struct PropertyIndex {
    value_tag: u8,
    entries: BTreeMap<Vec<u8>, BTreeSet<u64>>,
}

impl PropertyIndex {
    pub fn new(value_tag: u8) -> Self {
        PropertyIndex {
            value_tag,
            entries: BTreeMap::new(),
        }
    }

    /// Reconstructs an index directly from its encoded entries, e.g. when
    /// loading a snapshot. Skips the scan/insert path since the snapshot
    /// already reflects a consistent state.
    pub fn from_raw(value_tag: u8, entries: BTreeMap<Vec<u8>, BTreeSet<u64>>) -> Self {
        PropertyIndex { value_tag, entries }
    }

    pub fn entries(&self) -> &BTreeMap<Vec<u8>, BTreeSet<u64>> {
        &self.entries
    }

    pub fn value_tag(&self) -> u8 {
        self.value_tag
    }

    fn check_tag(&self, value: &Value) -> Result<()> {
        if value.tag_byte() != self.value_tag {
            let declared = graphdb_api::tag_name(self.value_tag).unwrap_or("unknown");
            return Err(Error::InvalidArgument(format!(
                "indexed property expects {declared}, got {}",
                value.type_name()
            )));
        }
        Ok(())
    }

    pub fn insert(&mut self, value: &Value, node_id: u64) -> Result<()> {
        self.check_tag(value)?;
        self.entries
            .entry(encode_ordered_value(value))
            .or_default()
            .insert(node_id);
        Ok(())
    }

    pub fn remove(&mut self, value: &Value, node_id: u64) {
        let key = encode_ordered_value(value);
        if let Some(set) = self.entries.get_mut(&key) {
            set.remove(&node_id);
            if set.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    pub fn lookup_eq(&self, value: &Value) -> BTreeSet<u64> {
        let key = encode_ordered_value(value);
        self.entries.get(&key).cloned().unwrap_or_default()
    }

    /// Inclusive range `[lo, hi]` over encoded value bytes. `None` means
    /// unbounded on that side.
    pub fn lookup_range(&self, lo: Option<&Value>, hi: Option<&Value>) -> BTreeSet<u64> {
        let lo_key = lo.map(encode_ordered_value).unwrap_or_default();
        let range = match hi.map(encode_ordered_value) {
            Some(hi_key) => self.entries.range(lo_key..=hi_key),
            None => self.entries.range(lo_key..),
        };
        range.flat_map(|(_, ids)| ids.iter().copied()).collect()
    }

    pub fn lookup_prefix(&self, prefix: &str) -> Result<BTreeSet<u64>> {
        if graphdb_api::tag_name(self.value_tag) != Some("String") {
            return Err(Error::InvalidArgument(
                "prefix lookup is only supported on String-typed indexes".into(),
            ));
        }
        let lo = string_prefix_bytes(prefix);
        let mut hi = lo.clone();
        hi.push(0xff);
        hi.push(0xff);
        Ok(self
            .entries
            .range(lo..=hi)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect())
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Owns every currently-created property index, keyed by property key.
#[derive(Debug, Clone, Default)]
pub struct PropertyIndexManager {
    indexes: HashMap<String, PropertyIndex>,
}

impl PropertyIndexManager {
    pub fn new() -> Self {
        PropertyIndexManager {
            indexes: HashMap::new(),
        }
    }

    pub fn create_index(&mut self, key: &str, value_tag: u8) -> Result<()> {
        if self.indexes.contains_key(key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        self.indexes
            .insert(key.to_string(), PropertyIndex::new(value_tag));
        Ok(())
    }

    /// Idempotent variant used by WAL/snapshot replay: a duplicate
    /// `CreatePropertyIndex` is a no-op, not an error.
    pub fn create_index_idempotent(&mut self, key: &str, value_tag: u8) {
        self.indexes
            .entry(key.to_string())
            .or_insert_with(|| PropertyIndex::new(value_tag));
    }

    pub fn drop_index(&mut self, key: &str) -> Result<()> {
        self.indexes
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::IndexNotFound(key.to_string()))
    }

    pub fn has_index(&self, key: &str) -> bool {
        self.indexes.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&PropertyIndex> {
        self.indexes.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut PropertyIndex> {
        self.indexes.get_mut(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.indexes.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyIndex)> {
        self.indexes.iter()
    }

    /// Replaces the whole manager with a pre-built set of indexes, e.g.
    /// when loading a snapshot.
    pub fn restore(indexes: HashMap<String, PropertyIndex>) -> Self {
        PropertyIndexManager { indexes }
    }

    /// Notifies every index of a property change on `node_id`, inserting
    /// or removing as appropriate. Called from the same critical section
    /// as the mutating operation.
    pub fn on_property_changed(
        &mut self,
        node_id: u64,
        key: &str,
        old: Option<&Value>,
        new: Option<&Value>,
    ) -> Result<()> {
        let Some(index) = self.indexes.get_mut(key) else {
            return Ok(());
        };
        if let Some(old) = old {
            index.remove(old, node_id);
        }
        if let Some(new) = new {
            index.insert(new, node_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_encoding_preserves_int_order() {
        let values = vec![Value::Int(i64::MIN), Value::Int(-1), Value::Int(0), Value::Int(i64::MAX)];
        let encoded: Vec<Vec<u8>> = values.iter().map(encode_ordered_value).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn ordered_encoding_preserves_float_order() {
        let values = vec![
            Value::Float(f64::NEG_INFINITY),
            Value::Float(-1.0),
            Value::Float(-0.0),
            Value::Float(0.0),
            Value::Float(1.0),
            Value::Float(f64::INFINITY),
        ];
        let encoded: Vec<Vec<u8>> = values.iter().map(encode_ordered_value).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn reject_wrong_type_insert() {
        let mut index = PropertyIndex::new(Value::Int(0).tag_byte());
        let err = index.insert(&Value::String("x".into()), 1).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn range_lookup_returns_values_in_bounds() {
        let mut index = PropertyIndex::new(Value::Int(0).tag_byte());
        for i in 0..10i64 {
            index.insert(&Value::Int(i), i as u64).unwrap();
        }
        let ids = index.lookup_range(Some(&Value::Int(3)), Some(&Value::Int(6)));
        assert_eq!(ids, [3, 4, 5, 6].into_iter().collect());
    }

    #[test]
    fn prefix_lookup_on_string_index() {
        let mut index = PropertyIndex::new(Value::String(String::new()).tag_byte());
        index.insert(&Value::String("alice".into()), 1).unwrap();
        index.insert(&Value::String("alan".into()), 2).unwrap();
        index.insert(&Value::String("bob".into()), 3).unwrap();
        let ids = index.lookup_prefix("al").unwrap();
        assert_eq!(ids, [1, 2].into_iter().collect());
    }

    #[test]
    fn create_index_rejects_duplicate() {
        let mut mgr = PropertyIndexManager::new();
        mgr.create_index("age", Value::Int(0).tag_byte()).unwrap();
        let err = mgr.create_index("age", Value::Int(0).tag_byte()).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn drop_missing_index_is_not_found() {
        let mut mgr = PropertyIndexManager::new();
        let err = mgr.drop_index("age").unwrap_err();
        assert!(matches!(err, Error::IndexNotFound(_)));
    }
}
