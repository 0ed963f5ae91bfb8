//! The shared TTL store.
//!
//! A concurrent map from string keys to ordered multisets of byte values,
//! each value carrying its own expiry. Everything the zones remember lives
//! here: ACME challenge strings, dynamic addresses, registration metadata.
//! The store can snapshot itself to a JSON file (atomically, via a sibling
//! temp file and rename) and reload that snapshot at boot.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::RwLock;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;
use tracing::{debug, error};

use crate::util::{unix_now, write_file};

/// The store refused an insert because it is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AtCapacity(pub usize);

impl fmt::Display for AtCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at max size ({})", self.0)
    }
}

impl std::error::Error for AtCapacity {}

/// A value and the Unix second after which it no longer exists.
#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ValueWithExpiration {
    #[serde(rename = "Expires")]
    pub expires: u32,
    #[serde(rename = "Value")]
    #[serde_as(as = "Base64")]
    pub value: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    m: HashMap<String, Vec<ValueWithExpiration>>,
    size: usize,
    dirty: bool,
}

impl Inner {
    fn add(&mut self, max_size: usize, key: &str, val: Vec<u8>, ttl: u32) -> Result<(), AtCapacity> {
        if max_size > 0 && self.size >= max_size {
            return Err(AtCapacity(self.size));
        }
        self.m.entry(key.to_owned()).or_default().push(ValueWithExpiration {
            expires: unix_now() + ttl,
            value: val,
        });
        self.size += 1;
        self.dirty = true;
        Ok(())
    }
}

/// The concurrent TTL store.
///
/// Readers share the lock; mutations and the snapshot writer take it
/// exclusively, so a snapshot always reflects a consistent size.
pub struct TtlStore {
    max_size: usize,
    inner: RwLock<Inner>,
}

impl TtlStore {
    /// An unbounded store.
    pub fn new() -> Self {
        Self::with_max_size(0)
    }

    /// A store refusing inserts once `max_size` values are held. Zero means
    /// unbounded.
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            max_size,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Append `val` to the values of `key`.
    pub fn add(&self, key: &str, val: &[u8], ttl: u32) -> Result<(), AtCapacity> {
        let mut inner = self.inner.write().unwrap();
        inner.add(self.max_size, key, val.to_vec(), ttl)
    }

    /// Replace all values of `key` with `val`.
    pub fn set(&self, key: &str, val: &[u8], ttl: u32) -> Result<(), AtCapacity> {
        let mut inner = self.inner.write().unwrap();
        if let Some(old) = inner.m.remove(key) {
            inner.size -= old.len();
        }
        inner.add(self.max_size, key, val.to_vec(), ttl)
    }

    /// The first non-expired value of `key`.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let inner = self.inner.read().unwrap();
        let now = unix_now();
        inner
            .m
            .get(key)?
            .iter()
            .find(|v| v.expires > now)
            .map(|v| v.value.clone())
    }

    /// All non-expired values of `key`, insertion order preserved.
    pub fn values(&self, key: &str) -> Vec<Vec<u8>> {
        let inner = self.inner.read().unwrap();
        let now = unix_now();
        inner
            .m
            .get(key)
            .map(|vals| {
                vals.iter()
                    .filter(|v| v.expires > now)
                    .map(|v| v.value.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All keys starting with `prefix`, in no particular order.
    pub fn list(&self, prefix: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner
            .m
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Delete every entry of `key` whose value equals `val`.
    pub fn remove(&self, key: &str, val: &[u8]) {
        let mut inner = self.inner.write().unwrap();
        let (removed, now_empty) = match inner.m.get_mut(key) {
            Some(vals) => {
                let before = vals.len();
                vals.retain(|v| v.value != val);
                (before - vals.len(), vals.is_empty())
            }
            None => return,
        };
        if removed > 0 {
            if now_empty {
                inner.m.remove(key);
            }
            inner.size -= removed;
            inner.dirty = true;
        }
    }

    /// Drop `key` and all its values.
    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(old) = inner.m.remove(key) {
            inner.size -= old.len();
            inner.dirty = true;
        }
    }

    /// Live plus expired-but-unpruned value count.
    pub fn size(&self) -> usize {
        self.inner.read().unwrap().size
    }

    /// Drop every expired entry; marks the store dirty only when something
    /// was actually removed.
    pub fn prune(&self) {
        let mut inner = self.inner.write().unwrap();
        let now = unix_now();
        let mut removed = 0;
        inner.m.retain(|_, vals| {
            let before = vals.len();
            vals.retain(|v| v.expires > now);
            removed += before - vals.len();
            !vals.is_empty()
        });
        if removed > 0 {
            inner.size -= removed;
            inner.dirty = true;
        }
    }

    /// Serialize the whole map to `path` via a sibling temp file. Clears the
    /// dirty flag on success.
    pub fn write_file(&self, path: &Utf8Path) -> io::Result<()> {
        let mut inner = self.inner.write().unwrap();
        let json = serde_json::to_vec_pretty(&inner.m)?;
        write_file(path, &json)?;
        inner.dirty = false;
        Ok(())
    }

    /// Load a snapshot. A missing file is not an error; a malformed one is.
    pub fn load_file(&self, path: &Utf8Path) -> io::Result<()> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        let m: HashMap<String, Vec<ValueWithExpiration>> = serde_json::from_slice(&data)?;
        let size = m.values().map(Vec::len).sum();
        let mut inner = self.inner.write().unwrap();
        inner.m = m;
        inner.size = size;
        Ok(())
    }

    fn dirty(&self) -> bool {
        self.inner.read().unwrap().dirty
    }

    /// Prune on a fixed cadence, forever.
    pub async fn prune_periodically(&self, interval: Duration) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tick.tick().await;
            self.prune();
        }
    }

    /// Snapshot to `path` whenever the store got dirty, forever. A failed
    /// write leaves the flag set so the next tick retries.
    pub async fn write_file_periodically(&self, path: Utf8PathBuf, interval: Duration) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tick.tick().await;
            if self.dirty() {
                match self.write_file(&path) {
                    Ok(()) => debug!("wrote store snapshot to {path}"),
                    Err(err) => error!("failed to write store snapshot to {path}: {err}"),
                }
            }
        }
    }
}

impl Default for TtlStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_appends_and_values_preserve_order() {
        let store = TtlStore::new();
        store.add("k", b"one", 60).unwrap();
        store.add("k", b"two", 60).unwrap();
        assert_eq!(store.values("k"), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(store.get("k"), Some(b"one".to_vec()));
        assert_eq!(store.size(), 2);
    }

    #[test]
    fn set_replaces_regardless_of_prior_state() {
        let store = TtlStore::new();
        store.add("k", b"one", 60).unwrap();
        store.add("k", b"two", 60).unwrap();
        store.set("k", b"three", 60).unwrap();
        assert_eq!(store.values("k"), vec![b"three".to_vec()]);
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn capacity_is_enforced_for_add_but_freed_by_set() {
        let store = TtlStore::with_max_size(2);
        store.add("a", b"1", 60).unwrap();
        store.add("b", b"2", 60).unwrap();
        assert_eq!(store.add("c", b"3", 60), Err(AtCapacity(2)));
        // replacing an existing key frees its slot first
        store.set("a", b"4", 60).unwrap();
        assert_eq!(store.size(), 2);
    }

    #[test]
    fn expired_values_are_invisible_and_pruned() {
        let store = TtlStore::new();
        store.add("k", b"dead", 0).unwrap();
        store.add("k", b"live", 60).unwrap();
        assert_eq!(store.values("k"), vec![b"live".to_vec()]);
        // still counted until a prune pass runs
        assert_eq!(store.size(), 2);
        store.prune();
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn remove_deletes_matching_values_only() {
        let store = TtlStore::new();
        store.add("k", b"x", 60).unwrap();
        store.add("k", b"y", 60).unwrap();
        store.add("k", b"x", 60).unwrap();
        store.remove("k", b"x");
        assert_eq!(store.values("k"), vec![b"y".to_vec()]);
        store.remove("k", b"y");
        assert!(store.list("").is_empty());
    }

    #[test]
    fn list_filters_by_prefix() {
        let store = TtlStore::new();
        store.add("myaddr:foo", b"1", 60).unwrap();
        store.add("myaddr:bar", b"1", 60).unwrap();
        store.add("other", b"1", 60).unwrap();
        let mut keys = store.list("myaddr:");
        keys.sort();
        assert_eq!(keys, vec!["myaddr:bar", "myaddr:foo"]);
    }

    #[test]
    fn snapshot_round_trip_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("db.json");

        let store = TtlStore::new();
        store.add("k", b"\x01\x02binary", 600).unwrap();
        store.add("k", b"second", 600).unwrap();
        store.add("other", b"third", 600).unwrap();
        store.write_file(&path).unwrap();
        assert!(!store.dirty());

        let restored = TtlStore::new();
        restored.load_file(&path).unwrap();
        assert_eq!(restored.size(), 3);
        assert_eq!(
            restored.values("k"),
            vec![b"\x01\x02binary".to_vec(), b"second".to_vec()]
        );
    }

    #[test]
    fn loading_a_missing_file_is_fine() {
        let store = TtlStore::new();
        store
            .load_file(Utf8Path::new("/nonexistent/db.json"))
            .unwrap();
        assert_eq!(store.size(), 0);
    }
}
