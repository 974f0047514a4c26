//! Durable key→(value, revision) catalog client with change notifications.
//!
//! The catalog is a namespaced key-value store: every key is
//! `<catalog>_<identity>`, revisions are opaque and monotone per key, and
//! registered callbacks observe every change to a catalog, including
//! deletions, where the value is absent. Callback invocations are serial per
//! catalog; ordering across catalogs is not guaranteed.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use spansync_base::constants::KEY_PARTS_DELIMITER;
use spansync_base::types::Revision;

use crate::error::MetadataError;

/// One entry returned by a catalog enumeration.
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogEntry {
    /// Full catalog key, `<catalog>_<identity>`.
    pub key: String,
    /// The stored value.
    pub value: Vec<u8>,
    /// Revision of the stored value.
    pub revision: Revision,
}

/// Change-notification callback: `(path, value, revision)`.
///
/// `value` is `None` when the key was deleted.
pub type CatalogCallback = Arc<dyn Fn(&str, Option<&[u8]>, Option<Revision>) + Send + Sync>;

/// Client interface to the durable metadata store.
///
/// This trait abstracts over the storage backend so the services can run
/// against an in-memory store in tests and a networked store in production.
pub trait MetadataCatalog: Send + Sync {
    /// Reads a key. Fails with `KeyNotFound` when absent.
    fn get(&self, key: &str) -> Result<(Vec<u8>, Revision), MetadataError>;

    /// Inserts a key under a catalog. Fails with `AlreadyExists` when present.
    fn add_with_catalog(&self, catalog: &str, key: &str, value: Vec<u8>)
        -> Result<(), MetadataError>;

    /// Compare-and-swap write. Fails with `RevisionMismatch` when `revision`
    /// is not the key's current revision, `KeyNotFound` when absent.
    fn set(&self, key: &str, value: Vec<u8>, revision: Revision) -> Result<(), MetadataError>;

    /// Compare-and-swap delete under a catalog.
    fn del_with_catalog(
        &self,
        catalog: &str,
        key: &str,
        revision: Revision,
    ) -> Result<(), MetadataError>;

    /// Enumerates every entry whose key belongs to `catalog`.
    fn get_all_from_catalog(&self, catalog: &str) -> Result<Vec<CatalogEntry>, MetadataError>;

    /// Registers a change callback for `catalog`.
    fn register_callback(&self, catalog: &str, callback: CatalogCallback);
}

/// Builds the full catalog key for an identity.
pub fn catalog_key(catalog: &str, id: &str) -> String {
    format!("{catalog}{KEY_PARTS_DELIMITER}{id}")
}

/// Strips the catalog prefix from a full key.
///
/// Panics when the key does not carry the expected prefix: keys flow in only
/// from this catalog's own notifications, so a foreign prefix is broken
/// wiring, not caller input.
pub fn id_from_catalog_key(catalog: &str, key: &str) -> String {
    let prefix = format!("{catalog}{KEY_PARTS_DELIMITER}");
    match key.strip_prefix(&prefix) {
        Some(id) => id.to_string(),
        None => panic!("got unexpected key {key} for catalog {catalog}"),
    }
}

/// In-memory `MetadataCatalog` for tests and single-process deployments.
///
/// Mutations to a catalog are serialized through a per-catalog dispatch lock,
/// which is held across the data write and the callback fan-out so that
/// callbacks observe changes to one catalog in write order.
pub struct MemoryCatalog {
    data: RwLock<BTreeMap<String, (Vec<u8>, Revision)>>,
    next_revision: AtomicU64,
    callbacks: RwLock<HashMap<String, Vec<CatalogCallback>>>,
    dispatch: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryCatalog {
    /// Creates an empty catalog store.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            next_revision: AtomicU64::new(1),
            callbacks: RwLock::new(HashMap::new()),
            dispatch: Mutex::new(HashMap::new()),
        }
    }

    fn bump_revision(&self) -> Revision {
        Revision::new(self.next_revision.fetch_add(1, Ordering::Relaxed))
    }

    fn dispatch_lock(&self, catalog: &str) -> Arc<Mutex<()>> {
        let mut locks = self.dispatch.lock().expect("lock poisoned");
        locks
            .entry(catalog.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn notify(&self, catalog: &str, key: &str, value: Option<&[u8]>, revision: Option<Revision>) {
        let callbacks = {
            let registry = self.callbacks.read().expect("lock poisoned");
            registry.get(catalog).cloned().unwrap_or_default()
        };
        for callback in callbacks {
            callback(key, value, revision);
        }
    }

    /// Derives the catalog name from a full key (everything before the first
    /// delimiter). Used for dispatch on `set`, which takes no catalog.
    fn catalog_of(key: &str) -> &str {
        key.split(KEY_PARTS_DELIMITER).next().unwrap_or(key)
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataCatalog for MemoryCatalog {
    fn get(&self, key: &str) -> Result<(Vec<u8>, Revision), MetadataError> {
        let data = self.data.read().expect("lock poisoned");
        data.get(key)
            .map(|(value, revision)| (value.clone(), *revision))
            .ok_or_else(|| MetadataError::KeyNotFound {
                key: key.to_string(),
            })
    }

    fn add_with_catalog(
        &self,
        catalog: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), MetadataError> {
        let dispatch = self.dispatch_lock(catalog);
        let _serial = dispatch.lock().expect("lock poisoned");

        let revision = {
            let mut data = self.data.write().expect("lock poisoned");
            if data.contains_key(key) {
                return Err(MetadataError::AlreadyExists {
                    what: format!("key \"{key}\""),
                });
            }
            let revision = self.bump_revision();
            data.insert(key.to_string(), (value.clone(), revision));
            revision
        };

        self.notify(catalog, key, Some(&value), Some(revision));
        Ok(())
    }

    fn set(&self, key: &str, value: Vec<u8>, revision: Revision) -> Result<(), MetadataError> {
        let catalog = Self::catalog_of(key).to_string();
        let dispatch = self.dispatch_lock(&catalog);
        let _serial = dispatch.lock().expect("lock poisoned");

        let new_revision = {
            let mut data = self.data.write().expect("lock poisoned");
            let current = data.get(key).ok_or_else(|| MetadataError::KeyNotFound {
                key: key.to_string(),
            })?;
            if current.1 != revision {
                return Err(MetadataError::RevisionMismatch {
                    key: key.to_string(),
                });
            }
            let new_revision = self.bump_revision();
            data.insert(key.to_string(), (value.clone(), new_revision));
            new_revision
        };

        self.notify(&catalog, key, Some(&value), Some(new_revision));
        Ok(())
    }

    fn del_with_catalog(
        &self,
        catalog: &str,
        key: &str,
        revision: Revision,
    ) -> Result<(), MetadataError> {
        let dispatch = self.dispatch_lock(catalog);
        let _serial = dispatch.lock().expect("lock poisoned");

        {
            let mut data = self.data.write().expect("lock poisoned");
            let current = data.get(key).ok_or_else(|| MetadataError::KeyNotFound {
                key: key.to_string(),
            })?;
            if current.1 != revision {
                return Err(MetadataError::RevisionMismatch {
                    key: key.to_string(),
                });
            }
            data.remove(key);
        }

        self.notify(catalog, key, None, None);
        Ok(())
    }

    fn get_all_from_catalog(&self, catalog: &str) -> Result<Vec<CatalogEntry>, MetadataError> {
        let prefix = format!("{catalog}{KEY_PARTS_DELIMITER}");
        let data = self.data.read().expect("lock poisoned");
        let mut entries = Vec::new();
        for (key, (value, revision)) in data.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            entries.push(CatalogEntry {
                key: key.clone(),
                value: value.clone(),
                revision: *revision,
            });
        }
        Ok(entries)
    }

    fn register_callback(&self, catalog: &str, callback: CatalogCallback) {
        let mut registry = self.callbacks.write().expect("lock poisoned");
        registry.entry(catalog.to_string()).or_default().push(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_add_get() {
        let catalog = MemoryCatalog::new();
        catalog
            .add_with_catalog("specs", "specs_a", b"v1".to_vec())
            .unwrap();

        let (value, revision) = catalog.get("specs_a").unwrap();
        assert_eq!(value, b"v1".to_vec());
        assert!(revision.as_u64() > 0);
    }

    #[test]
    fn test_add_duplicate_rejected() {
        let catalog = MemoryCatalog::new();
        catalog
            .add_with_catalog("specs", "specs_a", b"v1".to_vec())
            .unwrap();

        let err = catalog
            .add_with_catalog("specs", "specs_a", b"v2".to_vec())
            .unwrap_err();
        assert!(matches!(err, MetadataError::AlreadyExists { .. }));
    }

    #[test]
    fn test_get_missing() {
        let catalog = MemoryCatalog::new();
        let err = catalog.get("specs_nope").unwrap_err();
        assert!(matches!(err, MetadataError::KeyNotFound { .. }));
    }

    #[test]
    fn test_set_bumps_revision() {
        let catalog = MemoryCatalog::new();
        catalog
            .add_with_catalog("specs", "specs_a", b"v1".to_vec())
            .unwrap();
        let (_, rev1) = catalog.get("specs_a").unwrap();

        catalog.set("specs_a", b"v2".to_vec(), rev1).unwrap();
        let (value, rev2) = catalog.get("specs_a").unwrap();

        assert_eq!(value, b"v2".to_vec());
        assert!(rev2 > rev1);
    }

    #[test]
    fn test_set_stale_revision_rejected() {
        let catalog = MemoryCatalog::new();
        catalog
            .add_with_catalog("specs", "specs_a", b"v1".to_vec())
            .unwrap();
        let (_, rev1) = catalog.get("specs_a").unwrap();
        catalog.set("specs_a", b"v2".to_vec(), rev1).unwrap();

        let err = catalog.set("specs_a", b"v3".to_vec(), rev1).unwrap_err();
        assert!(matches!(err, MetadataError::RevisionMismatch { .. }));
    }

    #[test]
    fn test_del_with_stale_revision_rejected() {
        let catalog = MemoryCatalog::new();
        catalog
            .add_with_catalog("specs", "specs_a", b"v1".to_vec())
            .unwrap();
        let (_, rev1) = catalog.get("specs_a").unwrap();
        catalog.set("specs_a", b"v2".to_vec(), rev1).unwrap();

        let err = catalog.del_with_catalog("specs", "specs_a", rev1).unwrap_err();
        assert!(matches!(err, MetadataError::RevisionMismatch { .. }));
    }

    #[test]
    fn test_del_removes_key() {
        let catalog = MemoryCatalog::new();
        catalog
            .add_with_catalog("specs", "specs_a", b"v1".to_vec())
            .unwrap();
        let (_, rev) = catalog.get("specs_a").unwrap();

        catalog.del_with_catalog("specs", "specs_a", rev).unwrap();
        assert!(catalog.get("specs_a").is_err());

        let err = catalog.del_with_catalog("specs", "specs_a", rev).unwrap_err();
        assert!(matches!(err, MetadataError::KeyNotFound { .. }));
    }

    #[test]
    fn test_enumeration_filters_by_catalog() {
        let catalog = MemoryCatalog::new();
        catalog
            .add_with_catalog("specs", "specs_a", b"1".to_vec())
            .unwrap();
        catalog
            .add_with_catalog("specs", "specs_b", b"2".to_vec())
            .unwrap();
        catalog
            .add_with_catalog("clusters", "clusters_x", b"3".to_vec())
            .unwrap();

        let entries = catalog.get_all_from_catalog("specs").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "specs_a");
        assert_eq!(entries[1].key, "specs_b");
    }

    #[test]
    fn test_callback_sees_writes_and_deletes() {
        let catalog = MemoryCatalog::new();
        let seen: Arc<Mutex<Vec<(String, Option<Vec<u8>>)>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        catalog.register_callback(
            "specs",
            Arc::new(move |path, value, _rev| {
                sink.lock()
                    .unwrap()
                    .push((path.to_string(), value.map(|v| v.to_vec())));
            }),
        );

        catalog
            .add_with_catalog("specs", "specs_a", b"v1".to_vec())
            .unwrap();
        let (_, rev) = catalog.get("specs_a").unwrap();
        catalog.set("specs_a", b"v2".to_vec(), rev).unwrap();
        let (_, rev) = catalog.get("specs_a").unwrap();
        catalog.del_with_catalog("specs", "specs_a", rev).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], ("specs_a".to_string(), Some(b"v1".to_vec())));
        assert_eq!(seen[1], ("specs_a".to_string(), Some(b"v2".to_vec())));
        assert_eq!(seen[2], ("specs_a".to_string(), None));
    }

    #[test]
    fn test_callback_scoped_to_catalog() {
        let catalog = MemoryCatalog::new();
        let count = Arc::new(AtomicUsize::new(0));

        let sink = count.clone();
        catalog.register_callback(
            "specs",
            Arc::new(move |_, _, _| {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
        );

        catalog
            .add_with_catalog("clusters", "clusters_x", b"1".to_vec())
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        catalog
            .add_with_catalog("specs", "specs_a", b"1".to_vec())
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_key_helpers() {
        assert_eq!(catalog_key("replicationSpec", "a_u_b"), "replicationSpec_a_u_b");
        assert_eq!(
            id_from_catalog_key("replicationSpec", "replicationSpec_a_u_b"),
            "a_u_b"
        );
    }

    #[test]
    #[should_panic(expected = "unexpected key")]
    fn test_foreign_key_panics() {
        id_from_catalog_key("replicationSpec", "remoteCluster_x");
    }
}
