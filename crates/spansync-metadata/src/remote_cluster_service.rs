//! Registry of remote-cluster references, validated against live remotes.
//!
//! Every mutation is validated by probing the remote's management endpoint,
//! then written through the catalog, re-read to capture the confirmed
//! revision, and only then cached. The catalog change callback re-applies
//! the same state, so a node that did not originate a change converges
//! through the notification path.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use spansync_base::constants::REMOTE_CLUSTERS_CATALOG;
use spansync_base::types::Revision;

use crate::cache::MetadataCache;
use crate::catalog::{catalog_key, id_from_catalog_key, MetadataCatalog};
use crate::error::MetadataError;
use crate::external::UiLogSvc;
use crate::probe::ClusterProber;
use crate::remote_cluster::RemoteClusterReference;

/// Registry of remote clusters keyed by uuid, with name as a unique
/// secondary key.
pub struct RemoteClusterService {
    catalog: Arc<dyn MetadataCatalog>,
    cache: MetadataCache<RemoteClusterReference>,
    prober: Arc<dyn ClusterProber>,
    uilog: Arc<dyn UiLogSvc>,
}

impl RemoteClusterService {
    /// Creates the service and loads its cache from the catalog.
    pub fn new(
        catalog: Arc<dyn MetadataCatalog>,
        prober: Arc<dyn ClusterProber>,
        uilog: Arc<dyn UiLogSvc>,
    ) -> Result<Self, MetadataError> {
        let cache = MetadataCache::new();
        for entry in catalog.get_all_from_catalog(REMOTE_CLUSTERS_CATALOG)? {
            let reference = RemoteClusterReference::decode(&entry.value, Some(entry.revision))?;
            cache.upsert(&reference.uuid.clone(), reference);
        }
        info!(
            clusters = cache.len(),
            "remote cluster cache initialized"
        );
        Ok(Self {
            catalog,
            cache,
            prober,
            uilog,
        })
    }

    /// Validates, persists, and caches a new remote-cluster reference.
    ///
    /// The uuid advertised by the live probe is captured as authoritative.
    pub async fn add_remote_cluster(
        &self,
        mut reference: RemoteClusterReference,
    ) -> Result<RemoteClusterReference, MetadataError> {
        reference.validate_shape()?;
        if self.find_by_name(&reference.name).is_some() {
            return Err(MetadataError::AlreadyExists {
                what: format!("remote cluster \"{}\"", reference.name),
            });
        }

        let outcome = self.prober.probe(&reference).await?;
        reference.uuid = outcome.uuid;
        if self.cache.get(&reference.uuid).is_some() {
            return Err(MetadataError::AlreadyExists {
                what: format!("remote cluster with uuid \"{}\"", reference.uuid),
            });
        }

        let key = catalog_key(REMOTE_CLUSTERS_CATALOG, &reference.uuid);
        self.catalog
            .add_with_catalog(REMOTE_CLUSTERS_CATALOG, &key, reference.encode()?)?;
        reference.revision = Some(self.reread_revision(&key, &reference.name)?);

        self.cache.upsert(&reference.uuid.clone(), reference.clone());
        info!(name = %reference.name, uuid = %reference.uuid, "remote cluster added");
        self.uilog.write(&format!(
            "Remote cluster reference \"{}\" created.",
            reference.name
        ));
        Ok(reference)
    }

    /// Revision-checked update of the reference currently named `name`.
    ///
    /// A rename requires the new name to be unused. If the probe reveals
    /// that the seed now fronts a different cluster, the catalog entry moves
    /// to the new uuid.
    pub async fn set_remote_cluster(
        &self,
        name: &str,
        mut reference: RemoteClusterReference,
    ) -> Result<RemoteClusterReference, MetadataError> {
        let existing = self
            .find_by_name(name)
            .ok_or_else(|| MetadataError::ClusterNotFound {
                name: name.to_string(),
            })?;
        reference.validate_shape()?;
        if reference.name != name && self.find_by_name(&reference.name).is_some() {
            return Err(MetadataError::AlreadyExists {
                what: format!("remote cluster \"{}\"", reference.name),
            });
        }

        let outcome = self.prober.probe(&reference).await?;
        reference.uuid = outcome.uuid;

        let existing_revision = cached_revision(&existing)?;
        let key = catalog_key(REMOTE_CLUSTERS_CATALOG, &reference.uuid);
        if reference.uuid == existing.uuid {
            self.catalog.set(&key, reference.encode()?, existing_revision)?;
        } else {
            // The seed moved to a different cluster: the entry is re-keyed.
            let old_key = catalog_key(REMOTE_CLUSTERS_CATALOG, &existing.uuid);
            self.catalog
                .del_with_catalog(REMOTE_CLUSTERS_CATALOG, &old_key, existing_revision)?;
            self.catalog
                .add_with_catalog(REMOTE_CLUSTERS_CATALOG, &key, reference.encode()?)?;
            self.cache.delete(&existing.uuid);
        }
        reference.revision = Some(self.reread_revision(&key, &reference.name)?);

        self.cache.upsert(&reference.uuid.clone(), reference.clone());
        info!(name = %reference.name, uuid = %reference.uuid, "remote cluster updated");
        self.uilog.write(&format!(
            "Remote cluster reference \"{}\" updated.",
            reference.name
        ));
        Ok(reference)
    }

    /// Revision-checked delete of the reference named `name`.
    pub fn del_remote_cluster_by_ref_name(
        &self,
        name: &str,
    ) -> Result<RemoteClusterReference, MetadataError> {
        let existing = self
            .find_by_name(name)
            .ok_or_else(|| MetadataError::ClusterNotFound {
                name: name.to_string(),
            })?;

        let key = catalog_key(REMOTE_CLUSTERS_CATALOG, &existing.uuid);
        self.catalog.del_with_catalog(
            REMOTE_CLUSTERS_CATALOG,
            &key,
            cached_revision(&existing)?,
        )?;
        self.cache.delete(&existing.uuid);

        info!(name = %existing.name, uuid = %existing.uuid, "remote cluster removed");
        self.uilog.write(&format!(
            "Remote cluster reference \"{}\" deleted.",
            existing.name
        ));
        Ok(existing)
    }

    /// Looks up a reference by its unique name.
    pub async fn remote_cluster_by_ref_name(
        &self,
        name: &str,
        refresh: bool,
    ) -> Result<RemoteClusterReference, MetadataError> {
        let reference = self
            .find_by_name(name)
            .ok_or_else(|| MetadataError::ClusterNotFound {
                name: name.to_string(),
            })?;
        if refresh {
            return self.refresh(reference).await;
        }
        Ok(reference)
    }

    /// Looks up a reference by its cluster uuid.
    pub async fn remote_cluster_by_uuid(
        &self,
        uuid: &str,
        refresh: bool,
    ) -> Result<RemoteClusterReference, MetadataError> {
        let reference = self
            .cache
            .get(uuid)
            .ok_or_else(|| MetadataError::ClusterNotFound {
                name: uuid.to_string(),
            })?;
        if refresh {
            return self.refresh(reference).await;
        }
        Ok(reference)
    }

    /// Enumerates all known references, keyed by name.
    ///
    /// With `refresh`, every reference is re-probed; a reference whose remote
    /// cannot be reached keeps its cached state.
    pub async fn remote_clusters(
        &self,
        refresh: bool,
    ) -> Result<HashMap<String, RemoteClusterReference>, MetadataError> {
        let mut references = HashMap::new();
        for (_, reference) in self.cache.snapshot() {
            let reference = if refresh {
                match self.refresh(reference.clone()).await {
                    Ok(refreshed) => refreshed,
                    Err(err) => {
                        warn!(name = %reference.name, error = %err, "refresh failed, serving cached reference");
                        reference
                    }
                }
            } else {
                reference
            };
            references.insert(reference.name.clone(), reference);
        }
        Ok(references)
    }

    /// Human name of the cluster with `uuid`, if known.
    pub fn name_from_cluster_uuid(&self, uuid: &str) -> Option<String> {
        self.cache.get(uuid).map(|reference| reference.name)
    }

    /// Change-notification callback for the remote-cluster catalog.
    ///
    /// Reconstructs the reference from the payload and upserts it into the
    /// cache; an absent value deletes. Returns the affected uuid and the new
    /// state so a dispatcher can inform downstream listeners.
    pub fn remote_cluster_service_callback(
        &self,
        path: &str,
        value: Option<&[u8]>,
        revision: Option<Revision>,
    ) -> Result<(String, Option<RemoteClusterReference>), MetadataError> {
        debug!(path, "remote cluster service callback");
        let uuid = id_from_catalog_key(REMOTE_CLUSTERS_CATALOG, path);

        match value {
            Some(value) => {
                let reference = RemoteClusterReference::decode(value, revision)?;
                self.cache.upsert(&uuid, reference.clone());
                Ok((uuid, Some(reference)))
            }
            None => {
                self.cache.delete(&uuid);
                Ok((uuid, None))
            }
        }
    }

    /// Re-probes a reference and re-captures its uuid if the seed has moved.
    async fn refresh(
        &self,
        mut reference: RemoteClusterReference,
    ) -> Result<RemoteClusterReference, MetadataError> {
        let outcome = self.prober.probe(&reference).await?;
        if outcome.uuid == reference.uuid {
            return Ok(reference);
        }

        info!(
            name = %reference.name,
            old_uuid = %reference.uuid,
            new_uuid = %outcome.uuid,
            "seed node now fronts a different cluster, re-capturing uuid"
        );
        let old_uuid = std::mem::replace(&mut reference.uuid, outcome.uuid);
        let old_key = catalog_key(REMOTE_CLUSTERS_CATALOG, &old_uuid);
        let key = catalog_key(REMOTE_CLUSTERS_CATALOG, &reference.uuid);
        self.catalog.del_with_catalog(
            REMOTE_CLUSTERS_CATALOG,
            &old_key,
            cached_revision(&reference)?,
        )?;
        self.catalog
            .add_with_catalog(REMOTE_CLUSTERS_CATALOG, &key, reference.encode()?)?;
        reference.revision = Some(self.reread_revision(&key, &reference.name)?);

        self.cache.delete(&old_uuid);
        self.cache.upsert(&reference.uuid.clone(), reference.clone());
        Ok(reference)
    }

    fn find_by_name(&self, name: &str) -> Option<RemoteClusterReference> {
        self.cache
            .snapshot()
            .into_values()
            .find(|reference| reference.name == name)
    }

    fn reread_revision(&self, key: &str, name: &str) -> Result<Revision, MetadataError> {
        let (_, revision) = self.catalog.get(key).map_err(|err| MetadataError::Storage {
            msg: format!("failed to read back remote cluster \"{name}\": {err}"),
        })?;
        Ok(revision)
    }
}

fn cached_revision(reference: &RemoteClusterReference) -> Result<Revision, MetadataError> {
    reference
        .revision
        .ok_or_else(|| MetadataError::Storage {
            msg: format!(
                "cached remote cluster \"{}\" carries no revision",
                reference.name
            ),
        })
}
