//! Registry of replication declarations: validation, persistence,
//! garbage collection, and derived-object attachment.
//!
//! Every write goes persist → re-read → cache, so the cache never holds a
//! spec whose revision the store has not confirmed. Deleting a spec is a
//! soft removal: the cache entry survives while an externally-owned derived
//! object is still attached, so its owner can clean up without racing the
//! delete. The entry disappears only once both payloads are absent.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use spansync_base::constants::{
    FROM_BUCKET, MIN_MEMCACHED_COMPAT_VERSION, PLACEHOLDER_FIELD_KEY, REPLICATION_SPECS_CATALOG,
    TO_BUCKET, TO_CLUSTER,
};
use spansync_base::types::{ReplicationId, Revision};

use crate::cache::MetadataCache;
use crate::catalog::{catalog_key, id_from_catalog_key, MetadataCatalog};
use crate::error::MetadataError;
use crate::external::{BucketSvc, ClusterInfoSvc, TopologySvc, UiLogSvc};
use crate::remote_cluster::RemoteClusterReference;
use crate::remote_cluster_service::RemoteClusterService;
use crate::spec::{ReplicationSettings, ReplicationSpecification};

/// Externally-owned handle attached to a spec, typically a running pipeline.
pub type DerivedObj = Arc<dyn Any + Send + Sync>;

/// What the cache holds per replication identity.
///
/// One entry, two optional payloads: the two fields must move together, so
/// soft delete can clear the spec while the derived object pins the entry.
#[derive(Clone, Default)]
pub struct ReplicationSpecEntry {
    /// The live spec; absent after a soft delete.
    pub spec: Option<ReplicationSpecification>,
    /// The attached derived object.
    pub derived: Option<DerivedObj>,
}

/// Outcome of validating a prospective replication declaration.
///
/// Field errors are keyed by the admin-surface field names so the caller can
/// render per-field diagnostics; all applicable checks run, none masks
/// another.
pub struct NewSpecValidation {
    /// Uuid of the source bucket, when it resolved.
    pub source_bucket_uuid: String,
    /// Uuid of the target bucket, when it resolved.
    pub target_bucket_uuid: String,
    /// The resolved target cluster reference, when it exists.
    pub target_ref: Option<RemoteClusterReference>,
    /// Field-scoped validation failures; empty means the declaration is valid.
    pub errors: HashMap<&'static str, MetadataError>,
}

/// What a catalog change callback decoded and applied.
pub struct SpecChangeOutcome {
    /// The affected replication identity.
    pub id: ReplicationId,
    /// The derived object attached before the change was applied.
    pub old_derived: Option<DerivedObj>,
    /// The new spec; absent when the change was a deletion.
    pub new_spec: Option<ReplicationSpecification>,
}

struct TargetSideValidation {
    target_bucket_uuid: String,
    target_ref: Option<RemoteClusterReference>,
    errors: HashMap<&'static str, MetadataError>,
    duplicate_check_eligible: bool,
}

/// The authoritative registry of replication declarations.
pub struct ReplicationSpecService {
    catalog: Arc<dyn MetadataCatalog>,
    cache: MetadataCache<ReplicationSpecEntry>,
    remote_cluster_svc: Arc<RemoteClusterService>,
    topology_svc: Arc<dyn TopologySvc>,
    bucket_svc: Arc<dyn BucketSvc>,
    cluster_info_svc: Arc<dyn ClusterInfoSvc>,
    uilog: Arc<dyn UiLogSvc>,
}

impl ReplicationSpecService {
    /// Creates the service and loads its cache from the catalog.
    pub fn new(
        catalog: Arc<dyn MetadataCatalog>,
        remote_cluster_svc: Arc<RemoteClusterService>,
        topology_svc: Arc<dyn TopologySvc>,
        bucket_svc: Arc<dyn BucketSvc>,
        cluster_info_svc: Arc<dyn ClusterInfoSvc>,
        uilog: Arc<dyn UiLogSvc>,
    ) -> Result<Self, MetadataError> {
        let service = Self {
            catalog,
            cache: MetadataCache::new(),
            remote_cluster_svc,
            topology_svc,
            bucket_svc,
            cluster_info_svc,
            uilog,
        };
        for entry in service
            .catalog
            .get_all_from_catalog(REPLICATION_SPECS_CATALOG)?
        {
            let spec = ReplicationSpecification::decode(&entry.value, Some(entry.revision))?;
            service.cache_spec(&spec.id.clone(), Some(spec));
        }
        info!(specs = service.cache.len(), "replication spec cache initialized");
        Ok(service)
    }

    /// Looks up the live spec under `id`.
    ///
    /// A soft-removed entry (spec cleared, derived object pinned) reports
    /// not-found even though the cache entry still exists.
    pub fn replication_spec(
        &self,
        id: &ReplicationId,
    ) -> Result<ReplicationSpecification, MetadataError> {
        self.cache
            .get(id.as_str())
            .and_then(|entry| entry.spec)
            .ok_or_else(|| MetadataError::SpecNotFound { id: id.to_string() })
    }

    /// Resolves current source and target bucket uuids and builds a fresh
    /// spec. Nothing is persisted.
    pub async fn construct_new_replication_spec(
        &self,
        source_bucket: &str,
        target_cluster_uuid: &str,
        target_bucket: &str,
    ) -> Result<ReplicationSpecification, MetadataError> {
        let source_bucket_uuid = self.source_bucket_uuid(source_bucket).await?;
        let target_bucket_uuid = self
            .target_bucket_uuid(target_cluster_uuid, target_bucket)
            .await?;
        Ok(ReplicationSpecification::new(
            source_bucket,
            source_bucket_uuid,
            target_cluster_uuid,
            target_bucket,
            target_bucket_uuid,
        ))
    }

    /// Field-scoped validation of a prospective declaration.
    ///
    /// The source-side and target-side checks run concurrently. Checks do not
    /// mask each other; the only early exit is a missing target cluster
    /// reference, which makes the remaining target-side checks impossible.
    pub async fn validate_new_replication_spec(
        &self,
        source_bucket: &str,
        target_cluster_name: &str,
        target_bucket: &str,
        settings: &ReplicationSettings,
    ) -> NewSpecValidation {
        info!(
            source_bucket,
            target_cluster_name, target_bucket, "validating new replication spec"
        );
        let local_conn = self.local_connection_str();

        let (source_result, target_side) = tokio::join!(
            self.bucket_svc.local_bucket_uuid(&local_conn, source_bucket),
            self.validate_target_side(source_bucket, target_cluster_name, target_bucket, settings),
        );

        let mut errors = target_side.errors;
        let mut source_bucket_uuid = String::new();
        match source_result {
            Ok(uuid) => source_bucket_uuid = uuid,
            Err(err) => {
                error!(
                    source_bucket,
                    error = %err,
                    "prospective spec refers to an unusable source bucket"
                );
                errors.insert(FROM_BUCKET, err);
            }
        }

        if let Some(target_ref) = &target_side.target_ref {
            if target_side.duplicate_check_eligible {
                let id = ReplicationId::new(source_bucket, &target_ref.uuid, target_bucket);
                if self.replication_spec(&id).is_ok() {
                    errors.insert(
                        PLACEHOLDER_FIELD_KEY,
                        MetadataError::AlreadyExists {
                            what: "replication to the same remote cluster and bucket".to_string(),
                        },
                    );
                }
            }
        }

        NewSpecValidation {
            source_bucket_uuid,
            target_bucket_uuid: target_side.target_bucket_uuid,
            target_ref: target_side.target_ref,
            errors,
        }
    }

    /// Persists a validated spec, captures its confirmed revision, caches it,
    /// and notifies the UI log.
    pub fn add_replication_spec(
        &self,
        mut spec: ReplicationSpecification,
    ) -> Result<ReplicationSpecification, MetadataError> {
        info!(id = %spec.id, "adding replication spec");

        let key = catalog_key(REPLICATION_SPECS_CATALOG, spec.id.as_str());
        self.catalog
            .add_with_catalog(REPLICATION_SPECS_CATALOG, &key, spec.encode()?)
            .map_err(|err| match err {
                MetadataError::AlreadyExists { .. } => MetadataError::AlreadyExists {
                    what: "replication to the same remote cluster and bucket".to_string(),
                },
                other => other,
            })?;
        spec.revision = Some(self.reread_revision(&key, &spec.id)?);

        self.cache_spec(&spec.id.clone(), Some(spec.clone()));
        self.write_ui_log(&spec, "created", None);
        Ok(spec)
    }

    /// Revision-checked update of an existing spec.
    pub fn set_replication_spec(
        &self,
        mut spec: ReplicationSpecification,
    ) -> Result<ReplicationSpecification, MetadataError> {
        let key = catalog_key(REPLICATION_SPECS_CATALOG, spec.id.as_str());
        let revision = spec.revision.ok_or_else(|| MetadataError::InvalidInput {
            msg: format!("spec \"{}\" carries no revision to update under", spec.id),
        })?;

        self.catalog.set(&key, spec.encode()?, revision)?;
        // A failed re-read is fatal to the operation: the spec's confirmed
        // revision would be unknown.
        spec.revision = Some(self.reread_revision(&key, &spec.id)?);

        self.cache_spec(&spec.id.clone(), Some(spec.clone()));
        info!(id = %spec.id, revision = ?spec.revision, "replication spec updated");
        Ok(spec)
    }

    /// Deletes a spec from the catalog and soft-removes it from the cache.
    ///
    /// Returns the spec that was deleted. Repeated deletion reports
    /// `SpecNotFound`.
    pub fn del_replication_spec(
        &self,
        id: &ReplicationId,
    ) -> Result<ReplicationSpecification, MetadataError> {
        self.del_replication_spec_internal(id, None)
    }

    /// Enumerates all live (non-soft-removed) specs, keyed by identity.
    pub fn all_replication_specs(&self) -> HashMap<ReplicationId, ReplicationSpecification> {
        self.cache
            .snapshot()
            .into_values()
            .filter_map(|entry| entry.spec)
            .map(|spec| (spec.id.clone(), spec))
            .collect()
    }

    /// Enumerates the identities of all live specs.
    pub fn all_replication_spec_ids(&self) -> Vec<ReplicationId> {
        self.all_replication_specs().into_keys().collect()
    }

    /// Enumerates the identities of live specs replicating from `bucket`.
    pub fn all_replication_spec_ids_for_bucket(&self, bucket: &str) -> Vec<ReplicationId> {
        self.all_replication_spec_ids()
            .into_iter()
            .filter(|id| id.is_for_source_bucket(bucket))
            .collect()
    }

    /// Attaches or detaches the externally-owned derived object.
    ///
    /// Detaching from an entry whose spec is already gone hard-removes the
    /// entry.
    pub fn set_derived_obj(
        &self,
        id: &ReplicationId,
        derived: Option<DerivedObj>,
    ) -> Result<(), MetadataError> {
        let mut entry = self
            .cache
            .get(id.as_str())
            .ok_or_else(|| MetadataError::SpecNotFound { id: id.to_string() })?;
        entry.derived = derived;

        if entry.spec.is_none() && entry.derived.is_none() {
            info!(id = %id, "removing spec entry from the cache");
            self.cache.delete(id.as_str());
        } else {
            self.cache.upsert(id.as_str(), entry);
        }
        Ok(())
    }

    /// The derived object attached under `id`, if any.
    ///
    /// Succeeds for soft-removed entries; that is the point of the soft
    /// delete.
    pub fn get_derived_obj(&self, id: &ReplicationId) -> Result<Option<DerivedObj>, MetadataError> {
        let entry = self
            .cache
            .get(id.as_str())
            .ok_or_else(|| MetadataError::SpecNotFound { id: id.to_string() })?;
        Ok(entry.derived)
    }

    /// Re-probes the referents of a recorded spec.
    ///
    /// Returns `InvalidSpec` when a referent is missing or a captured uuid no
    /// longer matches the live one (the bucket was recreated); such specs are
    /// eligible for GC. Transient failures are returned as themselves.
    pub async fn validate_existing_replication_spec(
        &self,
        spec: &ReplicationSpecification,
    ) -> Result<(), MetadataError> {
        let local_conn = self.local_connection_str();
        match self
            .bucket_svc
            .local_bucket_uuid(&local_conn, &spec.source_bucket_name)
            .await
        {
            Ok(uuid) => {
                if !spec.source_bucket_uuid.is_empty() && spec.source_bucket_uuid != uuid {
                    return Err(MetadataError::InvalidSpec {
                        detail: format!(
                            "spec {} refers to bucket \"{}\" which was deleted and recreated",
                            spec.id, spec.source_bucket_name
                        ),
                    });
                }
            }
            Err(MetadataError::BucketNotFound { .. }) => {
                return Err(MetadataError::InvalidSpec {
                    detail: format!(
                        "spec {} refers to non-existent source bucket \"{}\"",
                        spec.id, spec.source_bucket_name
                    ),
                });
            }
            Err(err) => return Err(err),
        }

        let target_ref = match self
            .remote_cluster_svc
            .remote_cluster_by_uuid(&spec.target_cluster_uuid, false)
            .await
        {
            Ok(target_ref) => target_ref,
            Err(MetadataError::ClusterNotFound { .. }) => {
                return Err(MetadataError::InvalidSpec {
                    detail: format!(
                        "spec {} refers to non-existent remote cluster reference \"{}\"",
                        spec.id, spec.target_cluster_uuid
                    ),
                });
            }
            Err(err) => return Err(err),
        };

        let conn_str = target_ref
            .connection_str()
            .map_err(|err| MetadataError::InvalidSpec {
                detail: format!(
                    "spec {} refers to an invalid remote cluster reference \"{}\": {err}",
                    spec.id, spec.target_cluster_uuid
                ),
            })?;
        let (user, password) = target_ref.credentials();
        match self
            .bucket_svc
            .remote_bucket_uuid(conn_str, user, password, &spec.target_bucket_name)
            .await
        {
            Ok(uuid) => {
                if !spec.target_bucket_uuid.is_empty() && spec.target_bucket_uuid != uuid {
                    return Err(MetadataError::InvalidSpec {
                        detail: format!(
                            "spec {} refers to bucket \"{}\" which was deleted and recreated",
                            spec.id, spec.target_bucket_name
                        ),
                    });
                }
            }
            Err(MetadataError::BucketNotFound { .. }) => {
                return Err(MetadataError::InvalidSpec {
                    detail: format!(
                        "spec {} refers to non-existent target bucket \"{}\"",
                        spec.id, spec.target_bucket_name
                    ),
                });
            }
            Err(err) => return Err(err),
        }

        Ok(())
    }

    /// Validates a recorded spec and soft-removes it when it is no longer
    /// valid. Transient failures are logged and leave the spec in place.
    pub async fn validate_and_gc(&self, spec: &ReplicationSpecification) {
        match self.validate_existing_replication_spec(spec).await {
            Ok(()) => {}
            Err(MetadataError::InvalidSpec { detail }) => {
                error!(
                    id = %spec.id,
                    detail,
                    "replication spec is no longer valid, garbage collecting it"
                );
                if let Err(err) = self.del_replication_spec_internal(&spec.id, Some(&detail)) {
                    info!(id = %spec.id, error = %err, "failed to garbage collect spec");
                }
            }
            Err(err) => {
                warn!(
                    id = %spec.id,
                    error = %err,
                    "transient failure while validating spec, leaving it in place"
                );
            }
        }
    }

    /// Change-notification callback for the replication-spec catalog.
    ///
    /// An absent value soft-removes the entry; a present value upserts it.
    /// The returned outcome lets the dispatcher inform downstream listeners.
    pub fn replication_spec_service_callback(
        &self,
        path: &str,
        value: Option<&[u8]>,
        revision: Option<Revision>,
    ) -> Result<SpecChangeOutcome, MetadataError> {
        debug!(path, "replication spec service callback");
        let id = ReplicationId::from_raw(id_from_catalog_key(REPLICATION_SPECS_CATALOG, path));

        let new_spec = match value {
            Some(value) => {
                Some(ReplicationSpecification::decode(value, revision).inspect_err(|err| {
                    error!(path, error = %err, "failed to decode replication spec payload");
                })?)
            }
            None => None,
        };

        let old_derived = self.cache.get(id.as_str()).and_then(|entry| entry.derived);
        self.cache_spec(&id, new_spec.clone());

        Ok(SpecChangeOutcome {
            id,
            old_derived,
            new_spec,
        })
    }

    /// True for failures produced by declaration-level validation rather than
    /// the surrounding machinery; the admin surface renders these as 4xx.
    pub fn is_replication_validation_error(err: &MetadataError) -> bool {
        matches!(
            err,
            MetadataError::AlreadyExists { .. } | MetadataError::SpecNotFound { .. }
        )
    }

    fn del_replication_spec_internal(
        &self,
        id: &ReplicationId,
        reason: Option<&str>,
    ) -> Result<ReplicationSpecification, MetadataError> {
        let spec = self.replication_spec(id)?;

        let key = catalog_key(REPLICATION_SPECS_CATALOG, id.as_str());
        let revision = spec.revision.ok_or_else(|| MetadataError::Storage {
            msg: format!("cached spec \"{id}\" carries no revision"),
        })?;
        self.catalog
            .del_with_catalog(REPLICATION_SPECS_CATALOG, &key, revision)
            .inspect_err(|err| {
                error!(key = %key, revision = %revision, error = %err, "failed to delete replication spec");
            })?;

        // Soft remove: clear the spec but keep the entry while a derived
        // object is still attached, so its owner can clean up.
        self.cache_spec(id, None);
        self.write_ui_log(&spec, "removed", reason);
        Ok(spec)
    }

    async fn validate_target_side(
        &self,
        source_bucket: &str,
        target_cluster_name: &str,
        target_bucket: &str,
        settings: &ReplicationSettings,
    ) -> TargetSideValidation {
        let mut outcome = TargetSideValidation {
            target_bucket_uuid: String::new(),
            target_ref: None,
            errors: HashMap::new(),
            duplicate_check_eligible: false,
        };

        let target_ref = match self
            .remote_cluster_svc
            .remote_cluster_by_ref_name(target_cluster_name, false)
            .await
        {
            Ok(target_ref) => target_ref,
            Err(err) => {
                outcome.errors.insert(TO_CLUSTER, err);
                return outcome;
            }
        };

        // Replicating a bucket onto itself is meaningless: reject when both
        // the bucket name and the cluster uuid coincide.
        if source_bucket == target_bucket {
            let local_cluster_uuid = self.local_cluster_uuid();
            if local_cluster_uuid == target_ref.uuid {
                outcome.errors.insert(
                    PLACEHOLDER_FIELD_KEY,
                    MetadataError::InvalidInput {
                        msg: "replication from a bucket to the same bucket is not allowed"
                            .to_string(),
                    },
                );
                return outcome;
            }
        }

        let conn_str = match target_ref.connection_str() {
            Ok(conn_str) => conn_str.to_string(),
            Err(err) => {
                outcome.errors.insert(TO_CLUSTER, err);
                return outcome;
            }
        };
        let (user, password) = target_ref.credentials();
        match self
            .bucket_svc
            .remote_bucket_uuid(&conn_str, user, password, target_bucket)
            .await
        {
            Ok(uuid) => outcome.target_bucket_uuid = uuid,
            Err(err) => {
                error!(
                    target_bucket,
                    error = %err,
                    "prospective spec refers to an unusable target bucket"
                );
                outcome.errors.insert(TO_BUCKET, err);
            }
        }

        if settings.is_memcached_style() {
            match self
                .cluster_info_svc
                .is_cluster_compatible(&target_ref, MIN_MEMCACHED_COMPAT_VERSION)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    outcome.errors.insert(
                        TO_CLUSTER,
                        MetadataError::InvalidInput {
                            msg: format!(
                                "memcached-style replication is disallowed: cluster has nodes below version {}.{}",
                                MIN_MEMCACHED_COMPAT_VERSION[0], MIN_MEMCACHED_COMPAT_VERSION[1]
                            ),
                        },
                    );
                }
                Err(err) => {
                    outcome.errors.insert(
                        TO_CLUSTER,
                        MetadataError::Unreachable {
                            msg: format!("failed to get cluster version information: {err}"),
                        },
                    );
                }
            }
        }

        outcome.target_ref = Some(target_ref);
        outcome.duplicate_check_eligible = true;
        outcome
    }

    async fn source_bucket_uuid(&self, bucket: &str) -> Result<String, MetadataError> {
        let local_conn = self.local_connection_str();
        self.bucket_svc.local_bucket_uuid(&local_conn, bucket).await
    }

    async fn target_bucket_uuid(
        &self,
        target_cluster_uuid: &str,
        bucket: &str,
    ) -> Result<String, MetadataError> {
        let target_ref = self
            .remote_cluster_svc
            .remote_cluster_by_uuid(target_cluster_uuid, false)
            .await?;
        let conn_str = target_ref.connection_str()?.to_string();
        let (user, password) = target_ref.credentials();
        self.bucket_svc
            .remote_bucket_uuid(&conn_str, user, password, bucket)
            .await
    }

    /// Applies a spec state to the cache entry, preserving the derived
    /// object. An entry whose payloads are both absent is hard-removed.
    fn cache_spec(&self, id: &ReplicationId, spec: Option<ReplicationSpecification>) {
        let mut entry = self.cache.get(id.as_str()).unwrap_or_default();
        entry.spec = spec;
        if entry.spec.is_none() && entry.derived.is_none() {
            self.cache.delete(id.as_str());
        } else {
            self.cache.upsert(id.as_str(), entry);
        }
    }

    fn write_ui_log(&self, spec: &ReplicationSpecification, action: &str, reason: Option<&str>) {
        let cluster_name = self
            .remote_cluster_svc
            .name_from_cluster_uuid(&spec.target_cluster_uuid)
            .unwrap_or_else(|| spec.target_cluster_uuid.clone());
        let message = match reason {
            Some(reason) => format!(
                "Replication from bucket \"{}\" to bucket \"{}\" on cluster \"{}\" {}, since {}",
                spec.source_bucket_name, spec.target_bucket_name, cluster_name, action, reason
            ),
            None => format!(
                "Replication from bucket \"{}\" to bucket \"{}\" on cluster \"{}\" {}.",
                spec.source_bucket_name, spec.target_bucket_name, cluster_name, action
            ),
        };
        self.uilog.write(&message);
    }

    fn local_connection_str(&self) -> String {
        let conn_str = self.topology_svc.my_connection_str();
        if conn_str.is_empty() {
            panic!("topology service returned an empty local connection string");
        }
        conn_str
    }

    fn local_cluster_uuid(&self) -> String {
        let uuid = self.topology_svc.my_cluster_uuid();
        if uuid.is_empty() {
            panic!("topology service returned an empty local cluster uuid");
        }
        uuid
    }

    fn reread_revision(&self, key: &str, id: &ReplicationId) -> Result<Revision, MetadataError> {
        let (_, revision) = self.catalog.get(key).map_err(|err| MetadataError::Storage {
            msg: format!("failed to read back replication spec \"{id}\": {err}"),
        })?;
        Ok(revision)
    }
}
