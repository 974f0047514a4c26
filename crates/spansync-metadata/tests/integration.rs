//! End-to-end scenarios across the metadata services, driven through an
//! in-process catalog and mock collaborators.

mod common;

use std::sync::Arc;

use spansync_base::constants::{
    FROM_BUCKET, PLACEHOLDER_FIELD_KEY, REPLICATION_SPECS_CATALOG, TO_BUCKET, TO_CLUSTER,
};
use spansync_base::types::ReplicationId;
use spansync_metadata::catalog::{catalog_key, MetadataCatalog};
use spansync_metadata::error::MetadataError;
use spansync_metadata::remote_cluster::RemoteClusterReference;
use spansync_metadata::spec::{ReplicationSettings, ReplicationSpecification, ReplicationType};
use spansync_metadata::spec_service::ReplicationSpecService;

use common::{TestHarness, LOCAL_CLUSTER_UUID};

const REMOTE_HOST: &str = "10.0.0.2:8091";
const REMOTE_UUID: &str = "remote-cluster-uuid";
const REMOTE_NAME: &str = "r";

/// Registers the standard fixture: remote cluster `r`, local bucket `A`,
/// remote bucket `B`.
async fn standard_fixture() -> TestHarness {
    let harness = TestHarness::new();
    harness.prober.set_cluster(REMOTE_HOST, REMOTE_UUID);
    harness.buckets.set_local_bucket("A", "uuid-of-A");
    harness.buckets.set_remote_bucket("B", "uuid-of-B");

    let reference =
        RemoteClusterReference::new(REMOTE_NAME, REMOTE_HOST, "admin", "secret", false, None);
    harness
        .remote_svc
        .add_remote_cluster(reference)
        .await
        .expect("remote cluster should be accepted");
    harness
}

async fn add_standard_spec(harness: &TestHarness) -> ReplicationSpecification {
    let spec = harness
        .spec_svc
        .construct_new_replication_spec("A", REMOTE_UUID, "B")
        .await
        .expect("referents exist");
    harness
        .spec_svc
        .add_replication_spec(spec)
        .expect("spec should persist")
}

#[tokio::test]
async fn test_create_lookup_delete() {
    let harness = standard_fixture().await;

    let validation = harness
        .spec_svc
        .validate_new_replication_spec("A", REMOTE_NAME, "B", &ReplicationSettings::default())
        .await;
    assert!(validation.errors.is_empty());
    assert_eq!(validation.source_bucket_uuid, "uuid-of-A");
    assert_eq!(validation.target_bucket_uuid, "uuid-of-B");

    let spec = add_standard_spec(&harness).await;
    let id = ReplicationId::new("A", REMOTE_UUID, "B");
    assert_eq!(spec.id, id);

    let looked_up = harness.spec_svc.replication_spec(&id).unwrap();
    assert_eq!(looked_up, spec);

    let deleted = harness.spec_svc.del_replication_spec(&id).unwrap();
    assert_eq!(deleted.id, id);

    let err = harness.spec_svc.replication_spec(&id).unwrap_err();
    assert!(matches!(err, MetadataError::SpecNotFound { .. }));
}

#[tokio::test]
async fn test_repeated_delete_reports_not_found() {
    let harness = standard_fixture().await;
    let spec = add_standard_spec(&harness).await;

    harness.spec_svc.del_replication_spec(&spec.id).unwrap();
    let err = harness.spec_svc.del_replication_spec(&spec.id).unwrap_err();
    assert!(matches!(err, MetadataError::SpecNotFound { .. }));
}

#[tokio::test]
async fn test_soft_delete_with_pinned_derived_object() {
    let harness = standard_fixture().await;
    let spec = add_standard_spec(&harness).await;
    let id = spec.id.clone();

    let handle: Arc<dyn std::any::Any + Send + Sync> = Arc::new("pipeline-handle".to_string());
    harness
        .spec_svc
        .set_derived_obj(&id, Some(handle))
        .unwrap();

    harness.spec_svc.del_replication_spec(&id).unwrap();

    // The spec reads as gone, but the derived object is still reachable.
    assert!(harness.spec_svc.replication_spec(&id).is_err());
    let derived = harness
        .spec_svc
        .get_derived_obj(&id)
        .unwrap()
        .expect("derived object should pin the entry");
    assert_eq!(
        derived.downcast_ref::<String>().map(String::as_str),
        Some("pipeline-handle")
    );

    // Detaching the derived object hard-removes the entry.
    harness.spec_svc.set_derived_obj(&id, None).unwrap();
    let err = harness.spec_svc.get_derived_obj(&id).unwrap_err();
    assert!(matches!(err, MetadataError::SpecNotFound { .. }));
}

#[tokio::test]
async fn test_delete_without_derived_object_removes_entry() {
    let harness = standard_fixture().await;
    let spec = add_standard_spec(&harness).await;

    harness.spec_svc.del_replication_spec(&spec.id).unwrap();

    // Nothing pinned the entry, so even the derived-object lookup reports
    // not-found.
    let err = harness.spec_svc.get_derived_obj(&spec.id).unwrap_err();
    assert!(matches!(err, MetadataError::SpecNotFound { .. }));
}

#[tokio::test]
async fn test_derived_obj_round_trip() {
    let harness = standard_fixture().await;
    let spec = add_standard_spec(&harness).await;

    assert!(harness
        .spec_svc
        .get_derived_obj(&spec.id)
        .unwrap()
        .is_none());

    let handle: Arc<dyn std::any::Any + Send + Sync> = Arc::new(42u64);
    harness
        .spec_svc
        .set_derived_obj(&spec.id, Some(handle))
        .unwrap();

    let derived = harness
        .spec_svc
        .get_derived_obj(&spec.id)
        .unwrap()
        .expect("derived object should be attached");
    assert_eq!(derived.downcast_ref::<u64>(), Some(&42));
}

#[tokio::test]
async fn test_duplicate_rejection() {
    let harness = standard_fixture().await;
    let spec = add_standard_spec(&harness).await;

    let validation = harness
        .spec_svc
        .validate_new_replication_spec("A", REMOTE_NAME, "B", &ReplicationSettings::default())
        .await;
    assert!(matches!(
        validation.errors.get(PLACEHOLDER_FIELD_KEY),
        Some(MetadataError::AlreadyExists { .. })
    ));

    let mut duplicate = spec.clone();
    duplicate.revision = None;
    let err = harness.spec_svc.add_replication_spec(duplicate).unwrap_err();
    assert!(matches!(err, MetadataError::AlreadyExists { .. }));
    assert!(ReplicationSpecService::is_replication_validation_error(&err));
}

#[tokio::test]
async fn test_same_bucket_same_cluster_rejected() {
    let harness = TestHarness::new();
    // A "remote" cluster that is actually the local one.
    harness.prober.set_cluster(REMOTE_HOST, LOCAL_CLUSTER_UUID);
    harness.buckets.set_local_bucket("A", "uuid-of-A");
    harness.buckets.set_remote_bucket("A", "uuid-of-A");

    let reference =
        RemoteClusterReference::new("self", REMOTE_HOST, "admin", "secret", false, None);
    harness
        .remote_svc
        .add_remote_cluster(reference)
        .await
        .unwrap();

    let validation = harness
        .spec_svc
        .validate_new_replication_spec("A", "self", "A", &ReplicationSettings::default())
        .await;
    assert!(matches!(
        validation.errors.get(PLACEHOLDER_FIELD_KEY),
        Some(MetadataError::InvalidInput { .. })
    ));
}

#[tokio::test]
async fn test_gc_of_dangling_spec() {
    let harness = standard_fixture().await;
    let spec = add_standard_spec(&harness).await;

    // The target bucket is dropped and recreated: same name, new uuid.
    harness.buckets.set_remote_bucket("B", "uuid-of-B-reborn");

    harness.spec_svc.validate_and_gc(&spec).await;

    let err = harness.spec_svc.replication_spec(&spec.id).unwrap_err();
    assert!(matches!(err, MetadataError::SpecNotFound { .. }));

    let messages = harness.uilog.messages();
    assert!(
        messages
            .iter()
            .any(|message| message.contains("removed, since")),
        "GC removal should explain itself in the UI log: {messages:?}"
    );
}

#[tokio::test]
async fn test_uuid_mismatch_is_invalid_spec_even_if_name_exists() {
    let harness = standard_fixture().await;
    let spec = add_standard_spec(&harness).await;

    // The *source* bucket is recreated; its name still resolves.
    harness.buckets.set_local_bucket("A", "uuid-of-A-reborn");

    let err = harness
        .spec_svc
        .validate_existing_replication_spec(&spec)
        .await
        .unwrap_err();
    assert!(err.is_invalid_spec());
}

#[tokio::test]
async fn test_transient_failure_does_not_gc() {
    let harness = standard_fixture().await;
    let spec = add_standard_spec(&harness).await;

    harness.buckets.set_local_unreachable(true);
    harness.spec_svc.validate_and_gc(&spec).await;
    harness.buckets.set_local_unreachable(false);

    // The spec survived the outage.
    assert!(harness.spec_svc.replication_spec(&spec.id).is_ok());
}

#[tokio::test]
async fn test_validation_reports_all_field_errors() {
    let harness = standard_fixture().await;
    harness.buckets.remove_local_bucket("A");
    harness.buckets.remove_remote_bucket("B");

    let validation = harness
        .spec_svc
        .validate_new_replication_spec("A", REMOTE_NAME, "B", &ReplicationSettings::default())
        .await;

    assert!(matches!(
        validation.errors.get(FROM_BUCKET),
        Some(MetadataError::BucketNotFound { .. })
    ));
    assert!(matches!(
        validation.errors.get(TO_BUCKET),
        Some(MetadataError::BucketNotFound { .. })
    ));
    assert_eq!(validation.errors.len(), 2);
}

#[tokio::test]
async fn test_missing_target_cluster_stops_target_side_checks() {
    let harness = standard_fixture().await;

    let validation = harness
        .spec_svc
        .validate_new_replication_spec("A", "no-such-cluster", "B", &ReplicationSettings::default())
        .await;

    assert!(matches!(
        validation.errors.get(TO_CLUSTER),
        Some(MetadataError::ClusterNotFound { .. })
    ));
    assert!(validation.target_ref.is_none());
    assert!(!validation.errors.contains_key(TO_BUCKET));
}

#[tokio::test]
async fn test_memcached_compat_gate() {
    let harness = standard_fixture().await;
    *harness.cluster_info.compatible.lock().unwrap() = false;

    // Default settings imply memcached-style: incompatible target rejected.
    let validation = harness
        .spec_svc
        .validate_new_replication_spec("A", REMOTE_NAME, "B", &ReplicationSettings::default())
        .await;
    assert!(matches!(
        validation.errors.get(TO_CLUSTER),
        Some(MetadataError::InvalidInput { .. })
    ));

    // REST replication does not require the compatibility floor.
    let mut settings = ReplicationSettings::default();
    settings.replication_type = Some(ReplicationType::Rest);
    let validation = harness
        .spec_svc
        .validate_new_replication_spec("A", REMOTE_NAME, "B", &settings)
        .await;
    assert!(validation.errors.is_empty());
}

#[tokio::test]
async fn test_revision_discipline_on_add_and_set() {
    let harness = standard_fixture().await;
    let spec = add_standard_spec(&harness).await;

    let key = catalog_key(REPLICATION_SPECS_CATALOG, spec.id.as_str());
    let (_, catalog_revision) = harness.catalog.get(&key).unwrap();
    assert_eq!(spec.revision, Some(catalog_revision));
    assert_eq!(
        harness.spec_svc.replication_spec(&spec.id).unwrap().revision,
        Some(catalog_revision)
    );

    let mut updated = spec.clone();
    updated.settings.active = false;
    let updated = harness.spec_svc.set_replication_spec(updated).unwrap();

    let (_, catalog_revision) = harness.catalog.get(&key).unwrap();
    assert_eq!(updated.revision, Some(catalog_revision));
    assert!(!harness
        .spec_svc
        .replication_spec(&spec.id)
        .unwrap()
        .settings
        .active);
}

#[tokio::test]
async fn test_stale_revision_write_rejected() {
    let harness = standard_fixture().await;
    let spec = add_standard_spec(&harness).await;

    let mut first = spec.clone();
    first.settings.batch_count = 100;
    harness.spec_svc.set_replication_spec(first).unwrap();

    // A second writer still holding the original revision must reload.
    let mut stale = spec;
    stale.settings.batch_count = 200;
    let err = harness.spec_svc.set_replication_spec(stale).unwrap_err();
    assert!(matches!(err, MetadataError::RevisionMismatch { .. }));
}

#[tokio::test]
async fn test_enumeration_filters_soft_removed_and_by_bucket() {
    let harness = standard_fixture().await;
    harness.buckets.set_local_bucket("C", "uuid-of-C");
    harness.buckets.set_remote_bucket("D", "uuid-of-D");

    let spec_ab = add_standard_spec(&harness).await;
    let spec_cd = harness
        .spec_svc
        .construct_new_replication_spec("C", REMOTE_UUID, "D")
        .await
        .unwrap();
    let spec_cd = harness.spec_svc.add_replication_spec(spec_cd).unwrap();

    let all = harness.spec_svc.all_replication_specs();
    assert_eq!(all.len(), 2);
    assert!(all.contains_key(&spec_ab.id));
    assert!(all.contains_key(&spec_cd.id));

    let for_a = harness.spec_svc.all_replication_spec_ids_for_bucket("A");
    assert_eq!(for_a, vec![spec_ab.id.clone()]);

    // Pin spec_ab with a derived object, then delete it: soft-removed specs
    // drop out of every enumeration.
    let handle: Arc<dyn std::any::Any + Send + Sync> = Arc::new(());
    harness
        .spec_svc
        .set_derived_obj(&spec_ab.id, Some(handle))
        .unwrap();
    harness.spec_svc.del_replication_spec(&spec_ab.id).unwrap();

    let all = harness.spec_svc.all_replication_specs();
    assert_eq!(all.len(), 1);
    assert!(all.contains_key(&spec_cd.id));
    assert!(harness
        .spec_svc
        .all_replication_spec_ids_for_bucket("A")
        .is_empty());
}

#[tokio::test]
async fn test_callback_applies_foreign_writes() {
    let harness = standard_fixture().await;

    // Wire the service callback to the catalog, the way the composition root
    // does it.
    let spec_svc = harness.spec_svc.clone();
    harness.catalog.register_callback(
        REPLICATION_SPECS_CATALOG,
        Arc::new(move |path, value, revision| {
            let _ = spec_svc.replication_spec_service_callback(path, value, revision);
        }),
    );

    // A write that did not originate here (e.g. another node) lands in the
    // cache through the notification alone.
    let foreign = ReplicationSpecification::new("A", "uuid-of-A", REMOTE_UUID, "B", "uuid-of-B");
    let key = catalog_key(REPLICATION_SPECS_CATALOG, foreign.id.as_str());
    harness
        .catalog
        .add_with_catalog(REPLICATION_SPECS_CATALOG, &key, foreign.encode().unwrap())
        .unwrap();

    let cached = harness.spec_svc.replication_spec(&foreign.id).unwrap();
    assert_eq!(cached.source_bucket_uuid, "uuid-of-A");
    assert!(cached.revision.is_some());

    // A foreign delete soft-removes through the same path.
    let (_, revision) = harness.catalog.get(&key).unwrap();
    harness
        .catalog
        .del_with_catalog(REPLICATION_SPECS_CATALOG, &key, revision)
        .unwrap();
    assert!(harness.spec_svc.replication_spec(&foreign.id).is_err());
}

#[tokio::test]
async fn test_ui_log_records_create_and_remove() {
    let harness = standard_fixture().await;
    let spec = add_standard_spec(&harness).await;
    harness.spec_svc.del_replication_spec(&spec.id).unwrap();

    let messages = harness.uilog.messages();
    assert!(messages.iter().any(|m| m.contains("created")));
    assert!(messages.iter().any(|m| m.contains("removed")));
    // Messages name the cluster by its human name, not its uuid.
    assert!(messages.iter().any(|m| m.contains(&format!("\"{REMOTE_NAME}\""))));
}

#[tokio::test]
async fn test_remote_cluster_crud() {
    let harness = TestHarness::new();
    harness.prober.set_cluster(REMOTE_HOST, REMOTE_UUID);

    let reference =
        RemoteClusterReference::new(REMOTE_NAME, REMOTE_HOST, "admin", "secret", false, None);
    let added = harness
        .remote_svc
        .add_remote_cluster(reference)
        .await
        .unwrap();
    // The uuid is captured from the live probe, not from caller input.
    assert_eq!(added.uuid, REMOTE_UUID);
    assert!(added.revision.is_some());

    let by_name = harness
        .remote_svc
        .remote_cluster_by_ref_name(REMOTE_NAME, false)
        .await
        .unwrap();
    assert_eq!(by_name, added);
    let by_uuid = harness
        .remote_svc
        .remote_cluster_by_uuid(REMOTE_UUID, false)
        .await
        .unwrap();
    assert_eq!(by_uuid, added);

    // Rename through a revision-checked update.
    let mut renamed = added.clone();
    renamed.name = "r2".to_string();
    harness
        .remote_svc
        .set_remote_cluster(REMOTE_NAME, renamed)
        .await
        .unwrap();
    assert!(harness
        .remote_svc
        .remote_cluster_by_ref_name(REMOTE_NAME, false)
        .await
        .is_err());
    let clusters = harness.remote_svc.remote_clusters(false).await.unwrap();
    assert_eq!(clusters.len(), 1);
    assert!(clusters.contains_key("r2"));

    let deleted = harness
        .remote_svc
        .del_remote_cluster_by_ref_name("r2")
        .unwrap();
    assert_eq!(deleted.uuid, REMOTE_UUID);
    assert!(harness
        .remote_svc
        .remote_clusters(false)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_remote_cluster_duplicate_name_rejected() {
    let harness = TestHarness::new();
    harness.prober.set_cluster(REMOTE_HOST, REMOTE_UUID);
    harness.prober.set_cluster("10.0.0.3:8091", "another-uuid");

    let reference =
        RemoteClusterReference::new(REMOTE_NAME, REMOTE_HOST, "admin", "secret", false, None);
    harness
        .remote_svc
        .add_remote_cluster(reference)
        .await
        .unwrap();

    let clashing =
        RemoteClusterReference::new(REMOTE_NAME, "10.0.0.3:8091", "admin", "secret", false, None);
    let err = harness
        .remote_svc
        .add_remote_cluster(clashing)
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::AlreadyExists { .. }));
}

#[tokio::test]
async fn test_remote_cluster_unreachable_seed_rejected() {
    let harness = TestHarness::new();

    let reference = RemoteClusterReference::new(
        "nowhere",
        "203.0.113.9:8091",
        "admin",
        "secret",
        false,
        None,
    );
    let err = harness
        .remote_svc
        .add_remote_cluster(reference)
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::Unreachable { .. }));
}

#[tokio::test]
async fn test_remote_cluster_callback_coherence() {
    let harness = TestHarness::new();
    harness.prober.set_cluster(REMOTE_HOST, REMOTE_UUID);

    let reference =
        RemoteClusterReference::new(REMOTE_NAME, REMOTE_HOST, "admin", "secret", false, None);
    let added = harness
        .remote_svc
        .add_remote_cluster(reference)
        .await
        .unwrap();

    // Simulate the notification for a foreign delete.
    let key = format!("remoteCluster_{REMOTE_UUID}");
    let (uuid, state) = harness
        .remote_svc
        .remote_cluster_service_callback(&key, None, None)
        .unwrap();
    assert_eq!(uuid, REMOTE_UUID);
    assert!(state.is_none());
    assert!(harness
        .remote_svc
        .remote_cluster_by_uuid(REMOTE_UUID, false)
        .await
        .is_err());

    // And for a foreign (re-)creation carrying the encoded reference.
    let payload = added.encode().unwrap();
    let (uuid, state) = harness
        .remote_svc
        .remote_cluster_service_callback(&key, Some(&payload), added.revision)
        .unwrap();
    assert_eq!(uuid, REMOTE_UUID);
    assert!(state.is_some());
    assert!(harness
        .remote_svc
        .remote_cluster_by_uuid(REMOTE_UUID, false)
        .await
        .is_ok());
}
