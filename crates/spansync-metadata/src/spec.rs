//! The replication specification model.

use serde::{Deserialize, Serialize};

use spansync_base::types::{ReplicationId, Revision};

use crate::error::MetadataError;

/// How mutations travel to the target cluster.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationType {
    /// Wire-level memcached-style replication (the default).
    Memcached,
    /// REST-based replication for targets that cannot speak the wire protocol.
    Rest,
}

/// Tunable settings carried by one replication spec.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Replication type; absent means memcached-style.
    #[serde(default)]
    pub replication_type: Option<ReplicationType>,
    /// Maximum number of mutations batched into one send.
    pub batch_count: u32,
    /// Maximum batch payload in kilobytes.
    pub batch_size_kb: u32,
    /// Optional mutation filter expression.
    #[serde(default)]
    pub filter_expression: Option<String>,
    /// Whether the replication is active (false = paused).
    pub active: bool,
    /// Seconds between checkpoint writes by the data plane.
    pub checkpoint_interval_secs: u64,
    /// Seconds to wait before restarting a failed pipeline.
    pub failure_restart_interval_secs: u64,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            replication_type: None,
            batch_count: 500,
            batch_size_kb: 2048,
            filter_expression: None,
            active: true,
            checkpoint_interval_secs: 1800,
            failure_restart_interval_secs: 30,
        }
    }
}

impl ReplicationSettings {
    /// True when the (possibly absent) replication type calls for the
    /// memcached-style wire protocol.
    pub fn is_memcached_style(&self) -> bool {
        matches!(
            self.replication_type,
            None | Some(ReplicationType::Memcached)
        )
    }
}

/// One declared source→target bucket replication.
///
/// The bucket uuids are captured at creation time; a spec whose captured uuid
/// no longer matches the live bucket is dangling and eligible for GC. The
/// revision is out-of-band: it is never part of the encoded value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSpecification {
    /// Deterministic identity derived from the (source, cluster, target) triple.
    pub id: ReplicationId,
    /// Source bucket name on the local cluster.
    pub source_bucket_name: String,
    /// Source bucket uuid captured at creation.
    pub source_bucket_uuid: String,
    /// Uuid of the target cluster reference.
    pub target_cluster_uuid: String,
    /// Target bucket name on the remote cluster.
    pub target_bucket_name: String,
    /// Target bucket uuid captured at creation.
    pub target_bucket_uuid: String,
    /// Replication settings.
    pub settings: ReplicationSettings,
    /// Persistence revision of the backing catalog entry.
    #[serde(skip)]
    pub revision: Option<Revision>,
}

impl ReplicationSpecification {
    /// Builds a fresh spec (not yet persisted) with default settings.
    pub fn new(
        source_bucket_name: impl Into<String>,
        source_bucket_uuid: impl Into<String>,
        target_cluster_uuid: impl Into<String>,
        target_bucket_name: impl Into<String>,
        target_bucket_uuid: impl Into<String>,
    ) -> Self {
        let source_bucket_name = source_bucket_name.into();
        let target_cluster_uuid = target_cluster_uuid.into();
        let target_bucket_name = target_bucket_name.into();
        let id = ReplicationId::new(
            &source_bucket_name,
            &target_cluster_uuid,
            &target_bucket_name,
        );
        Self {
            id,
            source_bucket_name,
            source_bucket_uuid: source_bucket_uuid.into(),
            target_cluster_uuid,
            target_bucket_name,
            target_bucket_uuid: target_bucket_uuid.into(),
            settings: ReplicationSettings::default(),
            revision: None,
        }
    }

    /// Encodes the spec for catalog storage (revision omitted).
    pub fn encode(&self) -> Result<Vec<u8>, MetadataError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a spec from catalog storage, attaching the out-of-band revision.
    pub fn decode(value: &[u8], revision: Option<Revision>) -> Result<Self, MetadataError> {
        let mut spec: ReplicationSpecification = serde_json::from_slice(value)?;
        spec.revision = revision;
        Ok(spec)
    }
}
