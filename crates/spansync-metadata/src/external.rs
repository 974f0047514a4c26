//! Interfaces to the external collaborators the control plane consumes.
//!
//! Each collaborator is reached through a narrow trait so the services can be
//! exercised in-process with test doubles. The real implementations live with
//! the surrounding node software.

use async_trait::async_trait;

use crate::error::MetadataError;
use crate::remote_cluster::RemoteClusterReference;

/// Facts about the local cluster's topology.
///
/// Both accessors return data that must exist on a correctly wired node;
/// callers treat an empty return as programmer error and abort.
pub trait TopologySvc: Send + Sync {
    /// Connection string of the local cluster's admin endpoint.
    fn my_connection_str(&self) -> String;

    /// Uuid of the local cluster.
    fn my_cluster_uuid(&self) -> String;
}

/// Bucket existence and uuid lookups against live clusters.
#[async_trait]
pub trait BucketSvc: Send + Sync {
    /// Uuid of `bucket` on the local cluster at `connection_str`.
    ///
    /// Fails with `BucketNotFound` when the bucket does not exist.
    async fn local_bucket_uuid(
        &self,
        connection_str: &str,
        bucket: &str,
    ) -> Result<String, MetadataError>;

    /// Uuid of `bucket` on the remote cluster behind `connection_str`.
    async fn remote_bucket_uuid(
        &self,
        connection_str: &str,
        user: &str,
        password: &str,
        bucket: &str,
    ) -> Result<String, MetadataError>;
}

/// Version and compatibility questions about a remote cluster.
#[async_trait]
pub trait ClusterInfoSvc: Send + Sync {
    /// Whether every node of the remote cluster runs at least `version`
    /// (`[major, minor]`).
    async fn is_cluster_compatible(
        &self,
        reference: &RemoteClusterReference,
        version: [u32; 2],
    ) -> Result<bool, MetadataError>;
}

/// Fire-and-forget sink for operator-visible notifications.
pub trait UiLogSvc: Send + Sync {
    /// Records one human-readable message.
    fn write(&self, message: &str);
}
