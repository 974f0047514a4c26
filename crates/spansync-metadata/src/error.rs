//! Error types for the metadata subsystem.

use thiserror::Error;

/// Errors that can occur across the metadata services.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Malformed caller input.
    #[error("invalid input: {msg}")]
    InvalidInput {
        /// What was malformed.
        msg: String,
    },

    /// A named bucket does not exist.
    #[error("bucket \"{bucket}\" not found")]
    BucketNotFound {
        /// The bucket that was looked up.
        bucket: String,
    },

    /// A remote cluster reference does not exist.
    #[error("remote cluster \"{name}\" not found")]
    ClusterNotFound {
        /// The name or uuid that was looked up.
        name: String,
    },

    /// A replication spec does not exist, or has been soft-removed.
    #[error("replication spec \"{id}\" not found")]
    SpecNotFound {
        /// The identity that was looked up.
        id: String,
    },

    /// A catalog key does not exist.
    #[error("metadata key \"{key}\" not found")]
    KeyNotFound {
        /// The catalog key that was looked up.
        key: String,
    },

    /// The entity being created already exists.
    #[error("{what} already exists")]
    AlreadyExists {
        /// What collided.
        what: String,
    },

    /// A compare-and-swap write lost the race against a newer revision.
    #[error("revision mismatch on \"{key}\"")]
    RevisionMismatch {
        /// The catalog key that was written.
        key: String,
    },

    /// A recorded spec no longer matches live state; eligible for GC.
    #[error("invalid replication spec: {detail}")]
    InvalidSpec {
        /// Human-readable account of the mismatch.
        detail: String,
    },

    /// Credentials were rejected by the remote cluster.
    #[error("authentication failed against {endpoint}")]
    AuthFailed {
        /// The endpoint that rejected the credentials.
        endpoint: String,
    },

    /// The remote cluster could not be reached within the deadline.
    #[error("cluster unreachable: {msg}")]
    Unreachable {
        /// The underlying transport failure.
        msg: String,
    },

    /// The metadata store failed.
    #[error("storage error: {msg}")]
    Storage {
        /// The underlying store failure.
        msg: String,
    },

    /// A persisted value could not be encoded or decoded.
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),
}

impl MetadataError {
    /// True for the integrity class that makes a spec eligible for GC.
    pub fn is_invalid_spec(&self) -> bool {
        matches!(self, MetadataError::InvalidSpec { .. })
    }
}
