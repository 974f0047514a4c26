//! Core identifier types shared across the control plane.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::KEY_PARTS_DELIMITER;

/// Identity of one replication declaration.
///
/// Derived deterministically as
/// `source_bucket '_' target_cluster_uuid '_' target_bucket`, which keeps it
/// stable across process restarts and across bucket recreations under the
/// same name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicationId(String);

impl ReplicationId {
    /// Derives the identity for a source bucket, target cluster, target bucket triple.
    pub fn new(source_bucket: &str, target_cluster_uuid: &str, target_bucket: &str) -> Self {
        ReplicationId(format!(
            "{source_bucket}{d}{target_cluster_uuid}{d}{target_bucket}",
            d = KEY_PARTS_DELIMITER
        ))
    }

    /// Wraps an already-derived identity, e.g. one read back from a catalog key.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        ReplicationId(raw.into())
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The source bucket segment (everything before the first delimiter).
    pub fn source_bucket(&self) -> &str {
        self.0
            .split(KEY_PARTS_DELIMITER)
            .next()
            .unwrap_or(&self.0)
    }

    /// Membership test: does this identity replicate from `bucket`?
    ///
    /// Parses the prefix segment rather than comparing substrings, so bucket
    /// "a" does not match an identity for bucket "ab".
    pub fn is_for_source_bucket(&self, bucket: &str) -> bool {
        self.0
            .strip_prefix(bucket)
            .is_some_and(|rest| rest.starts_with(KEY_PARTS_DELIMITER))
    }
}

impl fmt::Display for ReplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque persistence revision token.
///
/// Revisions are monotone per key and exist only to be handed back on a
/// compare-and-swap write; their numeric value carries no other meaning.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
    /// Creates a revision from its raw counter value.
    pub fn new(rev: u64) -> Self {
        Revision(rev)
    }

    /// Returns the raw counter value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
