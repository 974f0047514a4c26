//! Remote-cluster references.

use serde::{Deserialize, Serialize};

use spansync_base::types::Revision;

use crate::error::MetadataError;

/// Reference to a remote cluster, addressed through one seed node.
///
/// The uuid is authoritative identity (captured from a live probe); the name
/// is a unique human-facing secondary key. When `demand_encryption` is set,
/// the PEM certificate must be present and probes must go over TLS.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteClusterReference {
    /// Unique human-readable name.
    pub name: String,
    /// Cluster uuid advertised by the remote; authoritative identity.
    pub uuid: String,
    /// `host:port` of one seed node's management endpoint.
    pub host_name: String,
    /// Username for the remote management API.
    pub user_name: String,
    /// Password for the remote management API.
    pub password: String,
    /// Whether connections to this cluster must be encrypted.
    pub demand_encryption: bool,
    /// PEM certificate chain; required when `demand_encryption` is set.
    #[serde(default)]
    pub certificate: Option<String>,
    /// Persistence revision of the backing catalog entry.
    #[serde(skip)]
    pub revision: Option<Revision>,
}

impl RemoteClusterReference {
    /// Builds a reference as declared by the operator. The uuid stays empty
    /// until a live probe captures it.
    pub fn new(
        name: impl Into<String>,
        host_name: impl Into<String>,
        user_name: impl Into<String>,
        password: impl Into<String>,
        demand_encryption: bool,
        certificate: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            uuid: String::new(),
            host_name: host_name.into(),
            user_name: user_name.into(),
            password: password.into(),
            demand_encryption,
            certificate,
            revision: None,
        }
    }

    /// The seed node's `host:port`, after shape validation.
    pub fn connection_str(&self) -> Result<&str, MetadataError> {
        self.validate_shape()?;
        Ok(&self.host_name)
    }

    /// Username/password pair for the remote management API.
    pub fn credentials(&self) -> (&str, &str) {
        (&self.user_name, &self.password)
    }

    /// The host part of the seed address.
    pub fn host(&self) -> Result<&str, MetadataError> {
        self.validate_shape()?;
        Ok(self
            .host_name
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.host_name))
    }

    /// Checks the statically-checkable invariants of the reference.
    pub fn validate_shape(&self) -> Result<(), MetadataError> {
        if self.name.is_empty() {
            return Err(MetadataError::InvalidInput {
                msg: "remote cluster name is empty".to_string(),
            });
        }
        match self.host_name.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => {
                return Err(MetadataError::InvalidInput {
                    msg: format!("\"{}\" is not a host:port address", self.host_name),
                });
            }
        }
        if self.demand_encryption
            && self.certificate.as_deref().map_or(true, str::is_empty)
        {
            return Err(MetadataError::InvalidInput {
                msg: format!(
                    "remote cluster \"{}\" demands encryption but carries no certificate",
                    self.name
                ),
            });
        }
        Ok(())
    }

    /// Encodes the reference for catalog storage (revision omitted).
    pub fn encode(&self) -> Result<Vec<u8>, MetadataError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a reference from catalog storage, attaching the out-of-band
    /// revision.
    pub fn decode(value: &[u8], revision: Option<Revision>) -> Result<Self, MetadataError> {
        let mut reference: RemoteClusterReference = serde_json::from_slice(value)?;
        reference.revision = revision;
        Ok(reference)
    }
}
