//! Live probes against a remote cluster's management API.
//!
//! A probe contacts the seed node named in a [`RemoteClusterReference`],
//! authenticates with the supplied credentials, and returns what the cluster
//! advertises about itself. The advertised uuid is authoritative for the
//! reference.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use spansync_base::constants::{POOLS_PATH, SSL_MGMT_PORT_KEY, SSL_PORTS_PATH};

use crate::error::MetadataError;
use crate::remote_cluster::RemoteClusterReference;

/// What a successful probe learned about the remote cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeOutcome {
    /// The uuid the cluster advertises.
    pub uuid: String,
}

/// Probes a remote cluster's management endpoint.
#[async_trait]
pub trait ClusterProber: Send + Sync {
    /// Contacts the seed node in `reference` and returns what it advertises.
    ///
    /// Honors the prober's deadline; expiry surfaces as `Unreachable`.
    async fn probe(&self, reference: &RemoteClusterReference)
        -> Result<ProbeOutcome, MetadataError>;
}

/// [`ClusterProber`] over HTTP(S) using the cluster management API.
///
/// Plain references are probed with `GET /pools` over HTTP. References that
/// demand encryption first resolve the SSL management port via
/// `GET /nodes/self/xdcrSSLPorts`, then re-probe `/pools` over HTTPS with the
/// reference certificate pinned as the root of trust.
pub struct HttpClusterProber {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpClusterProber {
    /// Creates a prober whose requests are bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, MetadataError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| MetadataError::Unreachable {
                msg: format!("failed to build http client: {err}"),
            })?;
        Ok(Self { client, timeout })
    }

    async fn get_json(
        &self,
        client: &reqwest::Client,
        url: &str,
        user: &str,
        password: &str,
    ) -> Result<Value, MetadataError> {
        let response = client
            .get(url)
            .basic_auth(user, Some(password))
            .send()
            .await
            .map_err(|err| MetadataError::Unreachable {
                msg: format!("{url}: {err}"),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(MetadataError::AuthFailed {
                endpoint: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(MetadataError::Unreachable {
                msg: format!("{url}: status {status}"),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|err| MetadataError::InvalidInput {
                msg: format!("{url}: unparseable body: {err}"),
            })
    }

    /// Resolves the SSL management port advertised by the seed node.
    async fn ssl_mgmt_port(
        &self,
        reference: &RemoteClusterReference,
    ) -> Result<u16, MetadataError> {
        let url = format!("http://{}{}", reference.host_name, SSL_PORTS_PATH);
        let (user, password) = reference.credentials();
        let body = self.get_json(&self.client, &url, user, password).await?;

        body.get(SSL_MGMT_PORT_KEY)
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| MetadataError::InvalidInput {
                msg: format!("{url}: body carries no {SSL_MGMT_PORT_KEY} port"),
            })
    }
}

#[async_trait]
impl ClusterProber for HttpClusterProber {
    async fn probe(
        &self,
        reference: &RemoteClusterReference,
    ) -> Result<ProbeOutcome, MetadataError> {
        reference.validate_shape()?;
        let (user, password) = reference.credentials();

        let (client, url) = if reference.demand_encryption {
            let pem = reference.certificate.as_deref().unwrap_or_default();
            let root = reqwest::Certificate::from_pem(pem.as_bytes()).map_err(|err| {
                MetadataError::InvalidInput {
                    msg: format!("certificate for \"{}\" is not valid PEM: {err}", reference.name),
                }
            })?;
            let client = reqwest::Client::builder()
                .add_root_certificate(root)
                .timeout(self.timeout)
                .build()
                .map_err(|err| MetadataError::Unreachable {
                    msg: format!("failed to build https client: {err}"),
                })?;

            let port = self.ssl_mgmt_port(reference).await?;
            let host = reference.host()?;
            (client, format!("https://{host}:{port}{POOLS_PATH}"))
        } else {
            (
                self.client.clone(),
                format!("http://{}{}", reference.host_name, POOLS_PATH),
            )
        };

        let body = self.get_json(&client, &url, user, password).await?;
        let uuid = body
            .get("uuid")
            .and_then(Value::as_str)
            .ok_or_else(|| MetadataError::InvalidInput {
                msg: format!("{url}: pools body advertises no uuid"),
            })?;

        Ok(ProbeOutcome {
            uuid: uuid.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_malformed_reference_rejected_before_network() {
        let prober = HttpClusterProber::new(Duration::from_millis(50)).unwrap();
        let reference =
            RemoteClusterReference::new("r", "not-an-address", "admin", "pw", false, None);

        let err = prober.probe(&reference).await.unwrap_err();
        assert!(matches!(err, MetadataError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_bad_pem_rejected_before_network() {
        let prober = HttpClusterProber::new(Duration::from_millis(50)).unwrap();
        let reference = RemoteClusterReference::new(
            "r",
            "10.0.0.1:8091",
            "admin",
            "pw",
            true,
            Some("garbage".to_string()),
        );

        let err = prober.probe(&reference).await.unwrap_err();
        assert!(matches!(err, MetadataError::InvalidInput { .. }));
    }
}
