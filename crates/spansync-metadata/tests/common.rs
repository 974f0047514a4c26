//! Common test doubles and fixtures for the metadata integration tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use spansync_metadata::catalog::MemoryCatalog;
use spansync_metadata::error::MetadataError;
use spansync_metadata::external::{BucketSvc, ClusterInfoSvc, TopologySvc, UiLogSvc};
use spansync_metadata::probe::{ClusterProber, ProbeOutcome};
use spansync_metadata::remote_cluster::RemoteClusterReference;
use spansync_metadata::remote_cluster_service::RemoteClusterService;
use spansync_metadata::spec_service::ReplicationSpecService;

/// Uuid the local cluster reports in tests.
pub const LOCAL_CLUSTER_UUID: &str = "local-cluster-uuid";

/// Connection string the local topology reports in tests.
pub const LOCAL_CONN_STR: &str = "127.0.0.1:8091";

pub struct MockTopologySvc {
    pub conn_str: String,
    pub cluster_uuid: String,
}

impl TopologySvc for MockTopologySvc {
    fn my_connection_str(&self) -> String {
        self.conn_str.clone()
    }

    fn my_cluster_uuid(&self) -> String {
        self.cluster_uuid.clone()
    }
}

/// Bucket lookups against in-memory bucket tables.
#[derive(Default)]
pub struct MockBucketSvc {
    local: Mutex<HashMap<String, String>>,
    remote: Mutex<HashMap<String, String>>,
    local_unreachable: Mutex<bool>,
}

impl MockBucketSvc {
    /// Makes local lookups fail transiently, as if the admin port were down.
    pub fn set_local_unreachable(&self, unreachable: bool) {
        *self.local_unreachable.lock().unwrap() = unreachable;
    }

    pub fn set_local_bucket(&self, bucket: &str, uuid: &str) {
        self.local
            .lock()
            .unwrap()
            .insert(bucket.to_string(), uuid.to_string());
    }

    pub fn remove_local_bucket(&self, bucket: &str) {
        self.local.lock().unwrap().remove(bucket);
    }

    pub fn set_remote_bucket(&self, bucket: &str, uuid: &str) {
        self.remote
            .lock()
            .unwrap()
            .insert(bucket.to_string(), uuid.to_string());
    }

    pub fn remove_remote_bucket(&self, bucket: &str) {
        self.remote.lock().unwrap().remove(bucket);
    }
}

#[async_trait]
impl BucketSvc for MockBucketSvc {
    async fn local_bucket_uuid(
        &self,
        _connection_str: &str,
        bucket: &str,
    ) -> Result<String, MetadataError> {
        if *self.local_unreachable.lock().unwrap() {
            return Err(MetadataError::Unreachable {
                msg: "local admin port is down".to_string(),
            });
        }
        self.local
            .lock()
            .unwrap()
            .get(bucket)
            .cloned()
            .ok_or_else(|| MetadataError::BucketNotFound {
                bucket: bucket.to_string(),
            })
    }

    async fn remote_bucket_uuid(
        &self,
        _connection_str: &str,
        _user: &str,
        _password: &str,
        bucket: &str,
    ) -> Result<String, MetadataError> {
        self.remote
            .lock()
            .unwrap()
            .get(bucket)
            .cloned()
            .ok_or_else(|| MetadataError::BucketNotFound {
                bucket: bucket.to_string(),
            })
    }
}

pub struct MockClusterInfoSvc {
    pub compatible: Mutex<bool>,
}

impl Default for MockClusterInfoSvc {
    fn default() -> Self {
        Self {
            compatible: Mutex::new(true),
        }
    }
}

#[async_trait]
impl ClusterInfoSvc for MockClusterInfoSvc {
    async fn is_cluster_compatible(
        &self,
        _reference: &RemoteClusterReference,
        _version: [u32; 2],
    ) -> Result<bool, MetadataError> {
        Ok(*self.compatible.lock().unwrap())
    }
}

/// Prober answering from a host → uuid table.
#[derive(Default)]
pub struct MockProber {
    uuids: Mutex<HashMap<String, String>>,
}

impl MockProber {
    pub fn set_cluster(&self, host_name: &str, uuid: &str) {
        self.uuids
            .lock()
            .unwrap()
            .insert(host_name.to_string(), uuid.to_string());
    }
}

#[async_trait]
impl ClusterProber for MockProber {
    async fn probe(
        &self,
        reference: &RemoteClusterReference,
    ) -> Result<ProbeOutcome, MetadataError> {
        reference.validate_shape()?;
        self.uuids
            .lock()
            .unwrap()
            .get(&reference.host_name)
            .cloned()
            .map(|uuid| ProbeOutcome { uuid })
            .ok_or_else(|| MetadataError::Unreachable {
                msg: format!("no cluster behind {}", reference.host_name),
            })
    }
}

/// UI log sink that records every message.
#[derive(Default)]
pub struct RecordingUiLog {
    messages: Mutex<Vec<String>>,
}

impl RecordingUiLog {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl UiLogSvc for RecordingUiLog {
    fn write(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

/// An in-process control plane wired against the mocks.
pub struct TestHarness {
    pub catalog: Arc<MemoryCatalog>,
    pub remote_svc: Arc<RemoteClusterService>,
    pub spec_svc: Arc<ReplicationSpecService>,
    pub buckets: Arc<MockBucketSvc>,
    pub prober: Arc<MockProber>,
    pub cluster_info: Arc<MockClusterInfoSvc>,
    pub uilog: Arc<RecordingUiLog>,
}

impl TestHarness {
    pub fn new() -> Self {
        let catalog = Arc::new(MemoryCatalog::new());
        let prober = Arc::new(MockProber::default());
        let buckets = Arc::new(MockBucketSvc::default());
        let cluster_info = Arc::new(MockClusterInfoSvc::default());
        let uilog = Arc::new(RecordingUiLog::default());
        let topology = Arc::new(MockTopologySvc {
            conn_str: LOCAL_CONN_STR.to_string(),
            cluster_uuid: LOCAL_CLUSTER_UUID.to_string(),
        });

        let remote_svc = Arc::new(
            RemoteClusterService::new(catalog.clone(), prober.clone(), uilog.clone())
                .expect("remote cluster service should initialize"),
        );
        let spec_svc = Arc::new(
            ReplicationSpecService::new(
                catalog.clone(),
                remote_svc.clone(),
                topology,
                buckets.clone(),
                cluster_info.clone(),
                uilog.clone(),
            )
            .expect("replication spec service should initialize"),
        );

        Self {
            catalog,
            remote_svc,
            spec_svc,
            buckets,
            prober,
            cluster_info,
            uilog,
        }
    }
}
