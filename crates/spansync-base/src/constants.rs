//! Protocol and configuration constants shared across the control plane.

use std::time::Duration;

/// Catalog (key namespace) holding replication specifications.
pub const REPLICATION_SPECS_CATALOG: &str = "replicationSpec";

/// Catalog holding remote cluster references.
pub const REMOTE_CLUSTERS_CATALOG: &str = "remoteCluster";

/// Delimiter between the parts of a composite metadata key.
pub const KEY_PARTS_DELIMITER: &str = "_";

/// Admin-surface field key for the source bucket input.
pub const FROM_BUCKET: &str = "fromBucket";

/// Admin-surface field key for the target cluster input.
pub const TO_CLUSTER: &str = "toCluster";

/// Admin-surface field key for the target bucket input.
pub const TO_BUCKET: &str = "toBucket";

/// Catch-all field key for validation errors not tied to a single input.
pub const PLACEHOLDER_FIELD_KEY: &str = "_";

/// Management API path advertising the cluster pool and its uuid.
pub const POOLS_PATH: &str = "/pools";

/// Management API path advertising SSL ports on the contacted node.
pub const SSL_PORTS_PATH: &str = "/nodes/self/xdcrSSLPorts";

/// Key of the SSL management port in the SSL-ports response body.
pub const SSL_MGMT_PORT_KEY: &str = "httpsMgmt";

/// Minimum remote compatibility version for memcached-style replication.
pub const MIN_MEMCACHED_COMPAT_VERSION: [u32; 2] = [2, 2];

/// Setting key: interval between heartbeat rounds.
pub const HEARTBEAT_INTERVAL: &str = "heartbeat_interval";

/// Setting key: a child missed a beat if it did not respond within this window.
pub const HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";

/// Setting key: a child is broken after this many consecutive missed beats.
pub const MISSED_HEARTBEAT_THRESHOLD: &str = "missed_heartbeat_threshold";

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// Default heartbeat timeout.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(4000);

/// Default missed-beat threshold.
pub const DEFAULT_MISSED_HEARTBEAT_THRESHOLD: u16 = 5;

/// Id of the root supervisor owned by the replication manager.
pub const REPLICATION_MANAGER_SUPERVISOR_ID: &str = "ReplicationManagerSupervisor";

/// Id of the supervisor overseeing all pipeline supervisors.
pub const PIPELINE_MASTER_SUPERVISOR_ID: &str = "PipelineMasterSupervisor";

/// Id prefix for per-pipeline supervisors.
pub const PIPELINE_SUPERVISOR_ID_PREFIX: &str = "PipelineSupervisor_";
