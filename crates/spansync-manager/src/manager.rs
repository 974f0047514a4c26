//! The replication manager: composition root for the control plane.
//!
//! Wires the catalog, the remote-cluster and replication-spec services, and
//! the supervision tree. Subscribes the service callbacks to their catalog
//! prefixes and republishes spec changes on a broadcast channel for
//! downstream listeners (pipeline schedulers, admin surfaces).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use spansync_base::constants::{
    PIPELINE_MASTER_SUPERVISOR_ID, REMOTE_CLUSTERS_CATALOG, REPLICATION_MANAGER_SUPERVISOR_ID,
    REPLICATION_SPECS_CATALOG,
};
use spansync_base::types::ReplicationId;
use spansync_metadata::catalog::MetadataCatalog;
use spansync_metadata::error::MetadataError;
use spansync_metadata::external::UiLogSvc;
use spansync_metadata::remote_cluster::RemoteClusterReference;
use spansync_metadata::remote_cluster_service::RemoteClusterService;
use spansync_metadata::spec::{ReplicationSettings, ReplicationSpecification};
use spansync_metadata::spec_service::ReplicationSpecService;
use spansync_supervisor::{
    GenericSupervisor, Supervisable, SupervisorError, SupervisorFailureHandler,
};

use crate::config::ManagerConfig;

const SPEC_CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// One observed change to the replication declarations.
#[derive(Clone)]
pub struct SpecChange {
    pub id: ReplicationId,
    /// The new state; absent when the spec was deleted.
    pub spec: Option<ReplicationSpecification>,
}

/// Outcome of a create request: the persisted spec, or the field-scoped
/// validation errors for the admin surface to render.
pub enum CreateOutcome {
    Created(ReplicationSpecification),
    Invalid(HashMap<&'static str, MetadataError>),
}

/// Failure policy for supervised pipelines: surface the failure; the
/// pipeline owner decides on restart.
struct PipelineFailureHandler {
    uilog: Arc<dyn UiLogSvc>,
}

impl SupervisorFailureHandler for PipelineFailureHandler {
    fn on_child_failure(&self, supervisor_id: &str, failures: HashMap<String, String>) {
        for (child_id, reason) in &failures {
            error!(supervisor = supervisor_id, child = %child_id, reason = %reason, "supervised pipeline failed");
            self.uilog
                .write(&format!("Pipeline \"{child_id}\" failed: {reason}"));
        }
    }
}

pub struct ReplicationManager {
    catalog: Arc<dyn MetadataCatalog>,
    remote_cluster_svc: Arc<RemoteClusterService>,
    spec_svc: Arc<ReplicationSpecService>,
    root_supervisor: Arc<GenericSupervisor>,
    pipeline_supervisor: Arc<GenericSupervisor>,
    spec_changes: broadcast::Sender<SpecChange>,
    gc_task: StdMutex<Option<JoinHandle<()>>>,
}

impl ReplicationManager {
    /// Wires the services together, registers the catalog callbacks, starts
    /// the supervision tree, and launches the periodic GC sweep.
    pub async fn start(
        catalog: Arc<dyn MetadataCatalog>,
        remote_cluster_svc: Arc<RemoteClusterService>,
        spec_svc: Arc<ReplicationSpecService>,
        uilog: Arc<dyn UiLogSvc>,
        config: &ManagerConfig,
    ) -> Result<Arc<Self>, ManagerError> {
        let failure_handler = Arc::new(PipelineFailureHandler {
            uilog: uilog.clone(),
        });
        let root_supervisor = GenericSupervisor::new(
            REPLICATION_MANAGER_SUPERVISOR_ID,
            failure_handler.clone(),
            None,
        )
        .await;
        let pipeline_supervisor = GenericSupervisor::new(
            PIPELINE_MASTER_SUPERVISOR_ID,
            failure_handler,
            Some(&root_supervisor),
        )
        .await;
        root_supervisor.start(config.supervisor_settings()).await?;
        pipeline_supervisor.start(config.supervisor_settings()).await?;

        let (spec_changes, _) = broadcast::channel(SPEC_CHANGE_CHANNEL_CAPACITY);

        let gc_spec_svc = spec_svc.clone();
        let gc_interval = config.gc_interval();
        let gc_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gc_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; consume
            // it so the first sweep runs one interval after start.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                run_gc_sweep(&gc_spec_svc).await;
            }
        });

        let manager = Arc::new(Self {
            catalog,
            remote_cluster_svc,
            spec_svc,
            root_supervisor,
            pipeline_supervisor,
            spec_changes,
            gc_task: StdMutex::new(Some(gc_task)),
        });
        manager.register_callbacks();

        info!("replication manager started");
        Ok(manager)
    }

    /// The change-notification path is the source of truth for cache state;
    /// both service callbacks hang off their catalog prefix here.
    fn register_callbacks(&self) {
        let spec_svc = self.spec_svc.clone();
        let changes = self.spec_changes.clone();
        self.catalog.register_callback(
            REPLICATION_SPECS_CATALOG,
            Arc::new(move |path, value, revision| {
                match spec_svc.replication_spec_service_callback(path, value, revision) {
                    Ok(outcome) => {
                        let _ = changes.send(SpecChange {
                            id: outcome.id,
                            spec: outcome.new_spec,
                        });
                    }
                    Err(err) => {
                        error!(path, error = %err, "failed to apply replication spec change");
                    }
                }
            }),
        );

        let remote_cluster_svc = self.remote_cluster_svc.clone();
        self.catalog.register_callback(
            REMOTE_CLUSTERS_CATALOG,
            Arc::new(move |path, value, revision| {
                if let Err(err) =
                    remote_cluster_svc.remote_cluster_service_callback(path, value, revision)
                {
                    error!(path, error = %err, "failed to apply remote cluster change");
                }
            }),
        );
    }

    /// Subscribes to replication spec changes (creations, updates, deletes).
    pub fn subscribe_spec_changes(&self) -> broadcast::Receiver<SpecChange> {
        self.spec_changes.subscribe()
    }

    /// Validates and creates a replication declaration.
    pub async fn create_replication(
        &self,
        source_bucket: &str,
        target_cluster_name: &str,
        target_bucket: &str,
        settings: ReplicationSettings,
    ) -> Result<CreateOutcome, ManagerError> {
        let validation = self
            .spec_svc
            .validate_new_replication_spec(
                source_bucket,
                target_cluster_name,
                target_bucket,
                &settings,
            )
            .await;
        if !validation.errors.is_empty() {
            return Ok(CreateOutcome::Invalid(validation.errors));
        }
        let target_ref = validation
            .target_ref
            .ok_or_else(|| MetadataError::ClusterNotFound {
                name: target_cluster_name.to_string(),
            })?;

        let mut spec = ReplicationSpecification::new(
            source_bucket,
            validation.source_bucket_uuid,
            target_ref.uuid,
            target_bucket,
            validation.target_bucket_uuid,
        );
        spec.settings = settings;
        let spec = self.spec_svc.add_replication_spec(spec)?;
        Ok(CreateOutcome::Created(spec))
    }

    /// Deletes a replication declaration; returns the spec that was removed.
    pub fn delete_replication(
        &self,
        id: &ReplicationId,
    ) -> Result<ReplicationSpecification, ManagerError> {
        Ok(self.spec_svc.del_replication_spec(id)?)
    }

    /// Pauses a replication by flipping its active flag off.
    pub fn pause_replication(
        &self,
        id: &ReplicationId,
    ) -> Result<ReplicationSpecification, ManagerError> {
        self.set_active(id, false)
    }

    /// Resumes a paused replication.
    pub fn resume_replication(
        &self,
        id: &ReplicationId,
    ) -> Result<ReplicationSpecification, ManagerError> {
        self.set_active(id, true)
    }

    fn set_active(
        &self,
        id: &ReplicationId,
        active: bool,
    ) -> Result<ReplicationSpecification, ManagerError> {
        let mut spec = self.spec_svc.replication_spec(id)?;
        if spec.settings.active == active {
            return Ok(spec);
        }
        spec.settings.active = active;
        Ok(self.spec_svc.set_replication_spec(spec)?)
    }

    /// Registers an operator-declared remote cluster.
    pub async fn add_remote_cluster(
        &self,
        reference: RemoteClusterReference,
    ) -> Result<RemoteClusterReference, ManagerError> {
        Ok(self.remote_cluster_svc.add_remote_cluster(reference).await?)
    }

    /// Updates the remote cluster currently named `name`.
    pub async fn set_remote_cluster(
        &self,
        name: &str,
        reference: RemoteClusterReference,
    ) -> Result<RemoteClusterReference, ManagerError> {
        Ok(self
            .remote_cluster_svc
            .set_remote_cluster(name, reference)
            .await?)
    }

    /// Deletes the remote cluster named `name`.
    pub fn del_remote_cluster(
        &self,
        name: &str,
    ) -> Result<RemoteClusterReference, ManagerError> {
        Ok(self.remote_cluster_svc.del_remote_cluster_by_ref_name(name)?)
    }

    /// Enumerates the known remote clusters, keyed by name.
    pub async fn remote_clusters(
        &self,
        refresh: bool,
    ) -> Result<HashMap<String, RemoteClusterReference>, ManagerError> {
        Ok(self.remote_cluster_svc.remote_clusters(refresh).await?)
    }

    /// Puts an externally-owned pipeline under liveness supervision.
    pub async fn supervise_pipeline(&self, pipeline: Arc<dyn Supervisable>) {
        self.pipeline_supervisor.add_child(pipeline).await;
    }

    /// Removes a pipeline from supervision.
    pub async fn unsupervise_pipeline(&self, pipeline_id: &str) {
        self.pipeline_supervisor.remove_child(pipeline_id).await;
    }

    /// Sweeps every live spec and garbage-collects the dangling ones.
    ///
    /// The same sweep runs periodically on the configured GC interval; this
    /// entry point exists for operator-triggered sweeps.
    pub async fn validate_and_gc_all(&self) {
        run_gc_sweep(&self.spec_svc).await;
    }

    /// Access to the spec service for read-side callers.
    pub fn spec_service(&self) -> &Arc<ReplicationSpecService> {
        &self.spec_svc
    }

    /// Access to the remote-cluster service for read-side callers.
    pub fn remote_cluster_service(&self) -> &Arc<RemoteClusterService> {
        &self.remote_cluster_svc
    }

    /// Tears the periodic sweep and the supervision tree down.
    pub async fn stop(&self) {
        info!("stopping replication manager");
        if let Some(task) = self.gc_task.lock().expect("lock poisoned").take() {
            task.abort();
        }
        self.pipeline_supervisor.stop().await;
        self.root_supervisor.stop().await;
        if self.root_supervisor.child_count().await > 0 {
            warn!("children remained under the root supervisor at shutdown");
        }
    }
}

/// One pass over every live spec, garbage-collecting the dangling ones.
async fn run_gc_sweep(spec_svc: &ReplicationSpecService) {
    let specs = spec_svc.all_replication_specs();
    info!(specs = specs.len(), "sweeping replication specs for dangling referents");
    for spec in specs.values() {
        spec_svc.validate_and_gc(spec).await;
    }
}
