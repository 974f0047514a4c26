//! Generic heartbeat supervisor.
//!
//! A supervisor owns a set of child supervisables and heartbeats them on a
//! ticker. Children answer on a per-request reply channel; laggards
//! accumulate missed beats, and a child that stays silent past the threshold
//! is escalated to the failure handler. The supervisor never kills a child;
//! the handler decides policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use spansync_base::constants::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_MISSED_HEARTBEAT_THRESHOLD,
    HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, MISSED_HEARTBEAT_THRESHOLD,
};
use spansync_base::settings::{
    validate_settings, SettingDef, SettingDefs, SettingKind, SettingValue, SettingsError,
    SettingsMap,
};

use crate::error::SupervisorError;

/// A child's answer to one heartbeat request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeartbeatResponse {
    /// The child is healthy.
    Ok,
    /// The child answered but reports itself unhealthy.
    NotOk,
}

/// Anything a supervisor can watch over.
#[async_trait]
pub trait Supervisable: Send + Sync {
    /// Stable identifier of this child.
    fn id(&self) -> &str;

    /// Queues a heartbeat request; the child answers on `reply` when it can.
    ///
    /// Returning an error means the request could not even be queued; the
    /// child is skipped for this round rather than counted as missing.
    async fn heartbeat(
        &self,
        reply: mpsc::Sender<HeartbeatResponse>,
        sent_at: Instant,
    ) -> Result<(), SupervisorError>;
}

/// Decides policy when children stop responding.
///
/// The handler is invoked at most once per supervisor run, from inside the
/// failing heartbeat round. It must not call [`GenericSupervisor::stop`]
/// synchronously; spawn the teardown instead.
pub trait SupervisorFailureHandler: Send + Sync {
    /// Called with every broken child and a description of its failure.
    fn on_child_failure(&self, supervisor_id: &str, failures: HashMap<String, String>);
}

/// Lifecycle of a supervisor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    /// Constructed, settings not yet applied.
    Created,
    /// Settings validated and applied.
    Initialized,
    /// Ticker running, children being heartbeated.
    Running,
    /// Escalating or shutting down.
    Stopping,
    /// Terminal.
    Stopped,
}

/// Where a child stands within one heartbeat round.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum HeartbeatStatus {
    /// The request could not be queued; the child is not counted this round.
    Skip,
    NotYetResponded,
    RespondedOk,
    RespondedNotOk,
}

/// Validated supervisor timing settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Interval between heartbeat rounds.
    pub heartbeat_interval: Duration,
    /// How long a round waits for stragglers.
    pub heartbeat_timeout: Duration,
    /// Consecutive misses after which a child is broken.
    pub missed_heartbeat_threshold: u16,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            missed_heartbeat_threshold: DEFAULT_MISSED_HEARTBEAT_THRESHOLD,
        }
    }
}

impl SupervisorConfig {
    fn setting_defs() -> SettingDefs {
        let mut defs = SettingDefs::new();
        defs.insert(
            HEARTBEAT_INTERVAL,
            SettingDef::new(SettingKind::Duration, false),
        );
        defs.insert(
            HEARTBEAT_TIMEOUT,
            SettingDef::new(SettingKind::Duration, false),
        );
        defs.insert(
            MISSED_HEARTBEAT_THRESHOLD,
            SettingDef::new(SettingKind::Unsigned, false),
        );
        defs
    }

    /// Builds a config from a settings map, falling back to defaults for
    /// absent keys.
    pub fn from_settings(settings: &SettingsMap) -> Result<Self, SettingsError> {
        validate_settings(&Self::setting_defs(), settings)?;

        let mut config = Self::default();
        if let Some(value) = settings
            .get(HEARTBEAT_INTERVAL)
            .and_then(SettingValue::as_duration)
        {
            config.heartbeat_interval = value;
        }
        if let Some(value) = settings
            .get(HEARTBEAT_TIMEOUT)
            .and_then(SettingValue::as_duration)
        {
            config.heartbeat_timeout = value;
        }
        if let Some(value) = settings
            .get(MISSED_HEARTBEAT_THRESHOLD)
            .and_then(SettingValue::as_unsigned)
        {
            config.missed_heartbeat_threshold = u16::try_from(value).unwrap_or(u16::MAX);
        }
        Ok(config)
    }
}

/// A supervision-tree node.
///
/// Heartbeat rounds never overlap for one supervisor: each round holds a
/// single-slot permit from tick to report. `stop` is idempotent and waits
/// for the in-flight round, so the failure handler can no longer fire once
/// it returns.
pub struct GenericSupervisor {
    id: String,
    children: RwLock<HashMap<String, Arc<dyn Supervisable>>>,
    missed_beats: StdMutex<HashMap<String, u16>>,
    config: StdMutex<SupervisorConfig>,
    state: StdMutex<SupervisorState>,
    failure_handler: Arc<dyn SupervisorFailureHandler>,
    parent: Option<Weak<GenericSupervisor>>,
    round_gate: Arc<Semaphore>,
    stop_tx: watch::Sender<bool>,
    supervising_task: Mutex<Option<JoinHandle<()>>>,
}

impl GenericSupervisor {
    /// Creates a supervisor and, when a parent is given, registers with it as
    /// a child. The parent is held only as a weak back-reference.
    pub async fn new(
        id: impl Into<String>,
        failure_handler: Arc<dyn SupervisorFailureHandler>,
        parent: Option<&Arc<GenericSupervisor>>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        let supervisor = Arc::new(Self {
            id: id.into(),
            children: RwLock::new(HashMap::new()),
            missed_beats: StdMutex::new(HashMap::new()),
            config: StdMutex::new(SupervisorConfig::default()),
            state: StdMutex::new(SupervisorState::Created),
            failure_handler,
            parent: parent.map(Arc::downgrade),
            round_gate: Arc::new(Semaphore::new(1)),
            stop_tx,
            supervising_task: Mutex::new(None),
        });

        if let Some(parent) = parent {
            parent.add_child(supervisor.clone()).await;
        }
        supervisor
    }

    /// This supervisor's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        *self.state.lock().expect("lock poisoned")
    }

    /// Puts a child under supervision.
    pub async fn add_child(&self, child: Arc<dyn Supervisable>) {
        info!(supervisor = %self.id, child = child.id(), "adding child");
        self.children
            .write()
            .await
            .insert(child.id().to_string(), child);
    }

    /// Removes a child from supervision; absent ids are ignored.
    pub async fn remove_child(&self, child_id: &str) {
        info!(supervisor = %self.id, child = child_id, "removing child");
        self.children.write().await.remove(child_id);
        self.missed_beats
            .lock()
            .expect("lock poisoned")
            .remove(child_id);
    }

    /// Looks up a supervised child.
    pub async fn child(&self, child_id: &str) -> Result<Arc<dyn Supervisable>, SupervisorError> {
        self.children
            .read()
            .await
            .get(child_id)
            .cloned()
            .ok_or_else(|| SupervisorError::ChildNotFound {
                id: child_id.to_string(),
            })
    }

    /// Number of supervised children.
    pub async fn child_count(&self) -> usize {
        self.children.read().await.len()
    }

    /// Consecutive missed beats currently accounted to `child_id`.
    pub fn missed_beat_count(&self, child_id: &str) -> u16 {
        self.missed_beats
            .lock()
            .expect("lock poisoned")
            .get(child_id)
            .copied()
            .unwrap_or(0)
    }

    /// Validates settings and starts the heartbeat ticker.
    pub async fn start(self: &Arc<Self>, settings: SettingsMap) -> Result<(), SupervisorError> {
        let config = SupervisorConfig::from_settings(&settings)?;
        {
            let mut state = self.state.lock().expect("lock poisoned");
            if *state != SupervisorState::Created {
                return Err(SupervisorError::AlreadyStarted { state: *state });
            }
            *state = SupervisorState::Initialized;
        }
        *self.config.lock().expect("lock poisoned") = config.clone();

        {
            let mut state = self.state.lock().expect("lock poisoned");
            *state = SupervisorState::Running;
        }

        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            supervisor.supervising(config.heartbeat_interval).await;
        });
        *self.supervising_task.lock().await = Some(handle);

        info!(supervisor = %self.id, "supervisor started");
        Ok(())
    }

    /// Stops supervision.
    ///
    /// Signals the in-flight round to finish first so no stale timeout is
    /// reported, joins the supervising task, and deregisters from the parent
    /// when one is still alive. Safe to call repeatedly.
    pub async fn stop(self: &Arc<Self>) {
        info!(supervisor = %self.id, "stopping supervisor");
        {
            let mut state = self.state.lock().expect("lock poisoned");
            if *state == SupervisorState::Running {
                *state = SupervisorState::Stopping;
            }
        }

        // Wake the supervising loop and any wait task.
        self.stop_tx.send_replace(true);

        // Wait for the in-flight heartbeat round to drain, failure
        // escalation included.
        if let Ok(permit) = self.round_gate.clone().acquire_owned().await {
            drop(permit);
        }

        if let Some(handle) = self.supervising_task.lock().await.take() {
            let _ = handle.await;
        }

        {
            let mut state = self.state.lock().expect("lock poisoned");
            *state = SupervisorState::Stopped;
        }

        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.remove_child(&self.id).await;
        }
        info!(supervisor = %self.id, "supervisor stopped");
    }

    /// Escalates broken children to the failure handler.
    ///
    /// The quit latch doubles as a single-shot guard: whoever sets it first
    /// owns the escalation, so the handler fires at most once per run and
    /// never after `stop` has returned.
    pub fn report_failure(&self, failures: HashMap<String, String>) {
        let already_stopping = self.stop_tx.send_replace(true);
        if already_stopping {
            return;
        }
        {
            let mut state = self.state.lock().expect("lock poisoned");
            *state = SupervisorState::Stopping;
        }
        warn!(supervisor = %self.id, children = failures.len(), "escalating broken children");
        self.failure_handler.on_child_failure(&self.id, failures);
        {
            let mut state = self.state.lock().expect("lock poisoned");
            *state = SupervisorState::Stopped;
        }
    }

    async fn supervising(self: Arc<Self>, heartbeat_interval: Duration) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = interval(heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; consume it so
        // rounds start one interval after `start`.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                    debug!(supervisor = %self.id, "heartbeat tick");
                    let permit = tokio::select! {
                        _ = stop_rx.changed() => break,
                        permit = self.round_gate.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    self.send_heartbeats(permit).await;
                }
            }
        }
        info!(supervisor = %self.id, "supervising loop exited");
    }

    /// Fans a heartbeat out to every child. The children read lock is held
    /// for the duration of the fan-out only; responses are gathered by a
    /// spawned wait task that owns the round permit.
    async fn send_heartbeats(self: &Arc<Self>, permit: OwnedSemaphorePermit) {
        let mut statuses = HashMap::new();
        let mut receivers = Vec::new();
        {
            let children = self.children.read().await;
            if children.is_empty() {
                return;
            }
            for (child_id, child) in children.iter() {
                let (reply_tx, reply_rx) = mpsc::channel(1);
                debug!(supervisor = %self.id, child = %child_id, "heartbeat sent");
                match child.heartbeat(reply_tx, Instant::now()).await {
                    Ok(()) => {
                        statuses.insert(child_id.clone(), HeartbeatStatus::NotYetResponded);
                        receivers.push((child_id.clone(), reply_rx));
                    }
                    Err(err) => {
                        debug!(supervisor = %self.id, child = %child_id, error = %err, "heartbeat skipped");
                        statuses.insert(child_id.clone(), HeartbeatStatus::Skip);
                    }
                }
            }
        }

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.wait_for_responses(statuses, receivers, permit).await;
        });
    }

    /// Gathers replies until every child answered or the round deadline
    /// passes. Exits silently when the supervisor is stopping, so a stopped
    /// supervisor never reports a stale timeout.
    async fn wait_for_responses(
        self: Arc<Self>,
        mut statuses: HashMap<String, HeartbeatStatus>,
        receivers: Vec<(String, mpsc::Receiver<HeartbeatResponse>)>,
        permit: OwnedSemaphorePermit,
    ) {
        let _round = permit;
        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return;
        }

        let timeout = self
            .config
            .lock()
            .expect("lock poisoned")
            .heartbeat_timeout;
        let deadline = Instant::now() + timeout;

        'gather: for (child_id, mut reply_rx) in receivers {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => {
                    debug!(supervisor = %self.id, "wait task exiting, supervisor stopping");
                    return;
                }
                response = reply_rx.recv() => {
                    let status = match response {
                        Some(HeartbeatResponse::Ok) => HeartbeatStatus::RespondedOk,
                        Some(HeartbeatResponse::NotOk) => HeartbeatStatus::RespondedNotOk,
                        // The child dropped the reply channel unanswered.
                        None => HeartbeatStatus::NotYetResponded,
                    };
                    statuses.insert(child_id, status);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(supervisor = %self.id, "heartbeat timeout, stragglers counted as missed");
                    break 'gather;
                }
            }
        }

        if *stop_rx.borrow() {
            return;
        }
        self.process_report(statuses);
    }

    /// Updates missed-beat accounting from one round and escalates children
    /// past the threshold.
    fn process_report(&self, statuses: HashMap<String, HeartbeatStatus>) {
        let threshold = self
            .config
            .lock()
            .expect("lock poisoned")
            .missed_heartbeat_threshold;
        let mut broken = HashMap::new();
        {
            let mut missed = self.missed_beats.lock().expect("lock poisoned");
            for (child_id, status) in &statuses {
                match status {
                    HeartbeatStatus::NotYetResponded | HeartbeatStatus::RespondedNotOk => {
                        let count = missed.entry(child_id.clone()).or_insert(0);
                        *count += 1;
                        info!(
                            supervisor = %self.id,
                            child = %child_id,
                            missed = *count,
                            "child missed a consecutive heartbeat"
                        );
                        if *count > threshold {
                            broken.insert(child_id.clone(), "Not responding".to_string());
                        }
                    }
                    HeartbeatStatus::RespondedOk => {
                        missed.insert(child_id.clone(), 0);
                    }
                    HeartbeatStatus::Skip => {}
                }
            }
        }

        if !broken.is_empty() {
            self.report_failure(broken);
        }
    }
}

#[async_trait]
impl Supervisable for GenericSupervisor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn heartbeat(
        &self,
        reply: mpsc::Sender<HeartbeatResponse>,
        _sent_at: Instant,
    ) -> Result<(), SupervisorError> {
        if self.state() != SupervisorState::Running {
            return Err(SupervisorError::NotRunning);
        }
        let _ = reply.try_send(HeartbeatResponse::Ok);
        Ok(())
    }
}
