//! Execution controller: owns the lifecycle of every run and drives the
//! worker pool that drains the job queue.
//!
//! Every change to a run happens under that run's lock and follows the same
//! order: apply transitions, persist the snapshot, then enqueue jobs and emit
//! notifications.

use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::dag::FlowGraph;
use crate::actions::ActionRegistry;
use crate::config::EngineConfig;
use crate::dispatcher::{DispatchReport, NodeDispatcher};
use crate::error::{EngineError, Result};
use crate::events::{Event, NotificationGateway, StatusChangeEvent};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::queue::{Ack, JobQueue, QueueStats};
use crate::state::{RunControl, RunState};
use crate::storage::PersistenceGateway;
use crate::tenant::{QuotaResource, Tenant, TenantId, TenantManager, TenantStatus};
use crate::types::{
    Flow, FlowId, FlowRun, Job, LogEntry, NodeId, NodeSpec, NodeStatus, Outcome, RetryPolicy,
    RunId, RunStatus,
};

/// Which runs `list_runs` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "filter", content = "status", rename_all = "snake_case")]
pub enum RunFilter {
    #[default]
    All,
    /// Running or paused
    Active,
    Status(RunStatus),
}

impl RunFilter {
    pub fn matches(&self, run: &FlowRun) -> bool {
        match self {
            Self::All => true,
            Self::Active => run.status.is_active(),
            Self::Status(status) => run.status == *status,
        }
    }
}

/// Aggregate view over a tenant's runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    /// Completed over finished runs; 0 when nothing finished yet
    pub success_rate: f64,
    pub average_duration_ms: Option<f64>,
}

/// A run resident in memory
struct ActiveRun {
    tenant_id: TenantId,
    graph: Arc<FlowGraph>,
    cancel: CancellationToken,
    state: Mutex<RunState>,
}

/// Transitions collected under the run lock, applied after persisting
#[derive(Default)]
struct Batch {
    events: Vec<StatusChangeEvent>,
    jobs: Vec<Job>,
}

impl Batch {
    fn node(&mut self, state: &mut RunState, node_id: &NodeId, to: NodeStatus) -> Result<()> {
        let before = state.node_status(node_id);
        state.set_node_status(node_id, to)?;
        if before != Some(to) {
            self.events.push(StatusChangeEvent::NodeStatusChanged {
                node_id: node_id.clone(),
                status: to,
                error: state.run.node(node_id).and_then(|n| n.error.clone()),
            });
        }
        Ok(())
    }

    fn run(&mut self, state: &mut RunState, to: RunStatus) -> Result<()> {
        let before = state.run.status;
        state.set_run_status(to)?;
        if before != to {
            self.events
                .push(StatusChangeEvent::RunStatusChanged { status: to });
        }
        Ok(())
    }
}

/// Coordinates runs, the job queue and the worker pool
pub struct ExecutionController {
    tenants: Arc<TenantManager>,
    queue: Arc<JobQueue>,
    dispatcher: Arc<NodeDispatcher>,
    store: Arc<dyn PersistenceGateway>,
    metrics: Arc<MetricsCollector>,
    notifier: Arc<dyn NotificationGateway>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: SyncMutex<Option<mpsc::UnboundedReceiver<Event>>>,
    runs: RwLock<HashMap<RunId, Arc<ActiveRun>>>,
    throttled: SyncMutex<HashSet<RunId>>,
    config: EngineConfig,
}

impl ExecutionController {
    pub fn new(
        config: EngineConfig,
        tenants: Arc<TenantManager>,
        registry: Arc<dyn ActionRegistry>,
        store: Arc<dyn PersistenceGateway>,
        notifier: Arc<dyn NotificationGateway>,
    ) -> Self {
        let queue = Arc::new(JobQueue::new(config.max_backoff()));
        let dispatcher = Arc::new(NodeDispatcher::new(
            registry,
            store.clone(),
            config.job_timeout(),
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            tenants,
            queue,
            dispatcher,
            store,
            metrics: Arc::new(MetricsCollector::new()),
            notifier,
            events_tx,
            events_rx: SyncMutex::new(Some(events_rx)),
            runs: RwLock::new(HashMap::new()),
            throttled: SyncMutex::new(HashSet::new()),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tenants(&self) -> &Arc<TenantManager> {
        &self.tenants
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Start the worker pool and the notification publisher.
    /// Workers exit once `shutdown` closes the queue.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        if let Some(mut rx) = self.events_rx.lock().take() {
            let notifier = self.notifier.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let run_id = event.run_id;
                    if let Err(e) = notifier.publish(event).await {
                        tracing::warn!(run_id = %run_id, "Failed to publish status change: {:#}", e);
                    }
                }
            });
        }

        let workers = self.config.worker_count.max(1);
        tracing::info!(workers, "Starting worker pool");

        (0..workers)
            .map(|worker_id| {
                let controller = self.clone();
                tokio::spawn(async move { controller.worker_loop(worker_id).await })
            })
            .collect()
    }

    /// Close the queue. Queued jobs stay persisted as pending nodes.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down execution controller");
        self.queue.close();
    }

    /// Register a tenant and create its queue partition
    pub fn provision_tenant(&self, tenant: Tenant) -> Result<()> {
        let cap = tenant
            .quota
            .max_in_flight_jobs
            .unwrap_or(self.config.tenant_in_flight_cap);
        let tenant_id = tenant.id.clone();

        self.tenants.register_tenant(tenant)?;
        self.queue.provision(&tenant_id, cap);
        Ok(())
    }

    /// Provision a tenant and record it so later processes know it too
    pub async fn create_tenant(&self, tenant: Tenant) -> Result<()> {
        if self.tenants.get_tenant(&tenant.id).is_some() {
            return Err(EngineError::TenantExists(tenant.id));
        }
        self.store.save_tenant(&tenant).await?;
        self.provision_tenant(tenant)
    }

    /// Suspend or reactivate a tenant. Suspension blocks new and resumed
    /// runs; work already queued keeps draining.
    pub async fn set_tenant_status(
        &self,
        tenant_id: &TenantId,
        status: TenantStatus,
    ) -> Result<Tenant> {
        match status {
            TenantStatus::Active => self.tenants.activate_tenant(tenant_id)?,
            TenantStatus::Suspended => self.tenants.suspend_tenant(tenant_id)?,
        }
        let tenant = self
            .tenants
            .get_tenant(tenant_id)
            .ok_or_else(|| EngineError::UnknownTenant(tenant_id.clone()))?;
        self.store.save_tenant(&tenant).await?;

        tracing::info!(tenant = %tenant_id, status = ?status, "Changed tenant status");
        Ok(tenant)
    }

    /// Provision the tenants recorded by earlier processes. Tenants that are
    /// already known keep their settings but take the recorded status.
    pub async fn restore_tenants(&self) -> Result<Vec<TenantId>> {
        let mut restored = Vec::new();
        for tenant in self.store.list_tenants().await? {
            if self.tenants.get_tenant(&tenant.id).is_some() {
                if tenant.status == TenantStatus::Suspended {
                    self.tenants.suspend_tenant(&tenant.id)?;
                }
                continue;
            }
            let tenant_id = tenant.id.clone();
            self.provision_tenant(tenant)?;
            restored.push(tenant_id);
        }

        if !restored.is_empty() {
            tracing::info!(count = restored.len(), "Restored tenants");
        }
        Ok(restored)
    }

    /// Validate and store a new version of a flow
    pub async fn save_flow(&self, flow: Flow) -> Result<Flow> {
        self.ensure_known(&flow.tenant_id)?;
        FlowGraph::from_flow(&flow)?;

        // The store rejects ids owned by another tenant in the same write
        let saved = self
            .store
            .save_flow(flow)
            .await
            .map_err(EngineError::from_gateway)?;
        tracing::info!(flow_id = %saved.id, version = saved.version, "Saved flow");
        Ok(saved)
    }

    /// Latest version of a tenant's flow
    pub async fn get_flow(&self, tenant_id: &TenantId, flow_id: &FlowId) -> Result<Flow> {
        self.ensure_known(tenant_id)?;
        match self.store.load_flow(flow_id).await? {
            Some(flow) if &flow.tenant_id == tenant_id => Ok(flow),
            _ => Err(EngineError::FlowNotFound(flow_id.clone())),
        }
    }

    /// Create and start a run of `flow`. A flow version the store does not
    /// hold is saved first so the run can be resumed and restarted later.
    pub async fn start(&self, flow: Flow) -> Result<FlowRun> {
        let stored = match flow.version {
            0 => None,
            version => self.store.load_flow_version(&flow.id, version).await?,
        };
        let flow = match stored {
            Some(stored) if stored.tenant_id == flow.tenant_id => stored,
            _ => self.save_flow(flow).await?,
        };
        self.launch(flow, None).await
    }

    /// Start a run of the latest version of a stored flow
    pub async fn start_run(&self, tenant_id: &TenantId, flow_id: &FlowId) -> Result<FlowRun> {
        let flow = self.get_flow(tenant_id, flow_id).await?;
        self.launch(flow, None).await
    }

    /// Start a fresh run of the same flow version as `run_id`
    pub async fn restart_run(&self, tenant_id: &TenantId, run_id: RunId) -> Result<FlowRun> {
        let previous = self.get_run_state(tenant_id, run_id).await?;
        let flow = self
            .store
            .load_flow_version(&previous.flow_id, previous.flow_version)
            .await?
            .ok_or_else(|| EngineError::FlowNotFound(previous.flow_id.clone()))?;

        self.launch(flow, Some(run_id)).await
    }

    async fn launch(&self, flow: Flow, restarted_from: Option<RunId>) -> Result<FlowRun> {
        let tenant_id = flow.tenant_id.clone();
        self.tenants.ensure_active(&tenant_id)?;

        let active_runs = self.active_run_count(&tenant_id).await;
        self.tenants
            .check_quota(&tenant_id, QuotaResource::ActiveRuns(active_runs + 1))?;

        let graph = Arc::new(FlowGraph::from_flow(&flow)?);
        let mut run = FlowRun::draft(&flow);
        run.restarted_from = restarted_from;
        self.store.create_run(&run).await?;

        let run_id = run.id;
        let active = Arc::new(ActiveRun {
            tenant_id: tenant_id.clone(),
            graph,
            cancel: CancellationToken::new(),
            state: Mutex::new(RunState::new(run)),
        });
        self.runs.write().await.insert(run_id, active.clone());

        tracing::info!(
            tenant = %tenant_id,
            run_id = %run_id,
            flow_id = %flow.id,
            version = flow.version,
            "Starting run"
        );

        let mut state = active.state.lock().await;
        let mut batch = Batch::default();
        batch.run(&mut state, RunStatus::Running)?;
        state.run.logs.push(match restarted_from {
            Some(previous) => LogEntry::info(format!("run started (restart of {})", previous)),
            None => LogEntry::info("run started"),
        });
        let result = self.advance(&active, &mut state, batch).await;
        let snapshot = state.run.clone();
        drop(state);

        if let Err(e) = result {
            self.fail_run(run_id, None, &e.to_string()).await;
            return Err(e);
        }
        Ok(snapshot)
    }

    /// Stop dispatching new nodes. In-flight jobs finish and are recorded.
    /// Pausing a paused run is a no-op.
    pub async fn pause_run(&self, tenant_id: &TenantId, run_id: RunId) -> Result<FlowRun> {
        self.ensure_known(tenant_id)?;

        let Some(active) = self.resident(tenant_id, run_id).await else {
            return self.pause_stored(tenant_id, run_id).await;
        };

        let mut state = active.state.lock().await;
        if state.control == RunControl::Paused {
            return Ok(state.run.clone());
        }

        let mut batch = Batch::default();
        batch.run(&mut state, RunStatus::Paused)?;
        state.control = RunControl::Paused;
        for node_id in in_flight_with(&state, NodeStatus::Running) {
            batch.node(&mut state, &node_id, NodeStatus::Paused)?;
        }
        state.run.logs.push(LogEntry::info("run paused"));
        tracing::info!(run_id = %run_id, "Paused run");

        self.commit(&active, &mut state, batch).await?;
        Ok(state.run.clone())
    }

    /// A run that is not resident has no jobs; only its status changes
    async fn pause_stored(&self, tenant_id: &TenantId, run_id: RunId) -> Result<FlowRun> {
        let run = self.load_owned_run(tenant_id, run_id).await?;
        if run.status == RunStatus::Paused {
            return Ok(run);
        }

        let mut state = RunState::new(run);
        state.set_run_status(RunStatus::Paused)?;
        state.run.logs.push(LogEntry::info("run paused"));
        self.store.save_run_state(&state.run).await?;
        self.emit(
            &state.run,
            vec![StatusChangeEvent::RunStatusChanged {
                status: RunStatus::Paused,
            }],
        );
        Ok(state.run)
    }

    /// Continue a paused run, or pick up a run left behind by a previous
    /// process. Resuming a running run is a no-op.
    pub async fn resume_run(&self, tenant_id: &TenantId, run_id: RunId) -> Result<FlowRun> {
        self.tenants.ensure_active(tenant_id)?;

        let active = match self.resident(tenant_id, run_id).await {
            Some(active) => active,
            None => self.rebuild(tenant_id, run_id).await?,
        };

        let mut state = active.state.lock().await;
        match state.control {
            RunControl::Active => return Ok(state.run.clone()),
            RunControl::Paused => {}
            RunControl::Stopped | RunControl::Faulted => {
                return Err(EngineError::invalid_transition(
                    state.run.status,
                    RunStatus::Running,
                ));
            }
        }

        let mut batch = Batch::default();
        batch.run(&mut state, RunStatus::Running)?;
        state.control = RunControl::Active;
        for node_id in in_flight_with(&state, NodeStatus::Paused) {
            batch.node(&mut state, &node_id, NodeStatus::Running)?;
        }
        state.run.logs.push(LogEntry::info("run resumed"));
        tracing::info!(run_id = %run_id, "Resumed run");

        self.advance(&active, &mut state, batch).await?;
        Ok(state.run.clone())
    }

    /// Load a stored run into memory, held paused until the caller resumes it.
    /// Nodes that were mid-dispatch when the owning process went away are
    /// reset to pending, or failed if they used up their attempts. Parked
    /// nodes keep waiting for their outcome; completed nodes are kept.
    async fn rebuild(&self, tenant_id: &TenantId, run_id: RunId) -> Result<Arc<ActiveRun>> {
        let run = self.load_owned_run(tenant_id, run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::invalid_transition(run.status, RunStatus::Running));
        }

        let flow = self
            .store
            .load_flow_version(&run.flow_id, run.flow_version)
            .await?
            .ok_or_else(|| EngineError::FlowNotFound(run.flow_id.clone()))?;
        let graph = Arc::new(FlowGraph::from_flow(&flow)?);

        let mut state = RunState::new(run);
        let orphaned: Vec<NodeId> = state
            .run
            .nodes
            .iter()
            .filter(|n| matches!(n.status, NodeStatus::Running | NodeStatus::Paused))
            .filter(|n| !n.parked)
            .map(|n| n.node_id.clone())
            .collect();
        for node_id in &orphaned {
            let used = state.run.node(node_id).map_or(0, |n| n.attempts);
            let allowed = graph
                .node(node_id)
                .map_or(1, |spec| self.retry_policy(spec).max_attempts);

            if used >= allowed {
                if let Some(node) = state.run.node_mut(node_id) {
                    node.error = Some(
                        EngineError::PermanentFailure(format!(
                            "retries exhausted after {} attempts: interrupted by restart",
                            used
                        ))
                        .to_string(),
                    );
                }
                state.set_node_status(node_id, NodeStatus::Failed)?;
            } else {
                state.set_node_status(node_id, NodeStatus::Pending)?;
            }
        }
        for node_id in state.parked_nodes() {
            state.set_node_status(&node_id, NodeStatus::Paused)?;
            state.in_flight.insert(node_id);
        }
        state.control = RunControl::Paused;

        if !orphaned.is_empty() {
            tracing::info!(run_id = %run_id, count = orphaned.len(), "Reset orphaned nodes");
        }

        let rebuilt = Arc::new(ActiveRun {
            tenant_id: tenant_id.clone(),
            graph,
            cancel: CancellationToken::new(),
            state: Mutex::new(state),
        });

        // Another caller may have rebuilt it concurrently
        let mut runs = self.runs.write().await;
        Ok(runs.entry(run_id).or_insert(rebuilt).clone())
    }

    /// Cancel a run: pending and waiting nodes are cancelled, queued jobs are
    /// dropped and running actions are signalled to stop.
    pub async fn stop_run(&self, tenant_id: &TenantId, run_id: RunId) -> Result<FlowRun> {
        self.ensure_known(tenant_id)?;

        let Some(active) = self.resident(tenant_id, run_id).await else {
            return self.stop_stored(tenant_id, run_id).await;
        };

        let mut state = active.state.lock().await;
        if state.run.status.is_terminal() {
            return Err(EngineError::invalid_transition(
                state.run.status,
                RunStatus::Cancelled,
            ));
        }
        let mut batch = Batch::default();
        batch.run(&mut state, RunStatus::Cancelled)?;
        state.control = RunControl::Stopped;
        active.cancel.cancel();

        for job in self.queue.purge_run(run_id) {
            state.in_flight.remove(&job.node_id);
            if !state.node_status(&job.node_id).map_or(true, NodeStatus::is_terminal) {
                batch.node(&mut state, &job.node_id, NodeStatus::Cancelled)?;
            }
        }
        // Nothing will report for parked nodes once the run is gone
        for node_id in state.parked_nodes() {
            state.in_flight.remove(&node_id);
            batch.node(&mut state, &node_id, NodeStatus::Cancelled)?;
        }
        let unstarted: Vec<NodeId> = state
            .run
            .nodes
            .iter()
            .filter(|n| n.status.is_unstarted())
            .map(|n| n.node_id.clone())
            .collect();
        for node_id in &unstarted {
            batch.node(&mut state, node_id, NodeStatus::Cancelled)?;
        }

        state.run.logs.push(LogEntry::warn("run stopped"));
        self.metrics
            .record_run_finished(&active.tenant_id, RunStatus::Cancelled);
        tracing::info!(run_id = %run_id, in_flight = state.in_flight.len(), "Stopped run");

        self.commit(&active, &mut state, batch).await?;
        Ok(state.run.clone())
    }

    async fn stop_stored(&self, tenant_id: &TenantId, run_id: RunId) -> Result<FlowRun> {
        let run = self.load_owned_run(tenant_id, run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::invalid_transition(run.status, RunStatus::Cancelled));
        }
        let mut state = RunState::new(run);
        let mut batch = Batch::default();
        batch.run(&mut state, RunStatus::Cancelled)?;

        let open: Vec<NodeId> = state
            .run
            .nodes
            .iter()
            .filter(|n| !n.status.is_terminal())
            .map(|n| n.node_id.clone())
            .collect();
        for node_id in &open {
            batch.node(&mut state, node_id, NodeStatus::Cancelled)?;
        }
        state.run.logs.push(LogEntry::warn("run stopped"));

        self.store.save_run_state(&state.run).await?;
        self.metrics
            .record_run_finished(&state.run.tenant_id, RunStatus::Cancelled);
        self.emit(&state.run, batch.events);
        Ok(state.run)
    }

    /// Apply an outcome reported from outside the engine to a parked node,
    /// then carry on with the run as if its job had just finished.
    pub async fn complete_node(
        &self,
        tenant_id: &TenantId,
        run_id: RunId,
        node_id: &NodeId,
        outcome: Outcome,
    ) -> Result<FlowRun> {
        self.ensure_known(tenant_id)?;

        let active = match self.resident(tenant_id, run_id).await {
            Some(active) => active,
            None => {
                // Left behind by a previous process: load it the way recovery would
                let stored = self.load_owned_run(tenant_id, run_id).await?;
                let rebuilt = self.rebuild(tenant_id, run_id).await?;
                if stored.status == RunStatus::Running {
                    self.resume_run(tenant_id, run_id).await?;
                }
                rebuilt
            }
        };

        let mut state = active.state.lock().await;
        let node = state
            .run
            .node(node_id)
            .ok_or_else(|| EngineError::InvalidFlow(format!("unknown node {}", node_id)))?;
        if !node.parked {
            return Err(EngineError::invalid_transition(node.status, "completed"));
        }

        let mut batch = Batch::default();
        state.in_flight.remove(node_id);
        if let Some(node) = state.run.node_mut(node_id) {
            node.logs
                .push(LogEntry::info("outcome reported externally").for_node(node_id));
        }
        let status = self.settle_node(&active, &mut state, &mut batch, node_id, outcome)?;
        tracing::info!(run_id = %run_id, node_id = %node_id, status = %status, "Completed parked node");

        self.advance(&active, &mut state, batch).await?;
        Ok(state.run.clone())
    }

    /// Current snapshot of a run owned by `tenant_id`
    pub async fn get_run_state(&self, tenant_id: &TenantId, run_id: RunId) -> Result<FlowRun> {
        self.ensure_known(tenant_id)?;
        if let Some(active) = self.resident(tenant_id, run_id).await {
            return Ok(active.state.lock().await.run.clone());
        }
        self.load_owned_run(tenant_id, run_id).await
    }

    /// A tenant's runs, newest first
    pub async fn list_runs(&self, tenant_id: &TenantId, filter: RunFilter) -> Result<Vec<FlowRun>> {
        self.ensure_known(tenant_id)?;
        let runs = self.store.list_runs(tenant_id).await?;
        Ok(runs.into_iter().filter(|r| filter.matches(r)).collect())
    }

    pub async fn run_stats(&self, tenant_id: &TenantId) -> Result<RunStats> {
        let runs = self.list_runs(tenant_id, RunFilter::All).await?;

        let mut stats = RunStats {
            total: runs.len(),
            ..RunStats::default()
        };
        for run in &runs {
            *stats.by_status.entry(run.status.to_string()).or_insert(0) += 1;
        }

        let finished: Vec<&FlowRun> = runs.iter().filter(|r| r.status.is_terminal()).collect();
        if !finished.is_empty() {
            let completed = finished
                .iter()
                .filter(|r| r.status == RunStatus::Completed)
                .count();
            stats.success_rate = completed as f64 / finished.len() as f64;
        }

        let durations: Vec<f64> = finished
            .iter()
            .filter_map(|r| r.duration())
            .map(|d| d.num_milliseconds() as f64)
            .collect();
        if !durations.is_empty() {
            stats.average_duration_ms = Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }

        Ok(stats)
    }

    /// Every node log line persisted for a run
    pub async fn run_logs(&self, tenant_id: &TenantId, run_id: RunId) -> Result<Vec<LogEntry>> {
        self.get_run_state(tenant_id, run_id).await?;
        Ok(self.store.run_logs(run_id).await?)
    }

    /// Remove a finished run and its logs
    pub async fn delete_run(&self, tenant_id: &TenantId, run_id: RunId) -> Result<()> {
        let run = self.get_run_state(tenant_id, run_id).await?;
        if !run.status.is_terminal() || self.runs.read().await.contains_key(&run_id) {
            return Err(EngineError::invalid_transition(run.status, "deleted"));
        }

        self.store.delete_run(run_id).await?;
        tracing::info!(run_id = %run_id, "Deleted run");
        Ok(())
    }

    /// Resume every run the store still lists as running for this tenant.
    /// Used at startup to pick up work from a previous process.
    pub async fn recover_tenant(&self, tenant_id: &TenantId) -> Result<Vec<RunId>> {
        let runs = self.list_runs(tenant_id, RunFilter::Status(RunStatus::Running)).await?;

        let mut recovered = Vec::new();
        for run in runs {
            if self.runs.read().await.contains_key(&run.id) {
                continue;
            }
            match self.resume_run(tenant_id, run.id).await {
                Ok(_) => recovered.push(run.id),
                Err(e) => tracing::warn!(run_id = %run.id, "Failed to recover run: {}", e),
            }
        }

        if !recovered.is_empty() {
            tracing::info!(tenant = %tenant_id, count = recovered.len(), "Recovered runs");
        }
        Ok(recovered)
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        tracing::debug!(worker_id, "Worker started");

        while let Some(job) = self.queue.dequeue().await {
            let controller = self.clone();
            let task_job = job.clone();
            let handle = tokio::spawn(async move { controller.process_job(task_job).await });

            let failure = match handle.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(format!("job task panicked: {}", e)),
            };

            if let Some(diagnostic) = failure {
                tracing::error!(
                    worker_id,
                    run_id = %job.run_id,
                    node_id = %job.node_id,
                    "Job processing failed: {}",
                    diagnostic
                );
                self.fail_run(job.run_id, Some(&job.node_id), &diagnostic).await;
                self.queue.release(&job);
            }
        }

        tracing::debug!(worker_id, "Worker stopped");
    }

    async fn process_job(self: Arc<Self>, job: Job) -> Result<()> {
        let Some(cancel) = self.begin_job(&job).await? else {
            return Ok(());
        };

        let report = self.dispatcher.dispatch(&job, cancel).await;
        self.metrics
            .record_dispatch(&job.tenant_id, &job.action, &report.outcome, report.duration);

        match self.queue.acknowledge(&job, &report.outcome) {
            Ack::Retry { attempt, delay } => self.note_retry(&job, attempt, delay, report).await?,
            Ack::Done(outcome) => self.complete_job(&job, report, outcome).await?,
        }

        self.drain_throttled().await;
        Ok(())
    }

    /// Mark the node running before dispatch. Returns `None` and releases
    /// the job when the run no longer wants it.
    async fn begin_job(&self, job: &Job) -> Result<Option<CancellationToken>> {
        let Some(active) = self.active(job.run_id).await else {
            self.queue.release(job);
            return Ok(None);
        };
        let mut state = active.state.lock().await;
        let mut batch = Batch::default();

        if state.control != RunControl::Active {
            // Released under the run lock: a resume may enqueue this node again
            self.queue.release(job);
        }

        match state.control {
            RunControl::Stopped | RunControl::Faulted => {
                state.in_flight.remove(&job.node_id);
                if !state.node_status(&job.node_id).map_or(true, NodeStatus::is_terminal) {
                    batch.node(&mut state, &job.node_id, NodeStatus::Cancelled)?;
                }
                self.commit(&active, &mut state, batch).await?;
                return Ok(None);
            }
            RunControl::Paused => {
                // Requeued on resume
                state.in_flight.remove(&job.node_id);
                if matches!(
                    state.node_status(&job.node_id),
                    Some(NodeStatus::Running | NodeStatus::Paused)
                ) {
                    batch.node(&mut state, &job.node_id, NodeStatus::Pending)?;
                }
                self.commit(&active, &mut state, batch).await?;
                return Ok(None);
            }
            RunControl::Active => {}
        }

        batch.node(&mut state, &job.node_id, NodeStatus::Running)?;
        if let Some(node) = state.run.node_mut(&job.node_id) {
            node.attempts = job.attempt;
        }
        self.commit(&active, &mut state, batch).await?;

        Ok(Some(active.cancel.child_token()))
    }

    async fn note_retry(
        &self,
        job: &Job,
        attempt: u32,
        delay: Duration,
        report: DispatchReport,
    ) -> Result<()> {
        let reason = match &report.outcome {
            Outcome::RetryableFailure { reason } => reason.clone(),
            other => format!("{:?}", other),
        };
        tracing::warn!(
            run_id = %job.run_id,
            node_id = %job.node_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retrying node: {}",
            reason
        );
        self.metrics.record_retry(&job.tenant_id, &job.action);

        let Some(active) = self.active(job.run_id).await else {
            return Ok(());
        };
        let mut state = active.state.lock().await;
        if let Some(node) = state.run.node_mut(&job.node_id) {
            node.logs.extend(report.logs);
            node.logs.push(
                LogEntry::warn(format!("retrying (attempt {}) in {}ms", attempt, delay.as_millis()))
                    .for_node(&job.node_id),
            );
        }

        let batch = Batch {
            events: vec![StatusChangeEvent::NodeRetrying {
                node_id: job.node_id.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                reason,
            }],
            jobs: Vec::new(),
        };
        self.commit(&active, &mut state, batch).await
    }

    async fn complete_job(&self, job: &Job, report: DispatchReport, outcome: Outcome) -> Result<()> {
        let Some(active) = self.active(job.run_id).await else {
            return Ok(());
        };
        let mut state = active.state.lock().await;
        let mut batch = Batch::default();

        let node = state
            .run
            .node_mut(&job.node_id)
            .ok_or_else(|| EngineError::InvalidFlow(format!("unknown node {}", job.node_id)))?;
        node.logs.extend(report.logs);

        let outcome = if report.parked {
            match state.control {
                RunControl::Active | RunControl::Paused => {
                    // Stays in flight until complete_node reports the outcome
                    if let Some(node) = state.run.node_mut(&job.node_id) {
                        node.parked = true;
                    }
                    tracing::debug!(run_id = %job.run_id, node_id = %job.node_id, "Node parked");
                    return self.commit(&active, &mut state, batch).await;
                }
                RunControl::Stopped | RunControl::Faulted => Outcome::Cancelled,
            }
        } else {
            outcome
        };

        state.in_flight.remove(&job.node_id);
        let status = self.settle_node(&active, &mut state, &mut batch, &job.node_id, outcome)?;

        tracing::debug!(
            run_id = %job.run_id,
            node_id = %job.node_id,
            status = %status,
            "Node finished"
        );

        self.advance(&active, &mut state, batch).await
    }

    /// Record a node's final outcome and return the status it moved to
    fn settle_node(
        &self,
        active: &ActiveRun,
        state: &mut RunState,
        batch: &mut Batch,
        node_id: &NodeId,
        outcome: Outcome,
    ) -> Result<NodeStatus> {
        let node = state
            .run
            .node_mut(node_id)
            .ok_or_else(|| EngineError::InvalidFlow(format!("unknown node {}", node_id)))?;

        let status = match outcome.into_result() {
            Ok(result) => {
                node.result = Some(result);
                NodeStatus::Completed
            }
            Err(EngineError::CancellationRequested) => NodeStatus::Cancelled,
            Err(e) => {
                node.error = Some(e.to_string());
                if let Some(spec) = active.graph.node(node_id) {
                    self.metrics.record_node_failure(&active.tenant_id, &spec.action);
                }
                NodeStatus::Failed
            }
        };
        batch.node(state, node_id, status)?;
        Ok(status)
    }

    /// Skip what can no longer run, enqueue what is ready and settle the
    /// run status, then commit.
    async fn advance(&self, active: &ActiveRun, state: &mut RunState, mut batch: Batch) -> Result<()> {
        if matches!(state.control, RunControl::Active | RunControl::Paused) {
            let evaluation = state.evaluate(&active.graph)?;
            for node_id in evaluation.skipped {
                batch.events.push(StatusChangeEvent::NodeStatusChanged {
                    node_id,
                    status: NodeStatus::Skipped,
                    error: None,
                });
            }
            for node_id in evaluation.waiting {
                batch.events.push(StatusChangeEvent::NodeStatusChanged {
                    node_id,
                    status: NodeStatus::Waiting,
                    error: None,
                });
            }

            if state.control == RunControl::Active {
                let budget = self
                    .config
                    .queue_budget(self.queue.tenant_depth(&active.tenant_id));
                if evaluation.ready.len() > budget {
                    tracing::debug!(
                        run_id = %state.run.id,
                        deferred = evaluation.ready.len() - budget,
                        "Queue above high watermark, deferring nodes"
                    );
                    self.throttled.lock().insert(state.run.id);
                }

                for node_id in evaluation.ready.into_iter().take(budget) {
                    let job = self.build_job(active, state, &node_id)?;
                    state.in_flight.insert(node_id);
                    batch.jobs.push(job);
                }
            }

            let derived = state.derive_status(&active.graph);
            if derived.is_terminal() {
                batch.run(state, derived)?;
                state
                    .run
                    .logs
                    .push(LogEntry::info(format!("run {}", derived)));
                self.metrics.record_run_finished(&active.tenant_id, derived);
                tracing::info!(run_id = %state.run.id, status = %derived, "Run finished");
            }
        }

        self.commit(active, state, batch).await
    }

    fn build_job(&self, active: &ActiveRun, state: &RunState, node_id: &NodeId) -> Result<Job> {
        let spec = active
            .graph
            .node(node_id)
            .ok_or_else(|| EngineError::InvalidFlow(format!("unknown node {}", node_id)))?;

        // A node sent back to pending by a pause keeps the attempts it used
        let attempt = state.run.node(node_id).map_or(0, |n| n.attempts) + 1;

        Ok(Job::new(
            active.tenant_id.clone(),
            state.run.id,
            node_id.clone(),
            spec.action.clone(),
            active.graph.resolve_input(node_id, &state.run),
            self.retry_policy(spec),
        )
        .with_attempt(attempt)
        .with_timeout(spec.timeout_secs.map(Duration::from_secs)))
    }

    fn retry_policy(&self, spec: &NodeSpec) -> RetryPolicy {
        match spec.retry {
            Some(mut policy) => {
                policy.max_attempts = policy.max_attempts.max(1);
                policy
            }
            None => self.config.default_retry_policy(),
        }
    }

    /// Persist the run, then enqueue and notify. Runs that are finished and
    /// have nothing in flight leave memory.
    async fn commit(&self, active: &ActiveRun, state: &mut RunState, batch: Batch) -> Result<()> {
        self.store.save_run_state(&state.run).await?;

        for job in batch.jobs {
            let node_id = job.node_id.clone();
            if let Err(e) = self.queue.enqueue(&active.tenant_id, job) {
                tracing::error!(run_id = %state.run.id, node_id = %node_id, "Failed to enqueue job: {}", e);
                state.in_flight.remove(&node_id);
            }
        }
        self.metrics.set_queue_depth(
            &active.tenant_id,
            self.queue.tenant_depth(&active.tenant_id),
        );

        self.emit(&state.run, batch.events);

        if state.run.status.is_terminal() && state.in_flight.is_empty() {
            self.runs.write().await.remove(&state.run.id);
            self.throttled.lock().remove(&state.run.id);
        }
        Ok(())
    }

    /// Re-advance runs whose expansion was deferred by the high watermark
    async fn drain_throttled(&self) {
        let pending: Vec<RunId> = self.throttled.lock().drain().collect();

        for run_id in pending {
            let Some(active) = self.active(run_id).await else {
                continue;
            };
            let result = {
                let mut state = active.state.lock().await;
                self.advance(&active, &mut state, Batch::default()).await
            };
            if let Err(e) = result {
                self.fail_run(run_id, None, &e.to_string()).await;
            }
        }
    }

    /// The engine could not apply a transition for this run: fail it and
    /// drop its queued work.
    async fn fail_run(&self, run_id: RunId, node_id: Option<&NodeId>, diagnostic: &str) {
        let Some(active) = self.active(run_id).await else {
            return;
        };
        let mut state = active.state.lock().await;
        let mut batch = Batch::default();

        state.control = RunControl::Faulted;
        active.cancel.cancel();
        for job in self.queue.purge_run(run_id) {
            state.in_flight.remove(&job.node_id);
        }
        for parked in state.parked_nodes() {
            state.in_flight.remove(&parked);
            let _ = batch.node(&mut state, &parked, NodeStatus::Cancelled);
        }

        if let Some(node_id) = node_id {
            state.in_flight.remove(node_id);
            if matches!(
                state.node_status(node_id),
                Some(NodeStatus::Running | NodeStatus::Paused)
            ) {
                if let Some(node) = state.run.node_mut(node_id) {
                    node.error = Some(diagnostic.to_string());
                }
                let _ = batch.node(&mut state, node_id, NodeStatus::Failed);
            }
        }

        if !state.run.status.is_terminal() && batch.run(&mut state, RunStatus::Failed).is_ok() {
            self.metrics
                .record_run_finished(&active.tenant_id, RunStatus::Failed);
        }
        state
            .run
            .logs
            .push(LogEntry::error(format!("engine failure: {}", diagnostic)));

        if let Err(e) = self.commit(&active, &mut state, batch).await {
            tracing::error!(run_id = %run_id, "Failed to persist faulted run: {}", e);
        }
    }

    fn emit(&self, run: &FlowRun, events: Vec<StatusChangeEvent>) {
        for event_type in events {
            // Receiver is gone only when the publisher task was never started
            let _ = self
                .events_tx
                .send(Event::new(run.id, run.tenant_id.clone(), event_type));
        }
    }

    async fn active(&self, run_id: RunId) -> Option<Arc<ActiveRun>> {
        self.runs.read().await.get(&run_id).cloned()
    }

    async fn resident(&self, tenant_id: &TenantId, run_id: RunId) -> Option<Arc<ActiveRun>> {
        self.active(run_id)
            .await
            .filter(|active| &active.tenant_id == tenant_id)
    }

    async fn load_owned_run(&self, tenant_id: &TenantId, run_id: RunId) -> Result<FlowRun> {
        match self.store.load_run(run_id).await? {
            Some(run) if &run.tenant_id == tenant_id => Ok(run),
            _ => Err(EngineError::RunNotFound(run_id)),
        }
    }

    async fn active_run_count(&self, tenant_id: &TenantId) -> u32 {
        let resident: Vec<Arc<ActiveRun>> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| &r.tenant_id == tenant_id)
            .cloned()
            .collect();

        let mut count = 0;
        for run in resident {
            if run.state.lock().await.run.status.is_active() {
                count += 1;
            }
        }
        count
    }

    fn ensure_known(&self, tenant_id: &TenantId) -> Result<()> {
        match self.tenants.get_tenant(tenant_id) {
            Some(_) => Ok(()),
            None => Err(EngineError::UnknownTenant(tenant_id.clone())),
        }
    }
}

fn in_flight_with(state: &RunState, status: NodeStatus) -> Vec<NodeId> {
    state
        .in_flight
        .iter()
        .filter(|id| state.node_status(id) == Some(status))
        .cloned()
        .collect()
}
