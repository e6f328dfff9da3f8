pub mod index;
pub mod memory;

pub use index::RedbRunStore;
pub use memory::MemoryStore;

use anyhow::Result;

use crate::tenant::{Tenant, TenantId};
use crate::types::{Flow, FlowId, FlowRun, LogEntry, NodeId, RunId};

/// Durable home of flows, runs and node logs. Every call is atomic.
#[async_trait::async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Latest version of a flow
    async fn load_flow(&self, flow_id: &FlowId) -> Result<Option<Flow>>;

    async fn load_flow_version(&self, flow_id: &FlowId, version: u32) -> Result<Option<Flow>>;

    /// Store `flow` as the next version of its id and return the stored copy.
    /// Fails with `EngineError::InvalidFlow` if the id is owned by another tenant.
    async fn save_flow(&self, flow: Flow) -> Result<Flow>;

    /// Insert a new run; fails if the id is taken
    async fn create_run(&self, run: &FlowRun) -> Result<()>;

    /// Overwrite the stored snapshot of a run
    async fn save_run_state(&self, run: &FlowRun) -> Result<()>;

    async fn load_run(&self, run_id: RunId) -> Result<Option<FlowRun>>;

    /// Runs of a tenant, newest first
    async fn list_runs(&self, tenant_id: &TenantId) -> Result<Vec<FlowRun>>;

    /// Remove a run and its logs. Returns false if it did not exist.
    async fn delete_run(&self, run_id: RunId) -> Result<bool>;

    async fn append_log(&self, run_id: RunId, node_id: &NodeId, entry: &LogEntry) -> Result<()>;

    /// Every log line appended for a run, oldest first
    async fn run_logs(&self, run_id: RunId) -> Result<Vec<LogEntry>>;

    /// Insert or replace a tenant record
    async fn save_tenant(&self, tenant: &Tenant) -> Result<()>;

    async fn list_tenants(&self) -> Result<Vec<Tenant>>;
}

/// Rejects a new version of a flow id already owned by another tenant
fn check_flow_owner(stored: &Flow, flow: &Flow) -> Result<()> {
    if stored.tenant_id != flow.tenant_id {
        return Err(crate::error::EngineError::InvalidFlow(format!(
            "flow id {} belongs to another tenant",
            flow.id
        ))
        .into());
    }
    Ok(())
}
