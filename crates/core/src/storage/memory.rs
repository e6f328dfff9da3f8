use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::{check_flow_owner, PersistenceGateway};
use crate::tenant::{Tenant, TenantId};
use crate::types::{Flow, FlowId, FlowRun, LogEntry, NodeId, RunId};

#[derive(Default)]
struct Tables {
    flows: HashMap<FlowId, BTreeMap<u32, Flow>>,
    runs: HashMap<RunId, FlowRun>,
    logs: HashMap<RunId, Vec<LogEntry>>,
    tenants: BTreeMap<TenantId, Tenant>,
}

/// In-memory persistence gateway for tests and ephemeral deployments
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PersistenceGateway for MemoryStore {
    async fn load_flow(&self, flow_id: &FlowId) -> Result<Option<Flow>> {
        let tables = self.tables.lock();
        Ok(tables
            .flows
            .get(flow_id)
            .and_then(|versions| versions.values().next_back().cloned()))
    }

    async fn load_flow_version(&self, flow_id: &FlowId, version: u32) -> Result<Option<Flow>> {
        let tables = self.tables.lock();
        Ok(tables
            .flows
            .get(flow_id)
            .and_then(|versions| versions.get(&version).cloned()))
    }

    async fn save_flow(&self, mut flow: Flow) -> Result<Flow> {
        let mut tables = self.tables.lock();
        let versions = tables.flows.entry(flow.id.clone()).or_default();
        if let Some(stored) = versions.values().next_back() {
            check_flow_owner(stored, &flow)?;
        }
        flow.version = versions.keys().next_back().map_or(1, |v| v + 1);
        versions.insert(flow.version, flow.clone());
        Ok(flow)
    }

    async fn create_run(&self, run: &FlowRun) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.runs.contains_key(&run.id) {
            bail!("Run {} already exists", run.id);
        }
        tables.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn save_run_state(&self, run: &FlowRun) -> Result<()> {
        self.tables.lock().runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: RunId) -> Result<Option<FlowRun>> {
        Ok(self.tables.lock().runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, tenant_id: &TenantId) -> Result<Vec<FlowRun>> {
        let mut runs: Vec<FlowRun> = self
            .tables
            .lock()
            .runs
            .values()
            .filter(|r| &r.tenant_id == tenant_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn delete_run(&self, run_id: RunId) -> Result<bool> {
        let mut tables = self.tables.lock();
        tables.logs.remove(&run_id);
        Ok(tables.runs.remove(&run_id).is_some())
    }

    async fn append_log(&self, run_id: RunId, node_id: &NodeId, entry: &LogEntry) -> Result<()> {
        let entry = entry.clone().for_node(node_id);
        self.tables.lock().logs.entry(run_id).or_default().push(entry);
        Ok(())
    }

    async fn run_logs(&self, run_id: RunId) -> Result<Vec<LogEntry>> {
        Ok(self
            .tables
            .lock()
            .logs
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_tenant(&self, tenant: &Tenant) -> Result<()> {
        self.tables
            .lock()
            .tenants
            .insert(tenant.id.clone(), tenant.clone());
        Ok(())
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        Ok(self.tables.lock().tenants.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunStatus;

    fn flow(id: &str) -> Flow {
        Flow {
            id: FlowId::new(id),
            tenant_id: TenantId::new("acme"),
            version: 0,
            name: id.to_string(),
            nodes: vec![],
            edges: vec![],
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_flow_versions() {
        let store = MemoryStore::new();

        let v1 = store.save_flow(flow("onboarding")).await.unwrap();
        let v2 = store.save_flow(flow("onboarding")).await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        let latest = store.load_flow(&FlowId::new("onboarding")).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert!(store
            .load_flow_version(&FlowId::new("onboarding"), 1)
            .await
            .unwrap()
            .is_some());
        assert!(store.load_flow(&FlowId::new("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flow_id_owned_by_one_tenant() {
        let store = MemoryStore::new();
        store.save_flow(flow("billing")).await.unwrap();

        let mut foreign = flow("billing");
        foreign.tenant_id = TenantId::new("globex");
        let err = store.save_flow(foreign).await.unwrap_err();
        assert!(err.to_string().contains("belongs to another tenant"));

        let latest = store.load_flow(&FlowId::new("billing")).await.unwrap().unwrap();
        assert_eq!(latest.tenant_id, TenantId::new("acme"));
        assert_eq!(latest.version, 1);
    }

    #[tokio::test]
    async fn test_tenants() {
        let store = MemoryStore::new();
        store
            .save_tenant(&Tenant::new(TenantId::new("globex"), "Globex"))
            .await
            .unwrap();
        store
            .save_tenant(&Tenant::new(TenantId::new("acme"), "Acme"))
            .await
            .unwrap();

        let ids: Vec<_> = store
            .list_tenants()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id.0)
            .collect();
        assert_eq!(ids, vec!["acme", "globex"]);
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let store = MemoryStore::new();
        let mut run = FlowRun::draft(&flow("f"));

        store.create_run(&run).await.unwrap();
        assert!(store.create_run(&run).await.is_err());

        run.status = RunStatus::Running;
        store.save_run_state(&run).await.unwrap();
        let loaded = store.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);

        store
            .append_log(run.id, &NodeId::new("a"), &LogEntry::info("hello"))
            .await
            .unwrap();
        let logs = store.run_logs(run.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].node_id, Some(NodeId::new("a")));

        assert_eq!(store.list_runs(&TenantId::new("acme")).await.unwrap().len(), 1);
        assert!(store.list_runs(&TenantId::new("other")).await.unwrap().is_empty());

        assert!(store.delete_run(run.id).await.unwrap());
        assert!(!store.delete_run(run.id).await.unwrap());
        assert!(store.run_logs(run.id).await.unwrap().is_empty());
    }
}
