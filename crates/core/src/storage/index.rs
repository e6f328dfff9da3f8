use anyhow::{bail, Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{check_flow_owner, PersistenceGateway};
use crate::tenant::{Tenant, TenantId};
use crate::types::{Flow, FlowId, FlowRun, LogEntry, NodeId, RunId};

const FLOWS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("flows");
const RUNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");
const NODE_LOGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("node_logs");
const TENANTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tenants");

/// Flow and run store backed by an embedded redb database
#[derive(Clone)]
pub struct RedbRunStore {
    db: Arc<Database>,
    log_seq: Arc<AtomicU64>,
}

/// Keys sharing `prefix/` sort between `prefix/` and `prefix0`
fn prefix_bounds(prefix: &str) -> (String, String) {
    (format!("{}/", prefix), format!("{}0", prefix))
}

fn flow_key(flow_id: &FlowId, version: u32) -> String {
    format!("{}/{:010}", flow_id, version)
}

/// Sorted by timestamp, ties broken by append order
fn log_key(run_id: RunId, entry: &LogEntry, seq: u64) -> String {
    format!(
        "{}/{:020}/{:020}",
        run_id,
        entry.timestamp.timestamp_nanos_opt().unwrap_or_default(),
        seq
    )
}

impl RedbRunStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create index directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _flows_table = write_txn
                .open_table(FLOWS_TABLE)
                .context("Failed to open flows table")?;
            let _runs_table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open runs table")?;
            let _logs_table = write_txn
                .open_table(NODE_LOGS_TABLE)
                .context("Failed to open node logs table")?;
            let _tenants_table = write_txn
                .open_table(TENANTS_TABLE)
                .context("Failed to open tenants table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self {
            db: Arc::new(db),
            log_seq: Arc::new(AtomicU64::new(0)),
        })
    }

    fn flow_versions(&self, flow_id: &FlowId) -> Result<Vec<Flow>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(FLOWS_TABLE)
            .context("Failed to open table")?;

        let (start, end) = prefix_bounds(&flow_id.0);
        let mut flows = Vec::new();
        for item in table
            .range(start.as_str()..end.as_str())
            .context("Failed to iterate flows")?
        {
            let (_key, value) = item.context("Failed to read item")?;
            let flow: Flow =
                serde_json::from_slice(value.value()).context("Failed to deserialize flow")?;
            // Ids containing '/' can share a prefix with this one
            if &flow.id == flow_id {
                flows.push(flow);
            }
        }

        Ok(flows)
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<FlowRun>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let key = run_id.to_string();
        let value = table.get(key.as_str()).context("Failed to get run")?;

        match value {
            Some(guard) => {
                let run: FlowRun =
                    serde_json::from_slice(guard.value()).context("Failed to deserialize run")?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    fn put_run(&self, run: &FlowRun, must_be_new: bool) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open table")?;

            let key = run.id.to_string();
            if must_be_new && table.get(key.as_str()).context("Failed to get run")?.is_some() {
                bail!("Run {} already exists", run.id);
            }

            let value = serde_json::to_vec(run).context("Failed to serialize run")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert run")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl PersistenceGateway for RedbRunStore {
    async fn load_flow(&self, flow_id: &FlowId) -> Result<Option<Flow>> {
        Ok(self.flow_versions(flow_id)?.into_iter().max_by_key(|f| f.version))
    }

    async fn load_flow_version(&self, flow_id: &FlowId, version: u32) -> Result<Option<Flow>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(FLOWS_TABLE)
            .context("Failed to open table")?;

        let key = flow_key(flow_id, version);
        match table.get(key.as_str()).context("Failed to get flow")? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).context("Failed to deserialize flow")?,
            )),
            None => Ok(None),
        }
    }

    async fn save_flow(&self, mut flow: Flow) -> Result<Flow> {
        let (start, end) = prefix_bounds(&flow.id.0);

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(FLOWS_TABLE)
                .context("Failed to open table")?;

            let mut latest = 0;
            for item in table
                .range(start.as_str()..end.as_str())
                .context("Failed to iterate flows")?
            {
                let (_key, value) = item.context("Failed to read item")?;
                let stored: Flow = serde_json::from_slice(value.value())
                    .context("Failed to deserialize flow")?;
                if stored.id == flow.id {
                    check_flow_owner(&stored, &flow)?;
                    latest = latest.max(stored.version);
                }
            }

            flow.version = latest + 1;
            let key = flow_key(&flow.id, flow.version);
            let value = serde_json::to_vec(&flow).context("Failed to serialize flow")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert flow")?;
        }
        write_txn.commit().context("Failed to commit")?;

        Ok(flow)
    }

    async fn create_run(&self, run: &FlowRun) -> Result<()> {
        self.put_run(run, true)
    }

    async fn save_run_state(&self, run: &FlowRun) -> Result<()> {
        self.put_run(run, false)
    }

    async fn load_run(&self, run_id: RunId) -> Result<Option<FlowRun>> {
        self.get_run(run_id)
    }

    async fn list_runs(&self, tenant_id: &TenantId) -> Result<Vec<FlowRun>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let mut runs = Vec::new();
        for item in table.iter().context("Failed to iterate runs")? {
            let (_key, value) = item.context("Failed to read item")?;
            let run: FlowRun =
                serde_json::from_slice(value.value()).context("Failed to deserialize run")?;
            if &run.tenant_id == tenant_id {
                runs.push(run);
            }
        }

        // Most recent first
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(runs)
    }

    async fn delete_run(&self, run_id: RunId) -> Result<bool> {
        let (start, end) = prefix_bounds(&run_id.to_string());

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let existed = {
            let mut runs = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open table")?;
            let key = run_id.to_string();
            let existed = runs
                .remove(key.as_str())
                .context("Failed to delete run")?
                .is_some();

            let mut logs = write_txn
                .open_table(NODE_LOGS_TABLE)
                .context("Failed to open table")?;
            let mut keys = Vec::new();
            for item in logs
                .range(start.as_str()..end.as_str())
                .context("Failed to iterate logs")?
            {
                let (key, _value) = item.context("Failed to read item")?;
                keys.push(key.value().to_string());
            }
            for key in keys {
                logs.remove(key.as_str()).context("Failed to delete log")?;
            }

            existed
        };
        write_txn.commit().context("Failed to commit")?;

        Ok(existed)
    }

    async fn append_log(&self, run_id: RunId, node_id: &NodeId, entry: &LogEntry) -> Result<()> {
        let entry = entry.clone().for_node(node_id);

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(NODE_LOGS_TABLE)
                .context("Failed to open table")?;

            let key = log_key(run_id, &entry, self.log_seq.fetch_add(1, Ordering::Relaxed));
            let value = serde_json::to_vec(&entry).context("Failed to serialize log entry")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert log entry")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    async fn run_logs(&self, run_id: RunId) -> Result<Vec<LogEntry>> {
        let (start, end) = prefix_bounds(&run_id.to_string());

        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(NODE_LOGS_TABLE)
            .context("Failed to open table")?;

        let mut entries = Vec::new();
        for item in table
            .range(start.as_str()..end.as_str())
            .context("Failed to iterate logs")?
        {
            let (_key, value) = item.context("Failed to read item")?;
            let entry: LogEntry =
                serde_json::from_slice(value.value()).context("Failed to deserialize log entry")?;
            entries.push(entry);
        }

        Ok(entries)
    }

    async fn save_tenant(&self, tenant: &Tenant) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(TENANTS_TABLE)
                .context("Failed to open table")?;

            let value = serde_json::to_vec(tenant).context("Failed to serialize tenant")?;
            table
                .insert(tenant.id.0.as_str(), value.as_slice())
                .context("Failed to insert tenant")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(TENANTS_TABLE)
            .context("Failed to open table")?;

        let mut tenants = Vec::new();
        for item in table.iter().context("Failed to iterate tenants")? {
            let (_key, value) = item.context("Failed to read item")?;
            let tenant: Tenant =
                serde_json::from_slice(value.value()).context("Failed to deserialize tenant")?;
            tenants.push(tenant);
        }

        Ok(tenants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionRef, NodeSpec, NodeStatus, RunStatus};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn flow(id: &str) -> Flow {
        Flow {
            id: FlowId::new(id),
            tenant_id: TenantId::new("acme"),
            version: 0,
            name: id.to_string(),
            nodes: vec![NodeSpec {
                id: NodeId::new("a"),
                name: None,
                action: ActionRef::new("core.echo"),
                config: serde_json::json!({ "greeting": "hi" }),
                inputs: BTreeMap::new(),
                timeout_secs: Some(5),
                retry: None,
            }],
            edges: vec![],
            created_at: chrono::Utc::now(),
        }
    }

    fn store() -> (TempDir, RedbRunStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = RedbRunStore::new(temp_dir.path().join("index.redb")).unwrap();
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_flow_versions() {
        let (_dir, store) = store();

        assert_eq!(store.save_flow(flow("f")).await.unwrap().version, 1);
        assert_eq!(store.save_flow(flow("f")).await.unwrap().version, 2);
        assert_eq!(store.save_flow(flow("f/sub")).await.unwrap().version, 1);

        let latest = store.load_flow(&FlowId::new("f")).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.nodes[0].timeout_secs, Some(5));

        let v1 = store
            .load_flow_version(&FlowId::new("f"), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v1.version, 1);
        assert!(store
            .load_flow_version(&FlowId::new("f"), 9)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_run_round_trip() {
        let (_dir, store) = store();
        let mut run = FlowRun::draft(&flow("f"));

        store.create_run(&run).await.unwrap();
        assert!(store.create_run(&run).await.is_err());

        run.status = RunStatus::Running;
        run.nodes[0].status = NodeStatus::Completed;
        run.nodes[0].result = Some(serde_json::json!({ "ok": true }));
        store.save_run_state(&run).await.unwrap();

        let loaded = store.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.nodes[0].status, NodeStatus::Completed);
        assert_eq!(loaded.nodes[0].result, Some(serde_json::json!({ "ok": true })));

        let runs = store.list_runs(&TenantId::new("acme")).await.unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_logs_and_delete() {
        let (_dir, store) = store();
        let run = FlowRun::draft(&flow("f"));
        let other = FlowRun::draft(&flow("f"));
        store.create_run(&run).await.unwrap();
        store.create_run(&other).await.unwrap();

        let node = NodeId::new("a");
        store.append_log(run.id, &node, &LogEntry::info("first")).await.unwrap();
        store.append_log(run.id, &node, &LogEntry::warn("second")).await.unwrap();
        store.append_log(other.id, &node, &LogEntry::info("other")).await.unwrap();

        let logs = store.run_logs(run.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "first");
        assert_eq!(logs[1].message, "second");
        assert_eq!(logs[0].node_id, Some(node.clone()));

        assert!(store.delete_run(run.id).await.unwrap());
        assert!(store.load_run(run.id).await.unwrap().is_none());
        assert!(store.run_logs(run.id).await.unwrap().is_empty());
        assert_eq!(store.run_logs(other.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.redb");
        let run = FlowRun::draft(&flow("f"));

        {
            let store = RedbRunStore::new(path.clone()).unwrap();
            store.create_run(&run).await.unwrap();
        }

        let store = RedbRunStore::new(path).unwrap();
        assert!(store.load_run(run.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_foreign_flow_id_rejected() {
        let (_dir, store) = store();
        store.save_flow(flow("f")).await.unwrap();

        let mut foreign = flow("f");
        foreign.tenant_id = TenantId::new("globex");
        let err = store.save_flow(foreign).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::EngineError>(),
            Some(crate::error::EngineError::InvalidFlow(_))
        ));

        // The rejected write left nothing behind
        let latest = store.load_flow(&FlowId::new("f")).await.unwrap().unwrap();
        assert_eq!(latest.version, 1);
        assert_eq!(latest.tenant_id, TenantId::new("acme"));
    }

    #[tokio::test]
    async fn test_tenants_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.redb");

        {
            let store = RedbRunStore::new(path.clone()).unwrap();
            let mut tenant = Tenant::new(TenantId::new("acme"), "Acme");
            store.save_tenant(&tenant).await.unwrap();
            tenant.name = "Acme Corp".to_string();
            store.save_tenant(&tenant).await.unwrap();
        }

        let store = RedbRunStore::new(path).unwrap();
        let tenants = store.list_tenants().await.unwrap();
        assert_eq!(tenants.len(), 1);
        assert_eq!(tenants[0].name, "Acme Corp");
    }
}
