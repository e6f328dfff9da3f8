use anyhow::{Context, Result};
use flowrun_core::actions::InMemoryActionRegistry;
use flowrun_core::events::BroadcastNotifier;
use flowrun_core::storage::RedbRunStore;
use flowrun_core::tenant::{Tenant, TenantId, TenantManager, TenantQuota};
use flowrun_core::workflow::ExecutionController;
use flowrun_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Tenants provisioned at startup
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_index_file() -> String {
    "flowrun.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_file: default_index_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub id: String,
    pub name: Option<String>,
    #[serde(flatten)]
    pub quota: TenantQuota,
}

impl TenantConfig {
    pub fn to_tenant(&self) -> Tenant {
        let name = self.name.clone().unwrap_or_else(|| self.id.clone());
        Tenant::new(TenantId::new(self.id.clone()), name).with_quota(self.quota.clone())
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the run store path
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ExecutionController>,
    pub notifier: Arc<BroadcastNotifier>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let store = Arc::new(
            RedbRunStore::new(config.index_path()).context("Failed to create run store")?,
        );
        let notifier = Arc::new(BroadcastNotifier::default());
        let registry = Arc::new(InMemoryActionRegistry::with_builtins());

        let controller = Arc::new(ExecutionController::new(
            config.engine.clone(),
            Arc::new(TenantManager::new()),
            registry,
            store,
            notifier.clone(),
        ));

        for tenant in &config.tenants {
            controller
                .provision_tenant(tenant.to_tenant())
                .with_context(|| format!("Failed to provision tenant {}", tenant.id))?;
        }

        Ok(Self {
            controller,
            notifier,
        })
    }
}
