use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, Result};

/// Unique identifier for a tenant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tenant metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    #[serde(default = "default_status")]
    pub status: TenantStatus,
    #[serde(default)]
    pub quota: TenantQuota,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_status() -> TenantStatus {
    TenantStatus::Active
}

impl Tenant {
    pub fn new(id: TenantId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: TenantStatus::Active,
            quota: TenantQuota::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_quota(mut self, quota: TenantQuota) -> Self {
        self.quota = quota;
        self
    }
}

/// Tenant status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
}

/// Resource limits for a tenant
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantQuota {
    /// Maximum jobs dispatched at once; engine default when unset
    #[serde(default)]
    pub max_in_flight_jobs: Option<u32>,
    /// Maximum runs running or paused at once
    #[serde(default)]
    pub max_active_runs: Option<u32>,
}

/// Resource types for quota checking
pub enum QuotaResource {
    ActiveRuns(u32),
}

/// Registry of provisioned tenants
pub struct TenantManager {
    tenants: Arc<Mutex<HashMap<TenantId, Tenant>>>,
}

impl TenantManager {
    pub fn new() -> Self {
        Self {
            tenants: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a new tenant
    pub fn register_tenant(&self, tenant: Tenant) -> Result<()> {
        let mut tenants = self.tenants.lock();

        if tenants.contains_key(&tenant.id) {
            return Err(EngineError::TenantExists(tenant.id));
        }

        tracing::info!("Registered tenant: {}", tenant.id);
        tenants.insert(tenant.id.clone(), tenant);
        Ok(())
    }

    pub fn get_tenant(&self, tenant_id: &TenantId) -> Option<Tenant> {
        self.tenants.lock().get(tenant_id).cloned()
    }

    pub fn list_tenants(&self) -> Vec<Tenant> {
        let mut tenants: Vec<Tenant> = self.tenants.lock().values().cloned().collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        tenants
    }

    pub fn suspend_tenant(&self, tenant_id: &TenantId) -> Result<()> {
        self.set_status(tenant_id, TenantStatus::Suspended)
    }

    pub fn activate_tenant(&self, tenant_id: &TenantId) -> Result<()> {
        self.set_status(tenant_id, TenantStatus::Active)
    }

    fn set_status(&self, tenant_id: &TenantId, status: TenantStatus) -> Result<()> {
        let mut tenants = self.tenants.lock();
        let tenant = tenants
            .get_mut(tenant_id)
            .ok_or_else(|| EngineError::UnknownTenant(tenant_id.clone()))?;

        tenant.status = status;
        tenant.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_active(&self, tenant_id: &TenantId) -> bool {
        self.tenants
            .lock()
            .get(tenant_id)
            .map(|t| t.status == TenantStatus::Active)
            .unwrap_or(false)
    }

    /// Fails with `UnknownTenant` or `TenantSuspended` unless the tenant may start work
    pub fn ensure_active(&self, tenant_id: &TenantId) -> Result<()> {
        match self.tenants.lock().get(tenant_id) {
            None => Err(EngineError::UnknownTenant(tenant_id.clone())),
            Some(t) if t.status == TenantStatus::Suspended => {
                Err(EngineError::TenantSuspended(tenant_id.clone()))
            }
            Some(_) => Ok(()),
        }
    }

    /// Validate tenant quota
    pub fn check_quota(&self, tenant_id: &TenantId, resource: QuotaResource) -> Result<()> {
        let tenants = self.tenants.lock();
        let tenant = tenants
            .get(tenant_id)
            .ok_or_else(|| EngineError::UnknownTenant(tenant_id.clone()))?;

        match resource {
            QuotaResource::ActiveRuns(count) => {
                if let Some(max) = tenant.quota.max_active_runs {
                    if count > max {
                        return Err(EngineError::QuotaExceeded(format!(
                            "tenant {} allows at most {} active runs",
                            tenant_id, max
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

impl Default for TenantManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_tenant() -> Tenant {
        Tenant::new(TenantId::new("test_tenant"), "Test Tenant")
    }

    #[test]
    fn test_register_tenant() {
        let manager = TenantManager::new();
        let tenant = create_test_tenant();

        manager.register_tenant(tenant.clone()).unwrap();

        let retrieved = manager.get_tenant(&tenant.id).unwrap();
        assert_eq!(retrieved.id, tenant.id);
        assert_eq!(retrieved.name, tenant.name);
    }

    #[test]
    fn test_duplicate_tenant() {
        let manager = TenantManager::new();
        let tenant = create_test_tenant();

        manager.register_tenant(tenant.clone()).unwrap();
        let result = manager.register_tenant(tenant);

        assert!(matches!(result, Err(EngineError::TenantExists(_))));
    }

    #[test]
    fn test_suspend_activate_tenant() {
        let manager = TenantManager::new();
        let tenant = create_test_tenant();

        manager.register_tenant(tenant.clone()).unwrap();
        assert!(manager.is_active(&tenant.id));

        manager.suspend_tenant(&tenant.id).unwrap();
        assert!(!manager.is_active(&tenant.id));
        assert!(matches!(
            manager.ensure_active(&tenant.id),
            Err(EngineError::TenantSuspended(_))
        ));

        manager.activate_tenant(&tenant.id).unwrap();
        assert!(manager.ensure_active(&tenant.id).is_ok());
    }

    #[test]
    fn test_unknown_tenant() {
        let manager = TenantManager::new();
        let missing = TenantId::new("missing");

        assert!(matches!(
            manager.ensure_active(&missing),
            Err(EngineError::UnknownTenant(_))
        ));
        assert!(manager.suspend_tenant(&missing).is_err());
    }

    #[test]
    fn test_quota_check() {
        let manager = TenantManager::new();
        let tenant = create_test_tenant().with_quota(TenantQuota {
            max_in_flight_jobs: None,
            max_active_runs: Some(2),
        });

        manager.register_tenant(tenant.clone()).unwrap();

        manager
            .check_quota(&tenant.id, QuotaResource::ActiveRuns(2))
            .unwrap();

        let result = manager.check_quota(&tenant.id, QuotaResource::ActiveRuns(3));
        assert!(matches!(result, Err(EngineError::QuotaExceeded(_))));
    }
}
