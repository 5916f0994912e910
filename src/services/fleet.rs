use crate::errors::ToolError;
use crate::services::host::Host;
use crate::services::local_host::LocalHost;
use crate::services::pool::{ConnectionPool, Lease};
use crate::services::ssh_host::SshHost;
use async_trait::async_trait;
use std::sync::Arc;

/// Temporary use of a machine. Remote leases go back to the pool on
/// `release` or drop, whichever comes first.
pub struct HostLease {
    host: Arc<dyn Host>,
    warnings: Vec<String>,
    lease: Option<Lease<SshHost>>,
}

impl HostLease {
    pub fn unpooled(host: Arc<dyn Host>) -> Self {
        Self {
            host,
            warnings: Vec::new(),
            lease: None,
        }
    }

    pub fn pooled(lease: Lease<SshHost>) -> Self {
        let session = lease.session().clone();
        let warnings = session.warnings().to_vec();
        Self {
            host: session,
            warnings,
            lease: Some(lease),
        }
    }

    pub fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }

    pub fn shared_host(&self) -> Arc<dyn Host> {
        self.host.clone()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn release(&mut self) {
        if let Some(lease) = self.lease.as_mut() {
            lease.release();
        }
    }
}

#[async_trait]
pub trait HostSource: Send + Sync {
    async fn acquire(&self, machine: &str) -> Result<HostLease, ToolError>;
}

pub struct Fleet {
    pool: Arc<ConnectionPool<SshHost>>,
    local: Arc<LocalHost>,
    local_machine: String,
}

impl Fleet {
    pub fn new(pool: Arc<ConnectionPool<SshHost>>, local_machine: impl Into<String>) -> Self {
        let local_machine = local_machine.into();
        Self {
            pool,
            local: Arc::new(LocalHost::new(local_machine.clone())),
            local_machine,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<SshHost>> {
        &self.pool
    }
}

#[async_trait]
impl HostSource for Fleet {
    async fn acquire(&self, machine: &str) -> Result<HostLease, ToolError> {
        let machine = machine.trim();
        if machine.is_empty() {
            return Err(ToolError::invalid_params("machine must be a non-empty string"));
        }
        if machine == self.local_machine {
            return Ok(HostLease::unpooled(self.local.clone()));
        }
        let lease = self.pool.acquire(machine).await?;
        Ok(HostLease::pooled(lease))
    }
}
