#![allow(dead_code)]

use async_trait::async_trait;
use fleetssh::errors::ToolError;
use fleetssh::services::fleet::{HostLease, HostSource};
use fleetssh::services::host::Host;
use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::Mutex;

pub static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serves every machine name from one fixed host.
pub struct StaticHostSource {
    host: Arc<dyn Host>,
}

impl StaticHostSource {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl HostSource for StaticHostSource {
    async fn acquire(&self, _machine: &str) -> Result<HostLease, ToolError> {
        Ok(HostLease::unpooled(self.host.clone()))
    }
}
