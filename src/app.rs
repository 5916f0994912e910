use crate::errors::ToolError;
use crate::managers;
use crate::services::config::FleetConfig;
use crate::services::fleet::{Fleet, HostSource};
use crate::services::guard::{RuleSet, SecurityGuard};
use crate::services::host::CaptureLimits;
use crate::services::jobs::JobSupervisor;
use crate::services::logger::Logger;
use crate::services::machine::MachineResolver;
use crate::services::pool::{ConnectionPool, PoolLimits};
use crate::services::retention::RetentionSweeper;
use crate::services::ssh_host::{SshHost, SshSessionFactory};
use crate::services::tool_executor::{ToolExecutor, ToolHandler};
use crate::services::transfer::{TransferRuntime, TransferService};
use crate::stores::inventory_store::InventoryStore;
use crate::stores::pending_store::PendingStore;
use crate::stores::session_store::SessionStore;
use crate::utils::paths::StateLayout;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

const TOOLS: &[&str] = &["exec", "fleet", "jobs", "transfer"];

pub struct App {
    pub logger: Logger,
    pub config: FleetConfig,
    pub layout: StateLayout,
    pub pool: Arc<ConnectionPool<SshHost>>,
    pub retention: Arc<RetentionSweeper>,
    pub tool_executor: Arc<ToolExecutor>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl App {
    fn validate_tool_wiring(handlers: &BTreeMap<String, Arc<dyn ToolHandler>>) -> Result<(), ToolError> {
        let missing: Vec<&str> = TOOLS
            .iter()
            .copied()
            .filter(|tool| !handlers.contains_key(*tool))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(ToolError::internal("Tool wiring is incomplete")
            .with_details(serde_json::json!({ "missing_tools": missing })))
    }

    pub fn initialize() -> Result<Self, ToolError> {
        Self::initialize_with(StateLayout::from_env())
    }

    pub fn initialize_with(layout: StateLayout) -> Result<Self, ToolError> {
        let logger = Logger::new("fleetssh");
        let config = FleetConfig::load(&layout)?;

        let resolver = MachineResolver::new(config.machines.clone());
        let factory = Arc::new(SshSessionFactory::new(logger.clone(), resolver));
        let pool = Arc::new(ConnectionPool::new(
            logger.clone(),
            PoolLimits {
                max_entries: config.max_connections,
                idle_ttl: config.idle_ttl(),
            },
            factory,
        ));
        let hosts: Arc<dyn HostSource> =
            Arc::new(Fleet::new(pool.clone(), config.local_machine.clone()));

        let sessions = SessionStore::new(layout.sessions_dir());
        let pending = PendingStore::new(layout.pending_dir(), config.pending_ttl());
        let rules = RuleSet::from_config(&config.security, Some(&logger));
        let guard = Arc::new(SecurityGuard::new(logger.clone(), rules, pending.clone()));
        let transfers = Arc::new(TransferRuntime::new());

        let supervisor = Arc::new(JobSupervisor::new(
            logger.clone(),
            hosts.clone(),
            sessions.clone(),
            layout.clone(),
            transfers.clone(),
        ));
        let transfer_service = Arc::new(TransferService::new(
            logger.clone(),
            hosts.clone(),
            sessions.clone(),
            pending.clone(),
            layout.clone(),
            transfers,
        ));
        let retention = Arc::new(RetentionSweeper::new(
            logger.clone(),
            hosts.clone(),
            sessions,
            pending,
            config.retention(),
        ));

        let exec_manager = Arc::new(managers::exec::ExecManager::new(
            logger.clone(),
            hosts.clone(),
            guard.clone(),
            CaptureLimits::new(config.max_stdout_bytes, config.max_stderr_bytes),
        ));
        let mut machine_names: Vec<String> = config.machines.keys().cloned().collect();
        if !config.machines.contains_key(&config.local_machine) {
            machine_names.push(config.local_machine.clone());
        }
        let fleet_manager = Arc::new(managers::fleet::FleetManager::new(
            logger.clone(),
            hosts.clone(),
            InventoryStore::new(layout.inventory_path()),
            machine_names,
        ));
        let job_manager = Arc::new(managers::jobs::JobManager::new(
            logger.clone(),
            hosts,
            guard,
            supervisor,
        ));
        let transfer_manager = Arc::new(managers::transfer::TransferManager::new(
            logger.clone(),
            transfer_service,
        ));

        let mut handlers: BTreeMap<String, Arc<dyn ToolHandler>> = BTreeMap::new();
        handlers.insert("exec".to_string(), exec_manager);
        handlers.insert("fleet".to_string(), fleet_manager);
        handlers.insert("jobs".to_string(), job_manager);
        handlers.insert("transfer".to_string(), transfer_manager);
        Self::validate_tool_wiring(&handlers)?;

        let tool_executor = Arc::new(ToolExecutor::new(logger.clone(), handlers));
        logger.info(
            "initialized",
            Some(&serde_json::json!({
                "base": layout.base(),
                "max_connections": config.max_connections,
                "idle_ttl_seconds": config.idle_ttl_seconds,
                "retention_days": config.retention_days,
                "machines": config.machines.len(),
            })),
        );

        Ok(Self {
            logger,
            config,
            layout,
            pool,
            retention,
            tool_executor,
            background: Mutex::new(Vec::new()),
        })
    }

    pub async fn call(&self, tool: &str, args: Value) -> Result<Value, ToolError> {
        self.tool_executor.execute(tool, args).await
    }

    /// Spawns the idle-connection sweep and the retention sweep. Must be
    /// called from within a tokio runtime.
    pub fn start_background(&self) {
        let mut tasks = self.background.lock().unwrap_or_else(|err| err.into_inner());
        if !tasks.is_empty() {
            return;
        }

        tasks.push(self.pool.spawn_sweeper(self.config.pool_sweep_interval()));

        let retention = self.retention.clone();
        let logger = self.logger.child("background");
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                crate::constants::maintenance::RETENTION_SWEEP_SECS,
            ));
            loop {
                ticker.tick().await;
                if let Err(err) = retention.sweep(chrono::Utc::now()).await {
                    logger.warn(
                        "retention sweep failed",
                        Some(&serde_json::json!({ "error": err.message })),
                    );
                }
            }
        }));
    }

    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.pool.shutdown().await;
        self.logger.info("shutdown complete", None);
    }
}
