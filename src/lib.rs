pub mod app;
pub mod constants;
pub mod errors;

pub mod managers {
    pub mod exec;
    pub mod fleet;
    pub mod jobs;
    pub mod transfer;
}

pub mod services {
    pub mod config;
    pub mod fleet;
    pub mod guard;
    pub mod host;
    pub mod inventory;
    pub mod jobs;
    pub mod local_host;
    pub mod logger;
    pub mod machine;
    pub mod pool;
    pub mod retention;
    pub mod ssh_host;
    pub mod tool_executor;
    pub mod transfer;
}

pub mod stores {
    pub mod inventory_store;
    pub mod pending_store;
    pub mod session_store;
}

pub mod utils {
    pub mod concurrency;
    pub mod fs_atomic;
    pub mod paths;
    pub mod shell;
    pub mod text;
    pub mod tool_errors;
    pub mod user_paths;
}
