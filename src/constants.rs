pub mod network {
    pub const SSH_DEFAULT_PORT: u16 = 22;
    pub const TIMEOUT_SSH_READY_MS: u64 = 10_000;
    pub const KEEPALIVE_INTERVAL_SECS: u32 = 30;
    pub const POLL_IDLE_SLEEP_MS: u64 = 20;
}

pub mod limits {
    pub const MAX_CONNECTIONS: usize = 10;
    pub const MAX_CONNECTIONS_CEILING: usize = 500;
    pub const IDLE_TTL_SECS: u64 = 300;
    pub const IDLE_TTL_CEILING_SECS: u64 = 3_600;
    pub const DEFAULT_CAPTURE_BYTES: usize = 64 * 1024;
    pub const PREVIEW_PATH_LIMIT: usize = 10_001;
    pub const PREVIEW_SAMPLE: usize = 10;
    pub const CONFLICT_SAMPLE: usize = 20;
    pub const TAIL_MAX_LINES: u64 = 2_000;
    pub const GREP_DEFAULT_MATCHES: u64 = 50;
    pub const GREP_MAX_MATCHES: u64 = 500;
    pub const GREP_DEFAULT_CONTEXT: u64 = 2;
    pub const GREP_MAX_CONTEXT: u64 = 50;
    pub const GREP_MAX_OUTPUT_LINES: usize = 10_000;
    pub const GREP_MAX_OUTPUT_BYTES: usize = 64 * 1024;
    pub const SLEEP_MAX_MS: u64 = 60_000;
}

pub mod transfer {
    pub const COPY_WORKERS: usize = 4;
    pub const CONFLICT_CHECK_WORKERS: usize = 16;
}

pub mod jobs {
    pub const SCREEN_PREFIX: &str = "fleetssh";
    pub const REMOTE_RUNS_DIR: &str = ".fleetssh/runs";
    pub const PID_POLL_ATTEMPTS: u32 = 5;
    pub const LOCAL_PID_POLL_ATTEMPTS: u32 = 20;
    pub const LOCAL_PID_POLL_MS: u64 = 50;
}

pub mod maintenance {
    pub const RETENTION_DAYS: u32 = 7;
    pub const RETENTION_DAYS_CEILING: u32 = 365;
    pub const PENDING_TTL_SECS: u64 = 86_400;
    pub const POOL_SWEEP_CEILING_SECS: u64 = 60;
    pub const RETENTION_SWEEP_SECS: u64 = 3_600;
}
