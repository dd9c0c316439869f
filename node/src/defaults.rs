//! Fallback values for optional configuration fields.

pub const LOG_LEVEL: &str = "info";
pub const CONSUMER_WORKERS: usize = 4;
pub const CONSUMER_BUFFER_SIZE: usize = 1_024;
pub const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const POSTGRES_MAX_IDLE_CONNECTIONS: usize = 8;
