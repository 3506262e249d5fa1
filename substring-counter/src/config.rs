use crate::counter::DEFAULT_BUFFER_SIZE;
use crate::types::*;
use clap::Parser;
use std::time::Duration;

/// Command line and environment settings. Every flag falls back to its
/// environment variable, then to the built-in default.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "substring-counter",
    version,
    about = "Counts a substring in files and web pages listed on stdin, one origin per line"
)]
pub struct Settings {
    /// Upper bound on concurrently running workers
    #[arg(long, env = "MAX_NUMBER_OF_WORKERS", default_value_t = DEFAULT_MAX_WORKERS)]
    pub max_workers: usize,

    /// Byte sequence to count
    #[arg(long, env = "SUBSTRING", default_value = DEFAULT_SUBSTRING)]
    pub substring: String,

    /// Bound on a single HTTP load attempt
    #[arg(long, env = "URL_REQUEST_TIMEOUT_MILLISECONDS", default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
    pub request_timeout_ms: u64,

    /// Idle time after which a worker exits
    #[arg(long, env = "WORKER_SHUTDOWN_TIMEOUT_MILLISECONDS", default_value_t = DEFAULT_WORKER_IDLE_TIMEOUT_MS)]
    pub worker_idle_timeout_ms: u64,

    #[arg(long, env = "TASK_QUEUE_CAPACITY", default_value_t = DEFAULT_TASK_QUEUE_CAPACITY)]
    pub task_queue_capacity: usize,

    #[arg(long, env = "RESULT_QUEUE_CAPACITY", default_value_t = DEFAULT_RESULT_QUEUE_CAPACITY)]
    pub result_queue_capacity: usize,

    /// Read buffer size per worker, in bytes
    #[arg(long, env = "READ_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// HTTP load attempts per URL before giving up
    #[arg(long, env = "URL_LOAD_ATTEMPTS", default_value_t = DEFAULT_LOAD_ATTEMPTS)]
    pub load_attempts: u32,

    /// How long to wait for in-flight results after a shutdown signal
    #[arg(long, env = "SHUTDOWN_GRACE_MILLISECONDS", default_value_t = DEFAULT_SHUTDOWN_GRACE_MS)]
    pub shutdown_grace_ms: u64,
}

impl Settings {
    pub fn into_config(self) -> Result<CounterConfig> {
        let config = CounterConfig {
            max_workers: self.max_workers,
            substring: self.substring.into_bytes(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            worker_idle_timeout: Duration::from_millis(self.worker_idle_timeout_ms),
            task_queue_capacity: self.task_queue_capacity,
            result_queue_capacity: self.result_queue_capacity,
            buffer_size: self.buffer_size,
            load_attempts: self.load_attempts,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        };
        config.validate()?;
        Ok(config)
    }
}
