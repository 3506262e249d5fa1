use num_bigint::BigUint;
use std::time::Duration;

use crate::counter::DEFAULT_BUFFER_SIZE;

pub const DEFAULT_MAX_WORKERS: usize = 5;
pub const DEFAULT_SUBSTRING: &str = "Go";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_WORKER_IDLE_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_TASK_QUEUE_CAPACITY: usize = 1;
pub const DEFAULT_RESULT_QUEUE_CAPACITY: usize = 16;
pub const DEFAULT_LOAD_ATTEMPTS: u32 = 10;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct CounterConfig {
    pub max_workers: usize,
    pub substring: Vec<u8>,
    pub request_timeout: Duration,
    pub worker_idle_timeout: Duration,
    pub task_queue_capacity: usize,
    pub result_queue_capacity: usize,
    pub buffer_size: usize,
    pub load_attempts: u32,
    pub shutdown_grace: Duration,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            substring: DEFAULT_SUBSTRING.as_bytes().to_vec(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            worker_idle_timeout: Duration::from_millis(DEFAULT_WORKER_IDLE_TIMEOUT_MS),
            task_queue_capacity: DEFAULT_TASK_QUEUE_CAPACITY,
            result_queue_capacity: DEFAULT_RESULT_QUEUE_CAPACITY,
            buffer_size: DEFAULT_BUFFER_SIZE,
            load_attempts: DEFAULT_LOAD_ATTEMPTS,
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }
}

impl CounterConfig {
    /// Rejects values the pool and loader can't run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(CounterError::InvalidConfig("max workers must be above zero".to_string()));
        }
        if self.substring.is_empty() {
            return Err(CounterError::InvalidConfig("substring must not be empty".to_string()));
        }
        if self.task_queue_capacity == 0 || self.result_queue_capacity == 0 {
            return Err(CounterError::InvalidConfig("queue capacities must be above zero".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(CounterError::InvalidConfig("read buffer size must be above zero".to_string()));
        }
        if self.load_attempts == 0 {
            return Err(CounterError::InvalidConfig("load attempts must be above zero".to_string()));
        }
        if self.request_timeout.is_zero() || self.worker_idle_timeout.is_zero() {
            return Err(CounterError::InvalidConfig("timeouts must be above zero".to_string()));
        }
        Ok(())
    }
}

/// Outcome of processing one origin. Exactly one is produced per dispatched task.
#[derive(Debug)]
pub struct CountResult {
    pub origin: String,
    pub subtotal: BigUint,
    pub error: Option<CounterError>,
}

impl CountResult {
    pub fn success(origin: String, subtotal: BigUint) -> Self {
        Self {
            origin,
            subtotal,
            error: None,
        }
    }

    pub fn failure(origin: String, error: CounterError) -> Self {
        Self {
            origin,
            subtotal: BigUint::default(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("empty origin")]
    EmptyOrigin,

    #[error("unknown source: {origin}")]
    UnknownSource { origin: String },

    #[error("can't load source data from origin {origin}: {source}")]
    LoadFailure {
        origin: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("worker panicked: {0}")]
    WorkerPanic(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, CounterError>;
