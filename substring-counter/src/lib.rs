pub mod types;
pub mod counter;
pub mod source;
pub mod pool;
pub mod orchestrator;
pub mod config;
pub mod shutdown;

pub use types::*;
pub use counter::{count, SubstringCounter, DEFAULT_BUFFER_SIZE};
pub use source::{Source, SourceKind, SourceLoader};
pub use pool::{consume, CountJob, ResultStream, WorkerPool};
pub use orchestrator::{calculate_total, run};
pub use config::Settings;
pub use shutdown::cancel_on_signal;
