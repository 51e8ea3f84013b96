pub mod monitor;
pub mod scheduler;
pub mod state;

pub use scheduler::{EngineError, ExportOptions, Exporter, DEFAULT_THREADS};
pub use state::{EngineState, RunCounters};
