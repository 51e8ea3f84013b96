pub mod config;
pub mod filter;
pub mod filter_engine;
pub mod progress;
pub mod query;
pub mod run;
pub mod store;
pub mod task;
pub mod time_chunk;
pub mod writer;

pub use config::{ConfigError, ConnectionConfig, ExportConfig, OutputConfig, Schema, TaskSource};
pub use filter::{ChunkBy, Filter, FilterError, FilterOperator, TimeRangeFilter};
pub use filter_engine::FilterEngine;
pub use progress::{CheckpointStore, FileCheckpointStore, Progress, ProgressError, ProgressSummary};
pub use query::QueryBuilder;
pub use run::{RunId, RunStatus, RunSummary};
pub use store::{MemoryStore, PkValue, PrimaryKey, RangePage, RangeRequest, Row, StoreClient, StoreConnector, StoreError};
pub use task::{TaskDefinition, TaskId, TaskLoadError, TaskLoader, TaskMap, TaskResult};
pub use time_chunk::{TimeChunk, TimeChunker};
pub use writer::{CsvWriter, WriteMode, WriterError};
