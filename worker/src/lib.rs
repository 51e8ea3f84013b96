pub mod http_store;
pub mod worker;

pub use http_store::{HttpStoreClient, HttpStoreConnector};
pub use worker::{ExportError, TaskExporter, DEFAULT_BATCH_SIZE, PAGE_LIMIT};
