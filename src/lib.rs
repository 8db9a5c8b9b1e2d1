// Library module for testable functions

pub mod ingestion;

pub use ingestion::archive::{SizeGatedArchiver, Uploader, WebhookUploader};
pub use ingestion::catalog::{BdcClient, RemoteSource};
pub use ingestion::pipeline::{Pipeline, PipelineConfig, RetryPolicy};
pub use ingestion::schema::TableName;
pub use ingestion::write::{LoadStrategy, PgTableStore, TableStore};
