//! Record output.
//!
//! Accepted [`ArticleRecord`]s leave the crawler through a [`RecordSink`].
//!
//! # Submodules
//!
//! - [`json`]: appends records as JSON Lines, one file per site and day
//!
//! # Output Structure
//!
//! ```text
//! output_dir/
//! └── 2019-11-21/
//!     ├── golem.jsonl
//!     ├── sz.jsonl
//!     └── postillon.jsonl
//! ```

pub mod json;

use crate::models::ArticleRecord;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to write record: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Destination of accepted records. A record is durable once `emit` returns `Ok`.
pub trait RecordSink {
    async fn emit(&self, record: ArticleRecord) -> Result<(), OutputError>;
}
