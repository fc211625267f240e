//! Item sink trait and associated types
//!
//! Harvested records leave the engine through an [`ItemSink`]. The engine
//! does not interpret records beyond attaching the seed they came from.

use serde_json::Value;
use thiserror::Error;

/// Errors that can occur while writing harvested items
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Failed to write output: {0}")]
    Write(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// One record produced by a crawl mode
#[derive(Debug, Clone, PartialEq)]
pub struct HarvestedItem {
    /// The seed id the record descends from
    pub seed: String,

    pub record: Value,
}

impl HarvestedItem {
    pub fn new(seed: impl Into<String>, record: Value) -> Self {
        Self {
            seed: seed.into(),
            record,
        }
    }
}

/// Destination for harvested items
pub trait ItemSink: Send {
    /// Accepts one item
    fn accept(&mut self, item: HarvestedItem) -> OutputResult<()>;

    /// Flushes buffered items; called once when the crawl ends
    fn flush(&mut self) -> OutputResult<()>;
}
