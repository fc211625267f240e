//! Payload classification
//!
//! The engine only needs a handful of signals out of each response: the
//! listed item ids, whether the server said "no results", the next-page
//! affordance, and for details whether the text is truncated. Which fields
//! carry those signals depends on the API, so classification sits behind the
//! [`PayloadClassifier`] trait. [`JsonPointerClassifier`] reads them with
//! JSON pointers taken from the mode configuration.

use crate::config::PayloadConfig;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// A response body that could not be classified
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("Body is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Missing field at '{0}'")]
    Missing(String),

    #[error("Unexpected value at '{pointer}': expected {expected}")]
    Shape {
        pointer: String,
        expected: &'static str,
    },
}

/// One entry of a listing page
#[derive(Debug, Clone, PartialEq)]
pub struct ListedItem {
    pub id: String,

    /// The item has nested replies to paginate
    pub nested: bool,

    pub raw: Value,
}

/// Signals read from a listing page
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListingPage {
    /// The server explicitly reported no results
    pub no_results: bool,

    pub items: Vec<ListedItem>,

    /// Next page URL, token, or cursor
    pub next_page: Option<String>,
}

impl ListingPage {
    /// No result blocks, without an explicit "no results" marker
    pub fn is_empty_page(&self) -> bool {
        !self.no_results && self.items.is_empty()
    }

    pub fn item_ids(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.id.as_str())
    }
}

/// Signals read from a detail response
#[derive(Debug, Clone, PartialEq)]
pub struct DetailPage {
    pub record: Value,

    /// The record's text is truncated and needs a long-text fetch
    pub long_text_pending: bool,
}

/// Reads engine signals out of response bodies
pub trait PayloadClassifier: fmt::Debug + Send + Sync {
    fn classify_listing(&self, body: &[u8]) -> Result<ListingPage, ClassifyError>;

    fn classify_detail(&self, body: &[u8]) -> Result<DetailPage, ClassifyError>;

    /// Full text from a long-text response, if the server had any
    fn extract_long_text(&self, body: &[u8]) -> Result<Option<String>, ClassifyError>;
}

/// Classifier driven by the JSON pointers of a mode's `payload` table
#[derive(Debug, Clone)]
pub struct JsonPointerClassifier {
    payload: PayloadConfig,
}

impl JsonPointerClassifier {
    pub fn new(payload: PayloadConfig) -> Self {
        Self { payload }
    }
}

impl Default for JsonPointerClassifier {
    fn default() -> Self {
        Self::new(PayloadConfig::default())
    }
}

impl PayloadClassifier for JsonPointerClassifier {
    fn classify_listing(&self, body: &[u8]) -> Result<ListingPage, ClassifyError> {
        let document: Value = serde_json::from_slice(body)?;

        let no_results = self
            .payload
            .no_results
            .as_deref()
            .map_or(false, |pointer| is_truthy(document.pointer(pointer)));

        let items = match document.pointer(&self.payload.items) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(entries)) => entries
                .iter()
                .filter_map(|entry| self.listed_item(entry))
                .collect(),
            Some(_) => {
                return Err(ClassifyError::Shape {
                    pointer: self.payload.items.clone(),
                    expected: "an array of items",
                })
            }
        };

        let next_page = self
            .payload
            .next_page
            .as_deref()
            .and_then(|pointer| affordance(document.pointer(pointer)));

        Ok(ListingPage {
            no_results,
            items,
            next_page,
        })
    }

    fn classify_detail(&self, body: &[u8]) -> Result<DetailPage, ClassifyError> {
        let document: Value = serde_json::from_slice(body)?;
        let pointer = self.payload.record.as_deref().unwrap_or("");

        let record = match document.pointer(pointer) {
            None | Some(Value::Null) => return Err(ClassifyError::Missing(pointer.to_string())),
            Some(record) => record.clone(),
        };

        let long_text_pending = self
            .payload
            .long_text_flag
            .as_deref()
            .map_or(false, |flag| is_truthy(record.pointer(flag)));

        Ok(DetailPage {
            record,
            long_text_pending,
        })
    }

    fn extract_long_text(&self, body: &[u8]) -> Result<Option<String>, ClassifyError> {
        let document: Value = serde_json::from_slice(body)?;
        match document.pointer(&self.payload.long_text_content) {
            Some(Value::String(text)) if !text.is_empty() => Ok(Some(text.clone())),
            Some(Value::String(_)) | Some(Value::Null) | None => Ok(None),
            Some(_) => Err(ClassifyError::Shape {
                pointer: self.payload.long_text_content.clone(),
                expected: "a string",
            }),
        }
    }
}

impl JsonPointerClassifier {
    fn listed_item(&self, entry: &Value) -> Option<ListedItem> {
        let id = match entry.pointer(&self.payload.item_id)? {
            Value::String(id) if !id.is_empty() => id.clone(),
            Value::Number(id) => id.to_string(),
            _ => return None,
        };

        let nested = self
            .payload
            .nested
            .as_deref()
            .map_or(false, |pointer| is_truthy(entry.pointer(pointer)));

        Some(ListedItem {
            id,
            nested,
            raw: entry.clone(),
        })
    }
}

/// JSON truthiness: null, false, 0, "" and empty containers are false
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(n)) => n.as_f64().map_or(false, |n| n != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(entries)) => !entries.is_empty(),
        Some(Value::Object(fields)) => !fields.is_empty(),
    }
}

/// A next-page affordance; null, "", 0 and false mean there is none
fn affordance(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64().map_or(false, |n| n != 0.0) => Some(n.to_string()),
        Value::Bool(true) => Some("true".to_string()),
        _ => None,
    }
}
