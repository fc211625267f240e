//! Seed id loading
//!
//! A seed file holds one seed per line, either a bare id or a JSON object
//! exported by an earlier crawl.

use crate::HarvestError;
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Pointers tried, in order, when no seed field is given for a JSON line
pub const FALLBACK_SEED_POINTERS: [&str; 3] = ["/mblogid", "/user/_id", "/_id"];

/// Reads seed ids from a file
pub fn load_seeds(path: &Path, pointer: Option<&str>) -> Result<Vec<String>, HarvestError> {
    let content = fs::read_to_string(path)?;
    parse_seeds(&content, pointer)
}

/// Parses seed ids, one per non-blank line
pub fn parse_seeds(content: &str, pointer: Option<&str>) -> Result<Vec<String>, HarvestError> {
    content
        .lines()
        .enumerate()
        .map(|(number, line)| (number + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty())
        .map(|(number, line)| parse_seed_line(line, pointer).map_err(|e| {
            HarvestError::Seed(format!("line {}: {}", number, e))
        }))
        .collect()
}

fn parse_seed_line(line: &str, pointer: Option<&str>) -> Result<String, String> {
    if !line.starts_with('{') {
        return Ok(line.to_string());
    }

    let document: Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
    let candidates: Vec<&str> = match pointer {
        Some(pointer) => vec![pointer],
        None => FALLBACK_SEED_POINTERS.to_vec(),
    };

    candidates
        .iter()
        .find_map(|pointer| match document.pointer(pointer) {
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        })
        .ok_or_else(|| format!("no seed id at {}", candidates.join(", ")))
}
