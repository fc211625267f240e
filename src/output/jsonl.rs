//! JSON Lines and in-memory item sinks

use crate::output::traits::{HarvestedItem, ItemSink, OutputError, OutputResult};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Serialize)]
struct HarvestLine<'a> {
    seed: &'a str,
    crawl_time: i64,
    record: &'a Value,
}

/// Appends one JSON object per item to a file
///
/// A crawl of a single seed writes `{mode}_{seed}.jsonl`; anything else writes
/// `{mode}_{YYYYMMDDHHMMSS}.jsonl`.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
}

impl JsonlSink {
    pub fn create(directory: &Path, mode: &str, seeds: &[String]) -> OutputResult<Self> {
        std::fs::create_dir_all(directory)?;
        let path = directory.join(output_file_name(mode, seeds));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        tracing::info!(path = %path.display(), "Writing harvested items");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl ItemSink for JsonlSink {
    fn accept(&mut self, item: HarvestedItem) -> OutputResult<()> {
        let line = HarvestLine {
            seed: &item.seed,
            crawl_time: Utc::now().timestamp(),
            record: &item.record,
        };
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    fn flush(&mut self) -> OutputResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Builds the output file name for a crawl
pub fn output_file_name(mode: &str, seeds: &[String]) -> String {
    match seeds {
        [seed] => format!("{}_{}.jsonl", mode, sanitize(seed)),
        _ => format!("{}_{}.jsonl", mode, Utc::now().format("%Y%m%d%H%M%S")),
    }
}

fn sanitize(seed: &str) -> String {
    seed.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Collects items in memory; clones share the same buffer
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    items: Arc<Mutex<Vec<HarvestedItem>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything accepted so far
    pub fn items(&self) -> Vec<HarvestedItem> {
        self.items
            .lock()
            .map(|items| items.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ItemSink for MemorySink {
    fn accept(&mut self, item: HarvestedItem) -> OutputResult<()> {
        self.items
            .lock()
            .map_err(|_| OutputError::Write("memory sink poisoned".to_string()))?
            .push(item);
        Ok(())
    }

    fn flush(&mut self) -> OutputResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_output_file_name() {
        assert_eq!(
            output_file_name("comment", &["Nc1X/9".to_string()]),
            "comment_Nc1X_9.jsonl"
        );

        let many = output_file_name("keyword", &["a".to_string(), "b".to_string()]);
        assert!(many.starts_with("keyword_"));
        assert_eq!(many.len(), "keyword_".len() + 14 + ".jsonl".len());
    }

    #[test]
    fn test_jsonl_sink_writes_lines() {
        let dir = TempDir::new().unwrap();
        let mut sink = JsonlSink::create(dir.path(), "detail", &["42".to_string()]).unwrap();

        sink.accept(HarvestedItem::new("42", json!({"id": "42", "text": "hi"})))
            .unwrap();
        sink.accept(HarvestedItem::new("42", json!({"id": "43"}))).unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.written(), 2);

        let content = std::fs::read_to_string(dir.path().join("detail_42.jsonl")).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["seed"], "42");
        assert_eq!(lines[0]["record"]["text"], "hi");
        assert!(lines[0]["crawl_time"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_memory_sink_shares_buffer() {
        let sink = MemorySink::new();
        let mut handle = sink.clone();
        handle.accept(HarvestedItem::new("s", json!(1))).unwrap();

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.items()[0].seed, "s");
    }
}
