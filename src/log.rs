use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Started,
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct JournalEntry {
    pub timestamp: String,
    pub run_id: String,
    pub node: String,
    pub operation: String,
    pub status: OperationStatus,
    pub error: Option<String>,
}

/// Append-only JSONL record of tracked operations, one run id per invocation
pub struct OperationJournal {
    path: PathBuf,
    run_id: String,
}

impl OperationJournal {
    pub fn new(path: &Path) -> Self {
        OperationJournal {
            path: path.to_path_buf(),
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn record(
        &self,
        node: &str,
        operation: &str,
        status: OperationStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.add_entry(JournalEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: self.run_id.clone(),
            node: node.to_string(),
            operation: operation.to_string(),
            status,
            error,
        })
    }

    fn add_entry(&self, entry: JournalEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open operation journal")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_entries(&self) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file =
            File::open(&self.path).context("Failed to open operation journal for reading")?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn entries_share_the_run_id() {
        let tmp = TempDir::new().unwrap();
        let journal = OperationJournal::new(&tmp.path().join("journal.jsonl"));
        journal
            .record("web01", "Copying a.bin", OperationStatus::Started, None)
            .unwrap();
        journal
            .record(
                "web01",
                "Copying a.bin",
                OperationStatus::Failed,
                Some("disk full".into()),
            )
            .unwrap();

        let entries = journal.read_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.run_id == journal.run_id()));
        assert_eq!(entries[1].status, OperationStatus::Failed);
        assert_eq!(entries[1].error.as_deref(), Some("disk full"));
    }

    #[test]
    fn missing_journal_reads_empty() {
        let tmp = TempDir::new().unwrap();
        let journal = OperationJournal::new(&tmp.path().join("none.jsonl"));
        assert!(journal.read_entries().unwrap().is_empty());
    }
}
