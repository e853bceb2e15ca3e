// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Filesystem-based ledger implementation
//!
//! Stores one JSON-lines file per run and captured task output under `logs/`:
//!
//! ```text
//! <dir>/<run-id>.jsonl
//! <dir>/logs/<run-id>/<task>.<attempt>.log
//! ```

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{Ledger, LedgerEntry, LedgerEvent};
use crate::errors::PipeflowError;
use crate::run::RunId;

/// Filesystem-based ledger
pub struct FileLedger {
    dir: PathBuf,
    /// Next sequence number per run; also serializes appends
    next_seq: Mutex<HashMap<RunId, u64>>,
}

impl FileLedger {
    /// Open (creating if needed) a ledger directory
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PipeflowError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            PipeflowError::ledger(format!(
                "Failed to create ledger directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        Ok(Self {
            dir,
            next_seq: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn run_path(&self, run_id: RunId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", run_id))
    }

    async fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>, PipeflowError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PipeflowError::ledger(format!("Failed to read {}: {}", path.display(), e)))?;

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    PipeflowError::ledger(format!("{}:{}: {}", path.display(), n + 1, e))
                })
            })
            .collect()
    }
}

#[async_trait]
impl Ledger for FileLedger {
    async fn append(&self, run_id: RunId, event: LedgerEvent) -> Result<LedgerEntry, PipeflowError> {
        let path = self.run_path(run_id);
        let mut next_seq = self.next_seq.lock().await;

        let seq = match next_seq.get(&run_id) {
            Some(seq) => *seq,
            // First append from this process; the run may predate it
            None if path.exists() => Self::read_entries(&path).await?.len() as u64,
            None => 0,
        };

        let entry = LedgerEntry {
            run_id,
            seq,
            at: Utc::now(),
            event,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| PipeflowError::ledger(format!("Failed to open {}: {}", path.display(), e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| PipeflowError::ledger(format!("Failed to append to {}: {}", path.display(), e)))?;
        file.flush()
            .await
            .map_err(|e| PipeflowError::ledger(format!("Failed to flush {}: {}", path.display(), e)))?;

        next_seq.insert(run_id, seq + 1);
        Ok(entry)
    }

    async fn entries(&self, run_id: RunId) -> Result<Vec<LedgerEntry>, PipeflowError> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Err(PipeflowError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        Self::read_entries(&path).await
    }

    async fn runs(&self) -> Result<Vec<RunId>, PipeflowError> {
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| PipeflowError::ledger(format!("Failed to read ledger directory: {}", e)))?;

        let mut runs = Vec::new();
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| PipeflowError::ledger(format!("Failed to read ledger entry: {}", e)))?
        {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(run_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<RunId>().ok())
            else {
                continue;
            };

            // Order by the time of the first entry
            if let Some(first) = Self::read_entries(&path).await?.into_iter().next() {
                runs.push((first.at, run_id));
            }
        }

        runs.sort();
        Ok(runs.into_iter().map(|(_, id)| id).collect())
    }

    async fn store_log(
        &self,
        run_id: RunId,
        task: &str,
        attempt: u32,
        text: &str,
    ) -> Result<String, PipeflowError> {
        let dir = self.dir.join("logs").join(run_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| PipeflowError::ledger(format!("Failed to create log directory: {}", e)))?;

        let path = dir.join(format!("{}.{}.log", task, attempt));
        tokio::fs::write(&path, text)
            .await
            .map_err(|e| PipeflowError::ledger(format!("Failed to write {}: {}", path.display(), e)))?;

        Ok(path.display().to_string())
    }

    async fn read_log(&self, log_ref: &str) -> Result<String, PipeflowError> {
        tokio::fs::read_to_string(log_ref)
            .await
            .map_err(|e| PipeflowError::ledger(format!("Failed to read log {}: {}", log_ref, e)))
    }
}
