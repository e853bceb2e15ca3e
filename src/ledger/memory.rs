// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! In-memory ledger, for embedding and tests

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{Ledger, LedgerEntry, LedgerEvent};
use crate::errors::PipeflowError;
use crate::run::RunId;

/// Ledger kept in process memory
#[derive(Debug, Default)]
pub struct MemoryLedger {
    runs: RwLock<Vec<(RunId, Vec<LedgerEntry>)>>,
    logs: RwLock<HashMap<String, String>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn append(&self, run_id: RunId, event: LedgerEvent) -> Result<LedgerEntry, PipeflowError> {
        let mut runs = self.runs.write().await;
        let index = match runs.iter().position(|(id, _)| *id == run_id) {
            Some(index) => index,
            None => {
                runs.push((run_id, Vec::new()));
                runs.len() - 1
            }
        };

        let entries = &mut runs[index].1;
        let entry = LedgerEntry {
            run_id,
            seq: entries.len() as u64,
            at: Utc::now(),
            event,
        };
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn entries(&self, run_id: RunId) -> Result<Vec<LedgerEntry>, PipeflowError> {
        self.runs
            .read()
            .await
            .iter()
            .find(|(id, _)| *id == run_id)
            .map(|(_, entries)| entries.clone())
            .ok_or_else(|| PipeflowError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    async fn runs(&self) -> Result<Vec<RunId>, PipeflowError> {
        Ok(self.runs.read().await.iter().map(|(id, _)| *id).collect())
    }

    async fn store_log(
        &self,
        run_id: RunId,
        task: &str,
        attempt: u32,
        text: &str,
    ) -> Result<String, PipeflowError> {
        let log_ref = format!("memory://{}/{}/{}", run_id, task, attempt);
        self.logs
            .write()
            .await
            .insert(log_ref.clone(), text.to_string());
        Ok(log_ref)
    }

    async fn read_log(&self, log_ref: &str) -> Result<String, PipeflowError> {
        self.logs
            .read()
            .await
            .get(log_ref)
            .cloned()
            .ok_or_else(|| PipeflowError::ledger(format!("no log at {}", log_ref)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunStatus;

    #[tokio::test]
    async fn test_sequence_numbers_are_per_run() {
        let ledger = MemoryLedger::new();
        let a = RunId::new();
        let b = RunId::new();

        ledger.append(a, LedgerEvent::RunResumed).await.unwrap();
        ledger.append(b, LedgerEvent::RunResumed).await.unwrap();
        let last = ledger
            .append(a, LedgerEvent::RunFinished { status: RunStatus::Succeeded })
            .await
            .unwrap();

        assert_eq!(last.seq, 1);
        assert_eq!(ledger.entries(a).await.unwrap().len(), 2);
        assert_eq!(ledger.runs().await.unwrap(), vec![a, b]);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let ledger = MemoryLedger::new();
        assert!(matches!(
            ledger.entries(RunId::new()).await,
            Err(PipeflowError::RunNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_logs_round_trip() {
        let ledger = MemoryLedger::new();
        let log_ref = ledger.store_log(RunId::new(), "lint", 2, "ok\n").await.unwrap();
        assert!(log_ref.ends_with("/lint/2"));
        assert_eq!(ledger.read_log(&log_ref).await.unwrap(), "ok\n");
    }
}
