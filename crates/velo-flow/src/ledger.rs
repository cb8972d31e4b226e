//! Append-only ledger of terminal pipeline runs.
//!
//! File layout: `{dir}/{YYYY-MM}/{run_id}.json`. Run IDs are ULIDs, so the
//! lexical order of a partition's files is their creation order. Records are
//! written with create-new semantics; appending the same run twice is a no-op.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use velo_core::PartitionKey;

use crate::error::{Error, Result};
use crate::run::PipelineRun;

/// Stores terminal runs.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Appends a terminal run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the run is not terminal,
    /// and [`Error::Ledger`] if it cannot be stored.
    async fn append(&self, run: &PipelineRun) -> Result<()>;

    /// Returns the most recent run for `partition`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ledger`] if stored runs cannot be read.
    async fn latest(&self, partition: PartitionKey) -> Result<Option<PipelineRun>> {
        Ok(self.list(partition).await?.pop())
    }

    /// Returns every run for `partition`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ledger`] if stored runs cannot be read.
    async fn list(&self, partition: PartitionKey) -> Result<Vec<PipelineRun>>;
}

fn ensure_terminal(run: &PipelineRun) -> Result<()> {
    if run.is_terminal() {
        Ok(())
    } else {
        Err(Error::InvalidStateTransition {
            from: run.step().to_string(),
            to: "LEDGER".into(),
            reason: "only terminal runs are recorded".into(),
        })
    }
}

/// Process-local ledger.
#[derive(Debug, Default)]
pub struct InMemoryRunLedger {
    runs: RwLock<HashMap<PartitionKey, Vec<PipelineRun>>>,
}

impl InMemoryRunLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Ledger {
        message: "lock poisoned".into(),
        source: None,
    }
}

#[async_trait]
impl RunLedger for InMemoryRunLedger {
    async fn append(&self, run: &PipelineRun) -> Result<()> {
        ensure_terminal(run)?;
        let mut runs = self.runs.write().map_err(poison_err)?;
        let entries = runs.entry(run.partition()).or_default();
        if !entries.iter().any(|r| r.id() == run.id()) {
            entries.push(run.clone());
        }
        Ok(())
    }

    async fn list(&self, partition: PartitionKey) -> Result<Vec<PipelineRun>> {
        let runs = self.runs.read().map_err(poison_err)?;
        let mut entries = runs.get(&partition).cloned().unwrap_or_default();
        entries.sort_by_key(|r| r.id());
        Ok(entries)
    }
}

/// Ledger of JSON files under a directory.
#[derive(Debug, Clone)]
pub struct FileRunLedger {
    dir: PathBuf,
}

impl FileRunLedger {
    /// Creates a ledger rooted at `dir`. Directories are created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn partition_dir(&self, partition: PartitionKey) -> PathBuf {
        self.dir.join(partition.to_string())
    }
}

#[async_trait]
impl RunLedger for FileRunLedger {
    #[tracing::instrument(skip(self, run), fields(run_id = %run.id(), partition = %run.partition()))]
    async fn append(&self, run: &PipelineRun) -> Result<()> {
        ensure_terminal(run)?;
        let dir = self.partition_dir(run.partition());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::ledger_with_source(format!("cannot create {}", dir.display()), e))?;

        let path = dir.join(format!("{}.json", run.id()));
        let body = serde_json::to_vec_pretty(run)?;
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::debug!("run already recorded - no-op");
                return Ok(());
            }
            Err(e) => {
                return Err(Error::ledger_with_source(
                    format!("cannot create {}", path.display()),
                    e,
                ));
            }
        };
        file.write_all(&body)
            .await
            .map_err(|e| Error::ledger_with_source(format!("cannot write {}", path.display()), e))?;
        file.flush()
            .await
            .map_err(|e| Error::ledger_with_source(format!("cannot write {}", path.display()), e))?;
        tracing::debug!(path = %path.display(), "run recorded");
        Ok(())
    }

    async fn list(&self, partition: PartitionKey) -> Result<Vec<PipelineRun>> {
        let dir = self.partition_dir(partition);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::ledger_with_source(
                    format!("cannot list {}", dir.display()),
                    e,
                ));
            }
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::ledger_with_source(format!("cannot list {}", dir.display()), e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut runs = Vec::with_capacity(paths.len());
        for path in paths {
            let body = tokio::fs::read(&path)
                .await
                .map_err(|e| Error::ledger_with_source(format!("cannot read {}", path.display()), e))?;
            let run: PipelineRun = serde_json::from_slice(&body).map_err(|e| {
                Error::ledger_with_source(format!("corrupt run record {}", path.display()), e)
            })?;
            runs.push(run);
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{PipelineStep, RunTrigger};

    fn finished(partition: PartitionKey) -> PipelineRun {
        let mut run = PipelineRun::new(partition, RunTrigger::Scheduled);
        run.fail(&Error::configuration("test")).unwrap();
        run
    }

    #[tokio::test]
    async fn in_memory_ledger_returns_latest() {
        let ledger = InMemoryRunLedger::new();
        let jan = PartitionKey::new(2025, 1).unwrap();
        let first = finished(jan);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = finished(jan);
        ledger.append(&second).await.unwrap();
        ledger.append(&first).await.unwrap();
        ledger.append(&first).await.unwrap();

        assert_eq!(ledger.list(jan).await.unwrap().len(), 2);
        assert_eq!(ledger.latest(jan).await.unwrap().unwrap().id(), second.id());
        let feb = PartitionKey::new(2025, 2).unwrap();
        assert!(ledger.latest(feb).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_terminal_runs_are_rejected() {
        let ledger = InMemoryRunLedger::new();
        let run = PipelineRun::new(PartitionKey::new(2025, 1).unwrap(), RunTrigger::Manual);
        assert_eq!(run.step(), PipelineStep::CheckingAvailability);
        assert!(ledger.append(&run).await.is_err());
    }

    #[tokio::test]
    async fn file_ledger_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = FileRunLedger::new(tmp.path());
        let jan = PartitionKey::new(2025, 1).unwrap();
        let run = finished(jan);
        ledger.append(&run).await.unwrap();
        ledger.append(&run).await.unwrap();

        assert!(tmp.path().join("2025-01").join(format!("{}.json", run.id())).exists());
        let listed = ledger.list(jan).await.unwrap();
        assert_eq!(listed, vec![run.clone()]);
        assert_eq!(ledger.latest(jan).await.unwrap(), Some(run));
    }

    #[tokio::test]
    async fn file_ledger_missing_partition_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = FileRunLedger::new(tmp.path().join("nope"));
        assert!(ledger.list(PartitionKey::new(2025, 1).unwrap()).await.unwrap().is_empty());
    }
}
