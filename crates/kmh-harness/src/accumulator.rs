//! In-memory result table with periodic full checkpoints.

use std::collections::HashSet;

use kmh_data::CheckpointStore;
use kmh_types::{CheckpointGranularity, KmhResult, ResultRow};

/// Append-only result table. Only the batch driver task owns one, so no
/// locking is involved.
#[derive(Debug)]
pub struct ResultAccumulator {
    rows: Vec<ResultRow>,
    store: CheckpointStore,
    granularity: CheckpointGranularity,
    saved_rows: usize,
}

impl ResultAccumulator {
    pub fn new(store: CheckpointStore, granularity: CheckpointGranularity) -> Self {
        Self {
            rows: Vec::new(),
            store,
            granularity,
            saved_rows: 0,
        }
    }

    /// Start from the rows of an existing checkpoint.
    pub fn resume(store: CheckpointStore, granularity: CheckpointGranularity) -> KmhResult<Self> {
        let rows = store.load()?;
        let saved_rows = rows.len();
        Ok(Self {
            rows,
            store,
            granularity,
            saved_rows,
        })
    }

    pub fn append(&mut self, row: ResultRow) {
        self.rows.push(row);
    }

    /// Rewrite the whole checkpoint with every row collected so far.
    pub fn checkpoint(&mut self) -> KmhResult<()> {
        self.store.save(&self.rows)?;
        self.saved_rows = self.rows.len();
        Ok(())
    }

    /// Hook called after every finished job.
    pub fn job_finished(&mut self) -> KmhResult<()> {
        match self.granularity {
            CheckpointGranularity::PerJob => self.checkpoint(),
            CheckpointGranularity::PerInstance => Ok(()),
        }
    }

    /// Hook called once every job of an instance has finished.
    pub fn instance_finished(&mut self) -> KmhResult<()> {
        match self.granularity {
            CheckpointGranularity::PerInstance if self.has_unsaved_rows() => self.checkpoint(),
            _ => Ok(()),
        }
    }

    pub fn has_unsaved_rows(&self) -> bool {
        self.saved_rows != self.rows.len()
    }

    /// `(file, k)` pairs already present.
    pub fn completed_keys(&self) -> HashSet<(String, usize)> {
        self.rows
            .iter()
            .map(|row| {
                let (file, k) = row.key();
                (file.to_string(), k)
            })
            .collect()
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(file: &str, k: usize) -> ResultRow {
        ResultRow::read_fail(file, file.trim_end_matches(".i"), k, "unreadable")
    }

    #[test]
    fn per_job_checkpoints_every_row() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("runs.csv"));
        let mut acc = ResultAccumulator::new(store.clone(), CheckpointGranularity::PerJob);

        for k in 2..5 {
            acc.append(row("a.i", k));
            acc.job_finished().unwrap();
            assert_eq!(store.load().unwrap().len(), k - 1);
        }
        assert!(!acc.has_unsaved_rows());
    }

    #[test]
    fn per_instance_waits_for_the_instance() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("runs.csv"));
        let mut acc = ResultAccumulator::new(store.clone(), CheckpointGranularity::PerInstance);

        acc.append(row("a.i", 2));
        acc.job_finished().unwrap();
        acc.append(row("a.i", 3));
        acc.job_finished().unwrap();
        assert!(store.load().unwrap().is_empty());
        assert!(acc.has_unsaved_rows());

        acc.instance_finished().unwrap();
        assert_eq!(store.load().unwrap().len(), 2);
    }

    #[test]
    fn resume_picks_up_saved_rows() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("runs.csv"));
        let mut first = ResultAccumulator::new(store.clone(), CheckpointGranularity::PerJob);
        first.append(row("a.i", 2));
        first.append(row("b.i", 2));
        first.checkpoint().unwrap();

        let resumed = ResultAccumulator::resume(store, CheckpointGranularity::PerJob).unwrap();
        assert_eq!(resumed.len(), 2);
        assert!(!resumed.has_unsaved_rows());
        let keys = resumed.completed_keys();
        assert!(keys.contains(&("a.i".to_string(), 2)));
        assert!(!keys.contains(&("a.i".to_string(), 3)));
    }

    #[test]
    fn failed_checkpoint_is_an_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "file, not a directory").unwrap();

        let mut acc = ResultAccumulator::new(
            CheckpointStore::new(blocker.join("runs.csv")),
            CheckpointGranularity::PerJob,
        );
        acc.append(row("a.i", 2));
        assert!(acc.job_finished().is_err());
    }
}
