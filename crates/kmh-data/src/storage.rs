use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use kmh_types::{KmhError, KmhResult, ResultRow};

/// Column order of the checkpoint table.
pub const CHECKPOINT_COLUMNS: [&str; 14] = [
    "file",
    "stem",
    "k",
    "n",
    "status_text",
    "status",
    "objective_total",
    "objective_avg_per_point",
    "runtime_sec",
    "mip_gap",
    "lower_bound",
    "upper_bound",
    "medoids_1based",
    "fail_reason",
];

/// Persists the full result table as CSV.
///
/// Every save rewrites the whole file through a temporary sibling and a
/// rename, so readers only ever see a complete previous or a complete new
/// table.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the checkpoint with `rows`.
    pub fn save(&self, rows: &[ResultRow]) -> KmhResult<()> {
        let bytes = encode_rows(rows).map_err(|e| self.checkpoint_error(e))?;
        atomic_write_bytes(&self.path, &bytes).map_err(|e| self.checkpoint_error(e))?;
        tracing::debug!("Checkpoint {} written ({} rows)", self.path.display(), rows.len());
        Ok(())
    }

    /// Read a previous checkpoint; a missing file is an empty table.
    pub fn load(&self) -> KmhResult<Vec<ResultRow>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&self.path)?;
        let mut rows = Vec::new();
        for record in reader.deserialize::<ResultRow>() {
            rows.push(record?);
        }
        Ok(rows)
    }

    fn checkpoint_error(&self, e: impl std::fmt::Display) -> KmhError {
        KmhError::Checkpoint {
            path: self.path.clone(),
            message: e.to_string(),
        }
    }
}

fn encode_rows(rows: &[ResultRow]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(CHECKPOINT_COLUMNS)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("checkpoint");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));

    let write_result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if write_result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    write_result?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmh_types::{JobResult, RunStatus};
    use tempfile::TempDir;

    fn ok_row(file: &str, k: usize) -> ResultRow {
        let mut result = JobResult::failed_process("placeholder");
        result.status = RunStatus::Ok;
        result.solver_status = Some(2);
        result.objective_total = 3.5;
        result.objective_avg_per_point = 0.7;
        result.runtime_sec = 0.01;
        result.mip_gap = 0.0;
        result.lower_bound = 3.5;
        result.upper_bound = 3.5;
        result.medoids = (0..k).collect();
        result.fail_reason.clear();
        ResultRow::from_result(file, file.trim_end_matches(".i"), k, Some(5), &result)
    }

    #[test]
    fn save_then_load_returns_every_row() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("out").join("runs.csv"));

        let rows = vec![
            ok_row("a.i", 2),
            ResultRow::read_fail("b.i", "b", 2, "bad, \"quoted\" reason"),
            ok_row("c.i", 3),
        ];
        store.save(&rows).unwrap();

        let back = store.load().unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[0].medoids_1based, "1 2");
        assert_eq!(back[0].status, Some(2));
        assert_eq!(back[1].status_text, RunStatus::ReadFail);
        assert_eq!(back[1].fail_reason, "bad, \"quoted\" reason");
        assert_eq!(back[2].k, 3);
    }

    #[test]
    fn save_replaces_previous_contents() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("runs.csv"));

        store.save(&[ok_row("a.i", 2), ok_row("a.i", 3)]).unwrap();
        store.save(&[ok_row("a.i", 2)]).unwrap();
        assert_eq!(store.load().unwrap().len(), 1);

        // no temporary files left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn empty_table_writes_header_only() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("runs.csv"));
        store.save(&[]).unwrap();

        let text = fs::read_to_string(store.path()).unwrap();
        assert_eq!(text.trim_end(), CHECKPOINT_COLUMNS.join(","));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn missing_checkpoint_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("absent.csv"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn unwritable_location_is_checkpoint_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();

        let store = CheckpointStore::new(blocker.join("runs.csv"));
        let err = store.save(&[ok_row("a.i", 2)]).unwrap_err();
        assert!(matches!(err, KmhError::Checkpoint { .. }));
    }
}
