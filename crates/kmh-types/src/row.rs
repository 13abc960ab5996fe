use serde::{Deserialize, Serialize};

use crate::job::{nan_as_null, JobResult, RunStatus};

/// One row of the result table / checkpoint file: one (instance, k) job.
///
/// Field order is the checkpoint column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub file: String,
    pub stem: String,
    pub k: usize,
    /// Point count; empty when the instance could not be read.
    pub n: Option<usize>,
    pub status_text: RunStatus,
    pub status: Option<i32>,
    #[serde(with = "nan_as_null")]
    pub objective_total: f64,
    #[serde(with = "nan_as_null")]
    pub objective_avg_per_point: f64,
    #[serde(with = "nan_as_null")]
    pub runtime_sec: f64,
    #[serde(with = "nan_as_null")]
    pub mip_gap: f64,
    #[serde(with = "nan_as_null")]
    pub lower_bound: f64,
    #[serde(with = "nan_as_null")]
    pub upper_bound: f64,
    pub medoids_1based: String,
    pub fail_reason: String,
}

impl ResultRow {
    pub fn from_result(
        file: impl Into<String>,
        stem: impl Into<String>,
        k: usize,
        n: Option<usize>,
        result: &JobResult,
    ) -> Self {
        Self {
            file: file.into(),
            stem: stem.into(),
            k,
            n,
            status_text: result.status,
            status: result.solver_status,
            objective_total: result.objective_total,
            objective_avg_per_point: result.objective_avg_per_point,
            runtime_sec: result.runtime_sec,
            mip_gap: result.mip_gap,
            lower_bound: result.lower_bound,
            upper_bound: result.upper_bound,
            medoids_1based: result.medoids_1based_text(),
            fail_reason: result.fail_reason.clone(),
        }
    }

    pub fn read_fail(
        file: impl Into<String>,
        stem: impl Into<String>,
        k: usize,
        reason: impl Into<String>,
    ) -> Self {
        Self::from_result(file, stem, k, None, &JobResult::read_fail(reason))
    }

    /// Identity of the job this row records.
    pub fn key(&self) -> (&str, usize) {
        (&self.file, self.k)
    }

    /// Parse the medoid column back into 1-based indices.
    pub fn medoid_indices(&self) -> Vec<usize> {
        self.medoids_1based
            .split_whitespace()
            .filter_map(|t| t.parse().ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_fail_row_has_no_numbers() {
        let row = ResultRow::read_fail("bad.i", "bad", 4, "unreadable");
        assert_eq!(row.status_text, RunStatus::ReadFail);
        assert!(row.n.is_none());
        assert!(row.objective_total.is_nan());
        assert!(row.medoids_1based.is_empty());
        assert_eq!(row.key(), ("bad.i", 4));
    }

    #[test]
    fn csv_round_trip_writes_nan_as_empty() {
        let row = ResultRow::read_fail("bad.i", "bad", 3, "garbage; nothing parsed");
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.serialize(&row).unwrap();
        let bytes = writer.into_inner().unwrap();
        let text = String::from_utf8(bytes).unwrap();

        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "file,stem,k,n,status_text,status,objective_total,objective_avg_per_point,\
             runtime_sec,mip_gap,lower_bound,upper_bound,medoids_1based,fail_reason"
        );
        assert_eq!(
            lines.next().unwrap(),
            "bad.i,bad,3,,READ_FAIL,,,,,,,,,garbage; nothing parsed"
        );

        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let back: ResultRow = reader.deserialize().next().unwrap().unwrap();
        assert_eq!(back.status_text, RunStatus::ReadFail);
        assert!(back.n.is_none());
        assert!(back.upper_bound.is_nan());
        assert_eq!(back.fail_reason, row.fail_reason);
    }

    #[test]
    fn medoid_column_parses() {
        let mut result = JobResult::failed_process("x");
        result.status = RunStatus::Ok;
        result.fail_reason.clear();
        result.medoids = vec![0, 3, 9];
        let row = ResultRow::from_result("a.i", "a", 3, Some(10), &result);
        assert_eq!(row.medoids_1based, "1 4 10");
        assert_eq!(row.medoid_indices(), vec![1, 4, 10]);
    }
}
