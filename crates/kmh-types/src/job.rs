//! Job contract between the supervisor and an isolated worker.
//!
//! [`JobSpec`] is what a worker receives, [`WorkerReport`] is what it writes
//! back, and [`JobResult`] is the supervisor's normalized view of a finished
//! job whatever happened to the worker process.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::SolverTuning;
use crate::matrix::DistanceMatrix;

/// Schema tag of a job request envelope.
pub const JOB_SPEC_SCHEMA: &str = "kmh_job_spec_v1";
/// Schema tag of a job report envelope.
pub const JOB_RESULT_SCHEMA: &str = "kmh_job_result_v1";

fn default_solver_name() -> String {
    SolverTuning::default().name
}

/// One optimization job: a distance matrix, a cluster count and a budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(rename = "D")]
    pub distances: Arc<DistanceMatrix>,
    pub k: usize,
    /// Wall-clock budget handed to the solver, in seconds.
    pub time_limit: f64,
    pub threads: Option<usize>,
    pub seed: Option<u64>,
    pub memlimit_mb: Option<f64>,
    pub output_flag: i32,
    #[serde(default = "default_solver_name")]
    pub solver: String,
}

impl JobSpec {
    pub fn new(distances: Arc<DistanceMatrix>, k: usize, time_limit: f64) -> Self {
        let tuning = SolverTuning::default();
        Self {
            distances,
            k,
            time_limit,
            threads: tuning.threads,
            seed: tuning.seed,
            memlimit_mb: tuning.memlimit_mb,
            output_flag: tuning.output_flag,
            solver: tuning.name,
        }
    }

    pub fn with_tuning(mut self, tuning: &SolverTuning) -> Self {
        self.threads = tuning.threads;
        self.seed = tuning.seed;
        self.memlimit_mb = tuning.memlimit_mb;
        self.output_flag = tuning.output_flag;
        self.solver = tuning.name.clone();
        self
    }

    /// Number of points in the instance.
    pub fn n(&self) -> usize {
        self.distances.len()
    }
}

// ---------------------------------------------------------------------------
// Solver status codes
// ---------------------------------------------------------------------------

/// Terminal state reported by a solver, written as its numeric code in the
/// `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SolveStatus {
    Optimal,
    Infeasible,
    /// A heuristic ran all of its starts without proving optimality.
    IterationLimit,
    TimeLimit,
    Interrupted,
    MemLimit,
}

impl SolveStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Optimal => 2,
            Self::Infeasible => 3,
            Self::IterationLimit => 7,
            Self::TimeLimit => 9,
            Self::Interrupted => 11,
            Self::MemLimit => 17,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            2 => Some(Self::Optimal),
            3 => Some(Self::Infeasible),
            7 => Some(Self::IterationLimit),
            9 => Some(Self::TimeLimit),
            11 => Some(Self::Interrupted),
            17 => Some(Self::MemLimit),
            _ => None,
        }
    }

    /// States under which an incumbent, if any, is reported.
    pub fn is_usable(self) -> bool {
        matches!(
            self,
            Self::Optimal | Self::IterationLimit | Self::TimeLimit | Self::Interrupted
        )
    }
}

// ---------------------------------------------------------------------------
// Worker report (wire)
// ---------------------------------------------------------------------------

/// Serialize non-finite floats as `null` and read `null` back as NaN.
///
/// JSON has no NaN literal and the checkpoint CSV leaves missing numbers
/// empty, so both formats share this mapping.
pub mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// What a worker writes to its output channel: exactly one per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub ok: bool,
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
    pub medoids_1based: Vec<usize>,
    pub fail_reason: String,
}

impl WorkerReport {
    /// Report for a solver that raised instead of returning.
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            status: None,
            objective_total: f64::NAN,
            objective_avg_per_point: f64::NAN,
            runtime_sec: f64::NAN,
            mip_gap: f64::NAN,
            lower_bound: f64::NAN,
            upper_bound: f64::NAN,
            medoids_1based: Vec::new(),
            fail_reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Normalized job result
// ---------------------------------------------------------------------------

/// Outcome tag of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Ok,
    SolverError,
    FailedProcess,
    ReadFail,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::SolverError => "SOLVER_ERROR",
            Self::FailedProcess => "FAILED_PROCESS",
            Self::ReadFail => "READ_FAIL",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(Self::Ok),
            "SOLVER_ERROR" => Ok(Self::SolverError),
            "FAILED_PROCESS" => Ok(Self::FailedProcess),
            "READ_FAIL" => Ok(Self::ReadFail),
            other => Err(format!("unknown status text: {other}")),
        }
    }
}

/// The supervisor's normalized record of one finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: RunStatus,
    /// Raw solver status code, only present for `Ok`.
    pub solver_status: Option<i32>,
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
    /// Selected medoids, 0-based.
    pub medoids: Vec<usize>,
    pub fail_reason: String,
}

impl JobResult {
    fn empty(status: RunStatus, reason: String) -> Self {
        Self {
            status,
            solver_status: None,
            objective_total: f64::NAN,
            objective_avg_per_point: f64::NAN,
            runtime_sec: f64::NAN,
            mip_gap: f64::NAN,
            lower_bound: f64::NAN,
            upper_bound: f64::NAN,
            medoids: Vec::new(),
            fail_reason: reason,
        }
    }

    pub fn solver_error(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let reason = if reason.trim().is_empty() {
            "unknown error".to_string()
        } else {
            reason
        };
        Self::empty(RunStatus::SolverError, reason)
    }

    pub fn failed_process(reason: impl Into<String>) -> Self {
        Self::empty(RunStatus::FailedProcess, reason.into())
    }

    pub fn read_fail(reason: impl Into<String>) -> Self {
        Self::empty(RunStatus::ReadFail, reason.into())
    }

    /// Normalize a parsed worker report. The report's own `ok` flag decides
    /// between `Ok` and `SolverError`.
    pub fn from_report(report: WorkerReport) -> Self {
        if !report.ok {
            return Self::solver_error(report.fail_reason);
        }
        Self {
            status: RunStatus::Ok,
            solver_status: report.status,
            objective_total: report.objective_total,
            objective_avg_per_point: report.objective_avg_per_point,
            runtime_sec: report.runtime_sec,
            mip_gap: report.mip_gap,
            lower_bound: report.lower_bound,
            upper_bound: report.upper_bound,
            medoids: report
                .medoids_1based
                .iter()
                .map(|m| m.saturating_sub(1))
                .collect(),
            fail_reason: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == RunStatus::Ok
    }

    /// `Ok` with a proven-optimal incumbent, as opposed to one cut short by
    /// the time limit or an interrupt.
    pub fn proven_optimal(&self) -> bool {
        self.is_ok() && self.solver_status == Some(SolveStatus::Optimal.code())
    }

    /// `Ok` but the solver stopped without any incumbent.
    pub fn is_partial(&self) -> bool {
        self.is_ok() && self.medoids.is_empty()
    }

    /// Space-separated 1-based medoid indices, as stored in the checkpoint.
    pub fn medoids_1based_text(&self) -> String {
        self.medoids
            .iter()
            .map(|m| (m + 1).to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a.is_nan() && b.is_nan()) || (a - b).abs() <= 1e-12 * a.abs().max(1.0)
    }

    fn sample_spec() -> JobSpec {
        let d = DistanceMatrix::from_rows(vec![
            vec![0.0, 1.25, 2.5],
            vec![1.25, 0.0, 0.75],
            vec![2.5, 0.75, 0.0],
        ])
        .unwrap();
        let tuning = SolverTuning {
            name: "exact".to_string(),
            threads: Some(2),
            seed: Some(7),
            memlimit_mb: Some(512.5),
            output_flag: 0,
        };
        JobSpec::new(Arc::new(d), 2, 12.5).with_tuning(&tuning)
    }

    #[test]
    fn job_spec_round_trip() {
        let spec = sample_spec();
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"D\":[["));

        let back: JobSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
        assert_eq!(back.n(), 3);
    }

    #[test]
    fn job_spec_defaults_solver_name() {
        let json = r#"{"D":[[0.0,1.0],[1.0,0.0]],"k":1,"time_limit":1.0,
            "threads":null,"seed":null,"memlimit_mb":null,"output_flag":0}"#;
        let spec: JobSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.solver, "exact");
        assert!(spec.threads.is_none());
    }

    #[test]
    fn worker_report_round_trip_keeps_nan() {
        let report = WorkerReport {
            ok: true,
            status: Some(SolveStatus::TimeLimit.code()),
            objective_total: 12.75,
            objective_avg_per_point: 12.75 / 7.0,
            runtime_sec: 0.031,
            mip_gap: f64::NAN,
            lower_bound: 3.5,
            upper_bound: 12.75,
            medoids_1based: vec![2, 6],
            fail_reason: String::new(),
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"mip_gap\":null"));

        let back: WorkerReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ok, report.ok);
        assert_eq!(back.status, report.status);
        assert_eq!(back.medoids_1based, report.medoids_1based);
        assert!(close(back.objective_total, report.objective_total));
        assert!(close(back.objective_avg_per_point, report.objective_avg_per_point));
        assert!(close(back.runtime_sec, report.runtime_sec));
        assert!(back.mip_gap.is_nan());
        assert!(close(back.lower_bound, report.lower_bound));
        assert!(close(back.upper_bound, report.upper_bound));
    }

    #[test]
    fn job_result_round_trip() {
        let result = JobResult::failed_process("exitcode=3");
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"FAILED_PROCESS\""));

        let back: JobResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, RunStatus::FailedProcess);
        assert_eq!(back.fail_reason, "exitcode=3");
        assert!(back.objective_total.is_nan());
    }

    #[test]
    fn report_normalization_uses_ok_flag() {
        let failed = JobResult::from_report(WorkerReport::failure("boom"));
        assert_eq!(failed.status, RunStatus::SolverError);
        assert_eq!(failed.fail_reason, "boom");

        let blank = JobResult::from_report(WorkerReport::failure(""));
        assert_eq!(blank.fail_reason, "unknown error");

        let report = WorkerReport {
            ok: true,
            status: Some(2),
            objective_total: 4.0,
            objective_avg_per_point: 0.8,
            runtime_sec: 0.1,
            mip_gap: 0.0,
            lower_bound: 4.0,
            upper_bound: 4.0,
            medoids_1based: vec![2, 5],
            fail_reason: String::new(),
        };
        let ok = JobResult::from_report(report);
        assert!(ok.is_ok());
        assert!(ok.proven_optimal());
        assert_eq!(ok.medoids, vec![1, 4]);
        assert_eq!(ok.medoids_1based_text(), "2 5");
    }

    #[test]
    fn status_codes_and_text() {
        for status in [
            SolveStatus::Optimal,
            SolveStatus::Infeasible,
            SolveStatus::IterationLimit,
            SolveStatus::TimeLimit,
            SolveStatus::Interrupted,
            SolveStatus::MemLimit,
        ] {
            assert_eq!(SolveStatus::from_code(status.code()), Some(status));
        }
        assert!(SolveStatus::Interrupted.is_usable());
        assert!(SolveStatus::IterationLimit.is_usable());
        assert_eq!(SolveStatus::IterationLimit.code(), 7);
        assert!(!SolveStatus::MemLimit.is_usable());

        assert_eq!("READ_FAIL".parse::<RunStatus>().unwrap(), RunStatus::ReadFail);
        assert_eq!(RunStatus::SolverError.to_string(), "SOLVER_ERROR");
        assert!("BOGUS".parse::<RunStatus>().is_err());
    }
}
