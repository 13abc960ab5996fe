//! The solver capability consumed by workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kmh_types::{DistanceMatrix, JobSpec, SolveStatus, SolverError};

use crate::exact::ExactSolver;
use crate::grasp::GraspSolver;

/// Tuning knobs handed to a solver for one solve.
#[derive(Debug, Clone, Default)]
pub struct SolverParams {
    /// Wall-clock budget; `None` runs to completion.
    pub time_limit: Option<Duration>,
    pub threads: Option<usize>,
    pub seed: Option<u64>,
    pub memlimit_mb: Option<f64>,
    /// Progress logging at `info` when > 0.
    pub output_flag: i32,
    /// Raised from outside to stop the solve early; the incumbent is kept.
    pub interrupt: Arc<AtomicBool>,
}

impl SolverParams {
    pub fn from_job(spec: &JobSpec) -> Self {
        let time_limit = (spec.time_limit.is_finite() && spec.time_limit >= 0.0)
            .then(|| Duration::from_secs_f64(spec.time_limit));
        Self {
            time_limit,
            threads: spec.threads,
            seed: spec.seed,
            memlimit_mb: spec.memlimit_mb,
            output_flag: spec.output_flag,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_memlimit_mb(mut self, mb: f64) -> Self {
        self.memlimit_mb = Some(mb);
        self
    }

    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn verbose(&self) -> bool {
        self.output_flag > 0
    }

    pub(crate) fn deadline(&self, start: Instant) -> Option<Instant> {
        self.time_limit.map(|limit| start + limit)
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }
}

/// Outcome of one solve.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub status: SolveStatus,
    /// Sum of assignment distances; NaN without an incumbent.
    pub objective: f64,
    /// Selected medoids, 0-based and ascending; empty without an incumbent.
    pub medoids: Vec<usize>,
    /// Serving medoid of every point; empty without an incumbent.
    pub assignment: Vec<usize>,
    pub runtime_sec: f64,
    pub mip_gap: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl Solution {
    /// A terminal state reached without any incumbent.
    pub fn without_incumbent(status: SolveStatus, runtime_sec: f64, lower_bound: f64) -> Self {
        Self {
            status,
            objective: f64::NAN,
            medoids: Vec::new(),
            assignment: Vec::new(),
            runtime_sec,
            mip_gap: f64::NAN,
            lower_bound,
            upper_bound: f64::NAN,
        }
    }

    pub fn has_incumbent(&self) -> bool {
        !self.medoids.is_empty() && self.objective.is_finite()
    }
}

/// Relative gap between incumbent and bound, zero when both are zero.
pub fn relative_gap(upper: f64, lower: f64) -> f64 {
    if !upper.is_finite() || !lower.is_finite() {
        return f64::NAN;
    }
    if upper == 0.0 {
        return if lower == 0.0 { 0.0 } else { f64::INFINITY };
    }
    ((upper - lower) / upper.abs()).max(0.0)
}

/// A k-medoids strategy: pick `k` medoids of `distances` minimizing the sum
/// of point-to-medoid distances.
pub trait Solver: Send + Sync {
    fn name(&self) -> &'static str;

    fn solve(
        &self,
        distances: &DistanceMatrix,
        k: usize,
        params: &SolverParams,
    ) -> Result<Solution, SolverError>;
}

/// Names accepted by [`solver_by_name`].
pub const SOLVER_NAMES: [&str; 2] = ["exact", "grasp"];

pub fn solver_by_name(name: &str) -> Result<Box<dyn Solver>, SolverError> {
    match name.to_ascii_lowercase().as_str() {
        "exact" => Ok(Box::new(ExactSolver::new())),
        "grasp" => Ok(Box::new(GraspSolver::default())),
        _ => Err(SolverError::UnknownSolver {
            name: name.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_known_names() {
        for name in SOLVER_NAMES {
            assert_eq!(solver_by_name(name).unwrap().name(), name);
        }
        assert_eq!(solver_by_name("EXACT").unwrap().name(), "exact");
        assert!(matches!(
            solver_by_name("simplex"),
            Err(SolverError::UnknownSolver { .. })
        ));
    }

    #[test]
    fn params_from_job() {
        let d = DistanceMatrix::from_rows(vec![vec![0.0, 1.0], vec![1.0, 0.0]]).unwrap();
        let spec = JobSpec::new(Arc::new(d), 1, 2.5);
        let params = SolverParams::from_job(&spec);
        assert_eq!(params.time_limit, Some(Duration::from_millis(2500)));
        assert_eq!(params.seed, Some(42));
        assert!(!params.interrupted());
    }

    #[test]
    fn gap_edge_cases() {
        assert_eq!(relative_gap(10.0, 10.0), 0.0);
        assert!((relative_gap(10.0, 7.5) - 0.25).abs() < 1e-12);
        assert_eq!(relative_gap(0.0, 0.0), 0.0);
        assert!(relative_gap(f64::NAN, 1.0).is_nan());
    }
}
