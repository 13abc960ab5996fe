//! Worker side of a job: runs inside its own OS process.
//!
//! The worker reads exactly one job request, solves it and writes exactly
//! one report. Whatever the solver does, an error or a panic, ends up in
//! the report; only a broken channel makes the process exit non-zero.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kmh_solver::{solver_by_name, KMedoidsModel, Solution, Solver, SolverParams};
use kmh_types::{
    JobSpec, KmhResult, SolverError, WorkerReport, JOB_RESULT_SCHEMA, JOB_SPEC_SCHEMA,
};
use tracing::{info, warn};

use crate::channel::{Envelope, FileChannel};

/// Solve `spec` with `solver`, turning every failure into a report.
pub fn execute_job(spec: &JobSpec, solver: &dyn Solver, interrupt: Arc<AtomicBool>) -> WorkerReport {
    let params = SolverParams::from_job(spec).with_interrupt(interrupt);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        solver.solve(&spec.distances, spec.k, &params)
    }));

    match outcome {
        Ok(Ok(solution)) => match check_solution(spec, &solution) {
            Ok(()) => report_from_solution(&solution, spec.n()),
            Err(reason) => WorkerReport::failure(format!(
                "solver {} returned an invalid incumbent: {}",
                solver.name(),
                reason
            )),
        },
        Ok(Err(e)) => WorkerReport::failure(e.to_string()),
        Err(payload) => WorkerReport::failure(
            SolverError::Panicked {
                message: panic_message(payload.as_ref()),
            }
            .to_string(),
        ),
    }
}

/// Resolve the solver named in `spec` and run it.
pub fn execute_named_job(spec: &JobSpec, interrupt: Arc<AtomicBool>) -> WorkerReport {
    match solver_by_name(&spec.solver) {
        Ok(solver) => execute_job(spec, solver.as_ref(), interrupt),
        Err(e) => WorkerReport::failure(e.to_string()),
    }
}

/// Re-check a reportable incumbent against the model; nothing a solver
/// returns is trusted as is.
fn check_solution(spec: &JobSpec, solution: &Solution) -> Result<(), String> {
    if !(solution.status.is_usable() && solution.has_incumbent()) {
        return Ok(());
    }
    let model = KMedoidsModel::new(&spec.distances, spec.k).map_err(|e| e.to_string())?;
    model
        .check_incumbent(&solution.medoids, solution.objective)
        .map_err(|violation| violation.to_string())
}

/// A usable terminal state with an incumbent is reported in full; anything
/// else is still `ok` but carries NaN objectives and no medoids.
fn report_from_solution(solution: &Solution, n: usize) -> WorkerReport {
    let with_incumbent = solution.status.is_usable() && solution.has_incumbent();
    let (objective_total, medoids_1based) = if with_incumbent {
        (
            solution.objective,
            solution.medoids.iter().map(|m| m + 1).collect(),
        )
    } else {
        (f64::NAN, Vec::new())
    };

    WorkerReport {
        ok: true,
        status: Some(solution.status.code()),
        objective_total,
        objective_avg_per_point: objective_total / n as f64,
        runtime_sec: solution.runtime_sec,
        mip_gap: solution.mip_gap,
        lower_bound: solution.lower_bound,
        upper_bound: solution.upper_bound,
        medoids_1based,
        fail_reason: String::new(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Entry point of `kmh worker`.
///
/// SIGINT raises the solver's interrupt flag so the incumbent found so far
/// is still reported.
pub async fn run_worker(input: &Path, output: &Path, io_timeout: Duration) -> KmhResult<()> {
    let request: Envelope<JobSpec> = FileChannel::new(input, io_timeout)
        .recv(JOB_SPEC_SCHEMA)
        .await?;
    let job_id = request.job_id;
    let spec = request.payload;
    info!(
        "Worker {} solving n={} k={} with {} (limit {}s)",
        job_id,
        spec.n(),
        spec.k,
        spec.solver,
        spec.time_limit
    );

    let interrupt = Arc::new(AtomicBool::new(false));
    let listener = {
        let flag = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping solver");
                flag.store(true, Ordering::Relaxed);
            }
        })
    };

    let solve = tokio::task::spawn_blocking({
        let interrupt = interrupt.clone();
        move || execute_named_job(&spec, interrupt)
    });
    let report = match solve.await {
        Ok(report) => report,
        Err(e) => WorkerReport::failure(format!("solver task failed: {}", e)),
    };
    listener.abort();

    if !report.ok {
        warn!("Worker {} solver failed: {}", job_id, report.fail_reason);
    }
    FileChannel::new(output, io_timeout)
        .send(&Envelope::new(JOB_RESULT_SCHEMA, job_id, report))
        .await?;
    Ok(())
}
