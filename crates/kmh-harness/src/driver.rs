//! Batch driver: every discovered instance × every configured k.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kmh_data::{discover_instances, instance_stem, CheckpointStore, InstanceLoader};
use kmh_types::{
    internal_error, HarnessConfig, JobResult, JobSpec, KmhResult, ResultRow, RunStatus,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::accumulator::ResultAccumulator;
use crate::supervisor::{JobOutcome, JobState, Supervisor, WorkerCommand};

/// Lifecycle state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    Pending,
    Running,
    Completed,
    Cancelled,
}

/// Aggregate status of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub id: Uuid,
    pub state: BatchState,
    pub instances: usize,
    pub jobs_launched: usize,
    /// Jobs already present in a resumed checkpoint.
    pub jobs_skipped: usize,
    pub ok: usize,
    pub proven_optimal: usize,
    /// `OK` rows without an incumbent.
    pub partial: usize,
    pub solver_error: usize,
    pub failed_process: usize,
    pub read_fail: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchStatus {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: BatchState::Pending,
            instances: 0,
            jobs_launched: 0,
            jobs_skipped: 0,
            ok: 0,
            proven_optimal: 0,
            partial: 0,
            solver_error: 0,
            failed_process: 0,
            read_fail: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = BatchState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.state = BatchState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.state = BatchState::Cancelled;
        self.finished_at = Some(Utc::now());
    }

    pub fn record(&mut self, result: &JobResult) {
        match result.status {
            RunStatus::Ok => {
                self.ok += 1;
                if result.proven_optimal() {
                    self.proven_optimal += 1;
                }
                if result.is_partial() {
                    self.partial += 1;
                }
            }
            RunStatus::SolverError => self.solver_error += 1,
            RunStatus::FailedProcess => self.failed_process += 1,
            RunStatus::ReadFail => self.read_fail += 1,
        }
    }

    /// Rows produced by this run (resumed rows excluded).
    pub fn rows_recorded(&self) -> usize {
        self.ok + self.solver_error + self.failed_process + self.read_fail
    }
}

impl Default for BatchStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of one job inside the batch.
#[derive(Debug, Clone)]
struct JobContext {
    file: String,
    stem: String,
    k: usize,
    n: usize,
}

pub struct BatchDriver {
    config: HarnessConfig,
    supervisor: Arc<Supervisor>,
    loader: InstanceLoader,
    cancel: Arc<AtomicBool>,
}

impl BatchDriver {
    pub fn new(config: HarnessConfig, command: WorkerCommand) -> KmhResult<Self> {
        config.validate()?;
        let supervisor = Arc::new(Supervisor::new(command, &config));
        let loader = InstanceLoader::new().with_max_points(config.max_points);
        Ok(Self {
            config,
            supervisor,
            loader,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Raising this flag stops new jobs from being launched; jobs already
    /// running are still collected and checkpointed.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub async fn run(&self) -> KmhResult<BatchStatus> {
        let mut status = BatchStatus::new();
        let files = discover_instances(&self.config.instance_dir, &self.config.extensions)?;
        status.instances = files.len();

        let store = CheckpointStore::new(self.config.checkpoint_path());
        let mut acc = if self.config.resume {
            let acc = ResultAccumulator::resume(store, self.config.checkpoint)?;
            info!("Resuming with {} rows from {}", acc.len(), self.config.checkpoint_path().display());
            acc
        } else {
            ResultAccumulator::new(store, self.config.checkpoint)
        };
        let done = acc.completed_keys();

        info!(
            "Batch {}: {} instances x k={:?}, budget {}s + {}s grace, pool {}",
            status.id,
            files.len(),
            self.config.ks,
            self.config.time_limit_sec,
            self.config.grace_period_sec,
            self.config.pool_size
        );
        status.mark_running();

        let semaphore = Arc::new(Semaphore::new(self.config.pool_size));
        let mut jobs: JoinSet<(JobContext, JobOutcome)> = JoinSet::new();
        let mut remaining: HashMap<String, usize> = HashMap::new();

        for path in &files {
            if self.cancelled() {
                break;
            }
            let file = file_name(path);
            let stem = instance_stem(path);
            let ks: Vec<usize> = self
                .config
                .ks
                .iter()
                .copied()
                .filter(|k| !done.contains(&(file.clone(), *k)))
                .collect();
            status.jobs_skipped += self.config.ks.len() - ks.len();
            if ks.is_empty() {
                info!("{} already complete, skipping", file);
                continue;
            }

            let instance = match self.loader.load(path) {
                Ok(instance) => instance,
                Err(e) => {
                    warn!("{} | READ_FAIL | {}", stem, e);
                    for &k in &ks {
                        let row = ResultRow::read_fail(file.as_str(), stem.as_str(), k, e.to_string());
                        status.record(&JobResult::read_fail(e.to_string()));
                        acc.append(row);
                        acc.job_finished()?;
                    }
                    acc.instance_finished()?;
                    continue;
                }
            };

            remaining.insert(file.clone(), ks.len());
            for k in ks {
                let permit = loop {
                    tokio::select! {
                        permit = semaphore.clone().acquire_owned() => {
                            break permit.map_err(|e| internal_error!("job pool closed: {}", e))?;
                        }
                        Some(joined) = jobs.join_next() => {
                            self.collect(joined, &mut acc, &mut remaining, &mut status)?;
                        }
                    }
                };
                if self.cancelled() {
                    drop(permit);
                    break;
                }

                let ctx = JobContext {
                    file: file.clone(),
                    stem: stem.clone(),
                    k,
                    n: instance.n(),
                };
                let spec = JobSpec::new(instance.distances.clone(), k, self.config.time_limit_sec)
                    .with_tuning(&self.config.solver);
                let supervisor = self.supervisor.clone();
                status.jobs_launched += 1;

                jobs.spawn(async move {
                    let job = tokio::spawn(async move { supervisor.run_job(&spec).await });
                    let outcome = match job.await {
                        Ok(outcome) => outcome,
                        Err(e) => JobOutcome {
                            state: JobState::Failed,
                            result: JobResult::failed_process(format!("supervisor task failed: {}", e)),
                            wall_time: Duration::ZERO,
                        },
                    };
                    drop(permit);
                    (ctx, outcome)
                });
            }
        }

        while let Some(joined) = jobs.join_next().await {
            self.collect(joined, &mut acc, &mut remaining, &mut status)?;
        }
        acc.checkpoint()?;

        if self.cancelled() {
            status.mark_cancelled();
        } else {
            status.mark_completed();
        }
        info!(
            "Batch {} {:?}: {} jobs ({} OK, {} proven optimal, {} partial, {} SOLVER_ERROR, {} FAILED_PROCESS, {} READ_FAIL), {} skipped; checkpoint {}",
            status.id,
            status.state,
            status.rows_recorded(),
            status.ok,
            status.proven_optimal,
            status.partial,
            status.solver_error,
            status.failed_process,
            status.read_fail,
            status.jobs_skipped,
            self.config.checkpoint_path().display()
        );
        Ok(status)
    }

    /// Fold one finished job into the table. Checkpoint failures propagate.
    fn collect(
        &self,
        joined: Result<(JobContext, JobOutcome), tokio::task::JoinError>,
        acc: &mut ResultAccumulator,
        remaining: &mut HashMap<String, usize>,
        status: &mut BatchStatus,
    ) -> KmhResult<()> {
        let (ctx, outcome) = joined.map_err(|e| internal_error!("job task failed: {}", e))?;
        log_job(&ctx, &outcome);
        status.record(&outcome.result);
        acc.append(ResultRow::from_result(
            ctx.file.as_str(),
            ctx.stem.as_str(),
            ctx.k,
            Some(ctx.n),
            &outcome.result,
        ));
        acc.job_finished()?;

        if let Some(left) = remaining.get_mut(&ctx.file) {
            *left -= 1;
            if *left == 0 {
                remaining.remove(&ctx.file);
                acc.instance_finished()?;
            }
        }
        Ok(())
    }
}

fn log_job(ctx: &JobContext, outcome: &JobOutcome) {
    let result = &outcome.result;
    if result.is_ok() {
        info!(
            "{} | k={} | {} | total={:.6} | avg={:.6} | time={:.2}s",
            ctx.stem,
            ctx.k,
            result.status,
            result.objective_total,
            result.objective_avg_per_point,
            result.runtime_sec
        );
    } else {
        warn!(
            "{} | k={} | {} | {} ({:?} after {:.2}s)",
            ctx.stem,
            ctx.k,
            result.status,
            result.fail_reason,
            outcome.state,
            outcome.wall_time.as_secs_f64()
        );
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
