//! Spawns one worker process per job and watches it until it finishes or
//! runs out of budget.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use kmh_types::{
    HarnessConfig, JobResult, JobSpec, KmhResult, WorkerReport, JOB_RESULT_SCHEMA,
    JOB_SPEC_SCHEMA,
};
use tokio::process::{Child, Command};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::{Envelope, FileChannel};

/// Exit code recorded for a worker that had to be killed after its budget.
pub const KILLED_EXIT_CODE: i32 = -9;

/// Lifecycle of one supervised job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Spawned,
    Running,
    Completed,
    TimedOut,
    Failed,
}

/// How to start a worker. The supervisor appends
/// `--input <file> --output <file> --io-timeout <secs>` to the configured
/// arguments.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new<P, I, S>(program: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// This executable's own `worker` subcommand.
    pub fn current_exe() -> KmhResult<Self> {
        Ok(Self::new(std::env::current_exe()?, ["worker"]))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn build(&self, input: &Path, output: &Path, io_timeout: Duration) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--input")
            .arg(input)
            .arg("--output")
            .arg(output)
            .arg("--io-timeout")
            .arg(io_timeout.as_secs_f64().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

/// What happened to one job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub state: JobState,
    pub result: JobResult,
    pub wall_time: Duration,
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    command: WorkerCommand,
    grace_period: Duration,
    kill_wait: Duration,
    poll_interval: Duration,
    io_timeout: Duration,
}

impl Supervisor {
    pub fn new(command: WorkerCommand, config: &HarnessConfig) -> Self {
        Self {
            command,
            grace_period: Duration::from_secs_f64(config.grace_period_sec.max(0.0)),
            kill_wait: config.kill_wait(),
            poll_interval: config.poll_interval(),
            io_timeout: config.io_timeout(),
        }
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    /// Wall-clock allowance for a job before it is terminated.
    pub fn budget_for(&self, spec: &JobSpec) -> Duration {
        let limit = if spec.time_limit.is_finite() {
            spec.time_limit.max(0.0)
        } else {
            0.0
        };
        Duration::from_secs_f64(limit) + self.grace_period
    }

    /// Run `spec` in a fresh worker process. Always yields exactly one
    /// result; nothing the worker does can make this fail.
    pub async fn run_job(&self, spec: &JobSpec) -> JobOutcome {
        let started = Instant::now();
        let job_id = Uuid::new_v4();
        let (state, result) = self.supervise(job_id, spec, started).await;
        debug!("Job {} finished in state {:?}", job_id, state);
        JobOutcome {
            state,
            result,
            wall_time: started.elapsed(),
        }
    }

    async fn supervise(&self, job_id: Uuid, spec: &JobSpec, started: Instant) -> (JobState, JobResult) {
        let scratch = match tempfile::Builder::new().prefix("kmh-job-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                return (
                    JobState::Failed,
                    JobResult::failed_process(format!("could not create job directory: {}", e)),
                )
            }
        };
        let input = scratch.path().join("job.json");
        let output = scratch.path().join("result.json");

        let request = Envelope::new(JOB_SPEC_SCHEMA, job_id, spec);
        if let Err(e) = FileChannel::new(&input, self.io_timeout).send(&request).await {
            return (
                JobState::Failed,
                JobResult::failed_process(format!("could not hand job to worker: {}", e)),
            );
        }

        let mut child = match self.command.build(&input, &output, self.io_timeout).spawn() {
            Ok(child) => child,
            Err(e) => {
                return (
                    JobState::Failed,
                    JobResult::failed_process(format!(
                        "failed to spawn {}: {}",
                        self.command.program.display(),
                        e
                    )),
                )
            }
        };
        debug!("Job {} {:?} as pid {:?}", job_id, JobState::Spawned, child.id());

        let budget = self.budget_for(spec);
        let status = match self.watch(job_id, &mut child, started, budget).await {
            Ok(Some(status)) => status,
            Ok(None) => {
                return (
                    JobState::TimedOut,
                    JobResult::failed_process(format!(
                        "killed after timeout ({:.1}s budget); exitcode={}",
                        budget.as_secs_f64(),
                        KILLED_EXIT_CODE
                    )),
                )
            }
            Err(e) => {
                let _ = child.kill().await;
                return (
                    JobState::Failed,
                    JobResult::failed_process(format!("lost track of worker: {}", e)),
                );
            }
        };

        let code = exit_code(status);
        if code != 0 {
            warn!("Job {} worker exited with code {}", job_id, code);
            return (
                JobState::Failed,
                JobResult::failed_process(format!("worker exited abnormally; exitcode={}", code)),
            );
        }

        match FileChannel::new(&output, self.io_timeout)
            .recv::<WorkerReport>(JOB_RESULT_SCHEMA)
            .await
        {
            Ok(reply) if reply.job_id == job_id => {
                (JobState::Completed, JobResult::from_report(reply.payload))
            }
            Ok(reply) => (
                JobState::Failed,
                JobResult::failed_process(format!(
                    "result belongs to job {}, expected {}; exitcode=0",
                    reply.job_id, job_id
                )),
            ),
            Err(e) => (
                JobState::Failed,
                JobResult::failed_process(format!("no parseable result: {}; exitcode=0", e)),
            ),
        }
    }

    /// Poll the child once per tick. `Ok(None)` means the budget ran out and
    /// the child has been terminated.
    async fn watch(
        &self,
        job_id: Uuid,
        child: &mut Child,
        started: Instant,
        budget: Duration,
    ) -> std::io::Result<Option<ExitStatus>> {
        debug!("Job {} {:?}, budget {:.1}s", job_id, JobState::Running, budget.as_secs_f64());
        let mut tick = tokio::time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if started.elapsed() > budget {
                warn!(
                    "Job {} exceeded {:.1}s, terminating worker (pid {:?})",
                    job_id,
                    budget.as_secs_f64(),
                    child.id()
                );
                self.terminate(child).await;
                return Ok(None);
            }
        }
    }

    /// SIGTERM, then SIGKILL if the child is still there after `kill_wait`.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                if let Ok(Ok(_)) = tokio::time::timeout(self.kill_wait, child.wait()).await {
                    return;
                }
            }
        }
        if let Err(e) = child.kill().await {
            warn!("Failed to kill worker: {}", e);
        }
    }
}

/// Exit code, or `128 + signal` for a signalled process (the shell
/// convention), so a signal death never reads as `KILLED_EXIT_CODE`.
fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use kmh_types::{DistanceMatrix, RunStatus};
    use std::sync::Arc;

    fn spec(time_limit: f64) -> JobSpec {
        let d = DistanceMatrix::from_rows(vec![vec![0.0, 1.0], vec![1.0, 0.0]]).unwrap();
        JobSpec::new(Arc::new(d), 1, time_limit)
    }

    fn supervisor(script: &str, grace: f64) -> Supervisor {
        let config = HarnessConfig::default()
            .with_grace_period(grace)
            .with_kill_wait(0.5)
            .with_poll_interval_ms(20);
        Supervisor::new(WorkerCommand::new("sh", ["-c", script]), &config)
    }

    #[tokio::test]
    async fn hung_worker_is_killed_after_budget() {
        let sup = supervisor("exec sleep 30", 0.3);
        let outcome = sup.run_job(&spec(0.2)).await;

        assert_eq!(outcome.state, JobState::TimedOut);
        assert_eq!(outcome.result.status, RunStatus::FailedProcess);
        assert!(outcome.result.fail_reason.contains("exitcode=-9"));
        assert!(outcome.wall_time < Duration::from_secs(5));
        assert!(outcome.wall_time >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn worker_ignoring_sigterm_is_force_killed() {
        let sup = supervisor("trap '' TERM; while true; do sleep 0.05; done", 0.1);
        let outcome = sup.run_job(&spec(0.1)).await;

        assert_eq!(outcome.state, JobState::TimedOut);
        assert!(outcome.result.fail_reason.contains("exitcode=-9"));
        assert!(outcome.wall_time < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn crashing_worker_reports_exit_code() {
        let sup = supervisor("exit 3", 5.0);
        let outcome = sup.run_job(&spec(1.0)).await;

        assert_eq!(outcome.state, JobState::Failed);
        assert_eq!(outcome.result.status, RunStatus::FailedProcess);
        assert!(outcome.result.fail_reason.contains("exitcode=3"));
        assert!(outcome.result.objective_total.is_nan());
    }

    #[tokio::test]
    async fn signalled_worker_is_not_mistaken_for_a_timeout_kill() {
        let sup = supervisor("kill -KILL $$", 5.0);
        let outcome = sup.run_job(&spec(1.0)).await;
        assert_eq!(outcome.state, JobState::Failed);
        assert!(outcome.result.fail_reason.contains("exitcode=137"));
        assert!(!outcome
            .result
            .fail_reason
            .contains(&format!("exitcode={}", KILLED_EXIT_CODE)));
    }

    #[test]
    fn worker_command_carries_io_timeout() {
        let command = WorkerCommand::new("kmh", ["worker"]);
        let cmd = command.build(
            Path::new("in.json"),
            Path::new("out.json"),
            Duration::from_millis(2500),
        );
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            ["worker", "--input", "in.json", "--output", "out.json", "--io-timeout", "2.5"]
        );
    }

    #[tokio::test]
    async fn clean_exit_without_result_is_failed_process() {
        let sup = supervisor("exit 0", 5.0);
        let outcome = sup.run_job(&spec(1.0)).await;

        assert_eq!(outcome.state, JobState::Failed);
        assert_eq!(outcome.result.status, RunStatus::FailedProcess);
        assert!(outcome.result.fail_reason.contains("no parseable result"));
    }

    #[tokio::test]
    async fn missing_program_is_failed_process() {
        let config = HarnessConfig::default().with_poll_interval_ms(20);
        let sup = Supervisor::new(
            WorkerCommand::new("/nonexistent/kmh-worker", Vec::<String>::new()),
            &config,
        );
        let outcome = sup.run_job(&spec(1.0)).await;
        assert_eq!(outcome.result.status, RunStatus::FailedProcess);
        assert!(outcome.result.fail_reason.contains("failed to spawn"));
    }

    #[test]
    fn budget_adds_grace() {
        let sup = supervisor("true", 30.0);
        assert_eq!(sup.budget_for(&spec(600.0)), Duration::from_secs(630));
    }
}
