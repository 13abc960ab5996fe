//! Batch configuration threaded from the CLI down to every job.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{KmhError, KmhResult};

/// Solver tuning forwarded verbatim into every [`crate::JobSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverTuning {
    /// Registered solver name ("exact" or "grasp").
    pub name: String,
    /// Worker threads for the solver; `None` lets the solver decide.
    pub threads: Option<usize>,
    pub seed: Option<u64>,
    /// Memory cap in megabytes; `None` = unlimited.
    pub memlimit_mb: Option<f64>,
    /// Solver verbosity, 0 = silent.
    pub output_flag: i32,
}

impl Default for SolverTuning {
    fn default() -> Self {
        Self {
            name: "exact".to_string(),
            threads: None,
            seed: Some(42),
            memlimit_mb: Some(16000.0),
            output_flag: 1,
        }
    }
}

/// When the result table is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointGranularity {
    /// After every finished job: maximal recoverability.
    PerJob,
    /// After every finished instance: fewer rewrites.
    PerInstance,
}

impl Default for CheckpointGranularity {
    fn default() -> Self {
        Self::PerInstance
    }
}

/// Top-level configuration of a batch campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Directory scanned for instance files.
    pub instance_dir: PathBuf,
    /// Accepted instance file extensions, matched case-insensitively.
    pub extensions: Vec<String>,
    /// Cluster counts to solve for every instance, in this order.
    pub ks: Vec<usize>,
    pub output_dir: PathBuf,
    pub checkpoint_file: String,

    /// Solver budget per job.
    pub time_limit_sec: f64,
    /// Extra wall time granted before the watchdog fires.
    pub grace_period_sec: f64,
    /// Wait between the graceful and the forced termination.
    pub kill_wait_sec: f64,
    /// Liveness polling tick, must stay below one second.
    pub poll_interval_ms: u64,
    /// Timeout on each read/write of the worker channel.
    pub io_timeout_sec: f64,

    pub checkpoint: CheckpointGranularity,
    /// Maximum number of worker processes alive at once.
    pub pool_size: usize,
    /// Skip jobs already present in an existing checkpoint.
    pub resume: bool,
    /// Only use the first N data rows of each instance.
    pub max_points: Option<usize>,

    pub solver: SolverTuning,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            instance_dir: PathBuf::from("instances/general"),
            extensions: vec!["i".to_string()],
            ks: vec![3, 4, 5, 6],
            output_dir: PathBuf::from("results"),
            checkpoint_file: "kmedoids_all_runs.csv".to_string(),
            time_limit_sec: 600.0,
            grace_period_sec: 30.0,
            kill_wait_sec: 2.0,
            poll_interval_ms: 200,
            io_timeout_sec: 30.0,
            checkpoint: CheckpointGranularity::default(),
            pool_size: 1,
            resume: false,
            max_points: None,
            solver: SolverTuning::default(),
        }
    }
}

impl HarnessConfig {
    /// Read a JSON config file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> KmhResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn with_instance_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.instance_dir = dir.into();
        self
    }

    pub fn with_ks(mut self, ks: Vec<usize>) -> Self {
        self.ks = ks;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_time_limit(mut self, seconds: f64) -> Self {
        self.time_limit_sec = seconds;
        self
    }

    pub fn with_grace_period(mut self, seconds: f64) -> Self {
        self.grace_period_sec = seconds;
        self
    }

    pub fn with_kill_wait(mut self, seconds: f64) -> Self {
        self.kill_wait_sec = seconds;
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_checkpoint(mut self, granularity: CheckpointGranularity) -> Self {
        self.checkpoint = granularity;
        self
    }

    pub fn with_pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_solver(mut self, solver: SolverTuning) -> Self {
        self.solver = solver;
        self
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.output_dir.join(&self.checkpoint_file)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_secs_f64(self.kill_wait_sec)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.io_timeout_sec)
    }

    pub fn validate(&self) -> KmhResult<()> {
        let positive = |name: &str, v: f64| -> KmhResult<()> {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(KmhError::Config(format!("{name} must be > 0, got {v}")))
            }
        };
        positive("time_limit_sec", self.time_limit_sec)?;
        positive("grace_period_sec", self.grace_period_sec)?;
        positive("kill_wait_sec", self.kill_wait_sec)?;
        positive("io_timeout_sec", self.io_timeout_sec)?;

        if self.poll_interval_ms == 0 || self.poll_interval_ms >= 1000 {
            return Err(crate::config_error!(
                "poll_interval_ms must be in 1..1000, got {}",
                self.poll_interval_ms
            ));
        }
        if self.ks.is_empty() {
            return Err(crate::config_error!("at least one k value is required"));
        }
        if self.ks.contains(&0) {
            return Err(crate::config_error!("k values must be >= 1"));
        }
        if self.pool_size == 0 {
            return Err(crate::config_error!("pool_size must be >= 1"));
        }
        if self.extensions.is_empty() {
            return Err(crate::config_error!("at least one instance extension is required"));
        }
        if self.max_points == Some(0) {
            return Err(crate::config_error!("max_points must be >= 1 when set"));
        }
        if self.checkpoint_file.trim().is_empty() {
            return Err(crate::config_error!("checkpoint_file must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = HarnessConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ks, vec![3, 4, 5, 6]);
        assert_eq!(config.checkpoint, CheckpointGranularity::PerInstance);
        assert_eq!(config.kill_wait(), Duration::from_secs(2));
        assert_eq!(
            config.checkpoint_path(),
            PathBuf::from("results/kmedoids_all_runs.csv")
        );
    }

    #[test]
    fn validation_rejects_bad_budgets() {
        assert!(HarnessConfig::default().with_time_limit(0.0).validate().is_err());
        assert!(HarnessConfig::default().with_grace_period(-1.0).validate().is_err());
        assert!(HarnessConfig::default().with_poll_interval_ms(1000).validate().is_err());
        assert!(HarnessConfig::default().with_ks(vec![]).validate().is_err());
        assert!(HarnessConfig::default().with_ks(vec![2, 0]).validate().is_err());
        assert!(HarnessConfig::default().with_pool_size(0).validate().is_err());
    }

    #[test]
    fn json_file_overrides_selected_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"ks": [2, 3], "checkpoint": "per_job", "solver": {{"name": "grasp", "threads": 2,
                "seed": null, "memlimit_mb": null, "output_flag": 0}}}}"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = HarnessConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.ks, vec![2, 3]);
        assert_eq!(config.checkpoint, CheckpointGranularity::PerJob);
        assert_eq!(config.solver.name, "grasp");
        assert_eq!(config.solver.threads, Some(2));
        assert_eq!(config.time_limit_sec, 600.0);
    }
}
