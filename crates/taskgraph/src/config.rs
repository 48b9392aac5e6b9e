use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Engine configuration, typically parsed from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of non-exclusive processes alive at once. 0 = num_cpus.
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    /// Sleep between polling rounds when several processes are outstanding.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Timeout applied to processes that do not set their own.
    #[serde(default)]
    pub default_timeout_secs: Option<f64>,
    /// Directory holding shared headers/libraries copied next to sources
    /// before compiling.
    #[serde(default)]
    pub library_dir: Option<PathBuf>,
    /// C compiler used for `.c` sources.
    #[serde(default = "default_cc")]
    pub cc: String,
    /// C++ compiler used for `.cc`, `.cxx` and `.cpp` sources.
    #[serde(default = "default_cxx")]
    pub cxx: String,
    /// JDK whose `bin/java` and `bin/javac` build Java sources; PATH otherwise.
    #[serde(default)]
    pub java_home: Option<PathBuf>,
}

fn default_jobs() -> usize { 0 }
fn default_poll_interval_ms() -> u64 { 10 }
fn default_cc() -> String { "gcc".into() }
fn default_cxx() -> String { "g++".into() }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            poll_interval_ms: default_poll_interval_ms(),
            default_timeout_secs: None,
            library_dir: None,
            cc: default_cc(),
            cxx: default_cxx(),
            java_home: None,
        }
    }
}

impl EngineConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, TaskError> {
        let mut config: Self =
            toml::from_str(toml_str).map_err(|e| TaskError::Config(e.to_string()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TaskError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| TaskError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, TaskError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Resolve job count (0 means use available parallelism).
    pub fn resolved_jobs(&self) -> usize {
        if self.jobs == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.jobs
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs_f64)
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        if let Some(secs) = self.default_timeout_secs {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(TaskError::Config(format!(
                    "default_timeout_secs must be positive, got {secs}"
                )));
            }
        }
        Ok(())
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// - `JUDGEFLOW_JOBS` -> `jobs`
    /// - `JUDGEFLOW_POLL_INTERVAL_MS` -> `poll_interval_ms`
    /// - `JUDGEFLOW_DEFAULT_TIMEOUT_SECS` -> `default_timeout_secs`
    /// - `JUDGEFLOW_LIBRARY_DIR` -> `library_dir`
    /// - `JUDGEFLOW_CC`, `JUDGEFLOW_CXX` -> `cc`, `cxx`
    /// - `JUDGEFLOW_JAVA_HOME` -> `java_home`
    ///
    /// Unparseable numbers are ignored.
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("JUDGEFLOW_JOBS") {
            if let Ok(jobs) = v.parse::<usize>() {
                self.jobs = jobs;
            }
        }
        if let Ok(v) = std::env::var("JUDGEFLOW_POLL_INTERVAL_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                self.poll_interval_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("JUDGEFLOW_DEFAULT_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse::<f64>() {
                self.default_timeout_secs = Some(secs);
            }
        }
        if let Ok(v) = std::env::var("JUDGEFLOW_LIBRARY_DIR") {
            if !v.is_empty() {
                self.library_dir = Some(PathBuf::from(v));
            }
        }
        if let Ok(v) = std::env::var("JUDGEFLOW_CC") {
            if !v.is_empty() {
                self.cc = v;
            }
        }
        if let Ok(v) = std::env::var("JUDGEFLOW_CXX") {
            if !v.is_empty() {
                self.cxx = v;
            }
        }
        if let Ok(v) = std::env::var("JUDGEFLOW_JAVA_HOME") {
            if !v.is_empty() {
                self.java_home = Some(PathBuf::from(v));
            }
        }
    }
}
