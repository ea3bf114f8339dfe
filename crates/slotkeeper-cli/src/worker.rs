//! Worker identity resolution for CLI commands.
//!
//! The resolution chain: `--worker` flag > `SLOTKEEPER_WORKER` env > `WORKER` env.
//! `claim` and `complete` require an identity; operator commands do not.

use slotkeeper_core::error::ErrorCode;
use std::env;

/// Errors from worker resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResolutionError {
    /// Human-readable description.
    pub message: String,
    /// Machine error code.
    pub code: &'static str,
}

impl std::fmt::Display for WorkerResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkerResolutionError {}

/// Environment reader trait for dependency injection in tests.
trait EnvReader {
    fn get(&self, key: &str) -> Option<String>;
}

struct RealEnv;

impl EnvReader for RealEnv {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

fn resolve_worker_with(cli_flag: Option<&str>, env: &dyn EnvReader) -> Option<String> {
    if let Some(worker) = cli_flag.map(str::trim).filter(|w| !w.is_empty()) {
        return Some(worker.to_string());
    }

    ["SLOTKEEPER_WORKER", "WORKER"]
        .into_iter()
        .find_map(|key| env.get(key))
        .map(|worker| worker.trim().to_string())
}

/// Resolve the worker identity, returning an error if none is set.
pub fn require_worker(cli_flag: Option<&str>) -> Result<String, WorkerResolutionError> {
    resolve_worker_with(cli_flag, &RealEnv).ok_or_else(|| WorkerResolutionError {
        message: "Worker identity required for this command. \
                  Set --worker, SLOTKEEPER_WORKER, or WORKER."
            .to_string(),
        code: ErrorCode::MissingWorker.code(),
    })
}
