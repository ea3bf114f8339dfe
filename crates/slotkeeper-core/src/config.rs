use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Project-relative directory holding config and the default database.
pub const STATE_DIR: &str = ".slotkeeper";

/// Environment variable overriding `store.path`.
pub const DB_ENV: &str = "SLOTKEEPER_DB";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotkeeperConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub allocation: AllocationConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path; relative paths resolve against the project root.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Independent ratings required per task (K).
    #[serde(default = "default_slot_count")]
    pub slot_count: u32,
    /// Tasks a single worker may claim or complete across the deployment.
    #[serde(default = "default_max_tasks_per_worker")]
    pub max_tasks_per_worker: u32,
    /// CAS attempts before a claim gives up with a transient conflict.
    #[serde(default = "default_max_claim_attempts")]
    pub max_claim_attempts: u32,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            slot_count: default_slot_count(),
            max_tasks_per_worker: default_max_tasks_per_worker(),
            max_claim_attempts: default_max_claim_attempts(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// In-progress claims older than this are reclaimed.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Pause between passes when sweeping periodically.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_timeout_minutes(),
            interval_secs: default_interval_secs(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Absolute database path for a project rooted at `project_root`.
    #[must_use]
    pub fn resolved_path(&self, project_root: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            project_root.join(&self.path)
        }
    }
}

impl SweepConfig {
    /// The reclaim window as a chrono duration.
    #[must_use]
    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::try_from(self.timeout_minutes).unwrap_or(i64::MAX / 60_000))
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl SlotkeeperConfig {
    /// Reject values that make the protocol meaningless.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.allocation.slot_count == 0 {
            bail!("allocation.slot_count must be at least 1");
        }
        if self.allocation.max_tasks_per_worker == 0 {
            bail!("allocation.max_tasks_per_worker must be at least 1");
        }
        if self.allocation.max_claim_attempts == 0 {
            bail!("allocation.max_claim_attempts must be at least 1");
        }
        if self.sweep.timeout_minutes == 0 {
            bail!("sweep.timeout_minutes must be at least 1");
        }
        if self.sweep.interval_secs == 0 {
            bail!("sweep.interval_secs must be at least 1");
        }
        Ok(())
    }
}

fn parse_config_file(path: &Path) -> Result<SlotkeeperConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<SlotkeeperConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load `<project_root>/.slotkeeper/config.toml`, if present.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_project_config(project_root: &Path) -> Result<Option<SlotkeeperConfig>> {
    let path = project_root.join(STATE_DIR).join("config.toml");
    if !path.exists() {
        return Ok(None);
    }
    parse_config_file(&path).map(Some)
}

/// Load `<config_dir>/slotkeeper/config.toml`, if present.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_user_config() -> Result<Option<SlotkeeperConfig>> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(None);
    };

    let path = config_dir.join("slotkeeper/config.toml");
    if !path.exists() {
        return Ok(None);
    }
    parse_config_file(&path).map(Some)
}

/// Resolve the effective configuration.
///
/// Precedence (highest wins): `explicit` file > project file > user file >
/// defaults. `SLOTKEEPER_DB` then overrides `store.path`.
///
/// # Errors
///
/// Returns an error if a config file cannot be parsed or the result is invalid.
pub fn resolve_config(project_root: &Path, explicit: Option<&Path>) -> Result<SlotkeeperConfig> {
    let env_db = env::var(DB_ENV).ok().filter(|v| !v.trim().is_empty());
    resolve_config_with(project_root, explicit, env_db.as_deref(), load_user_config)
}

fn resolve_config_with(
    project_root: &Path,
    explicit: Option<&Path>,
    env_db: Option<&str>,
    user: impl FnOnce() -> Result<Option<SlotkeeperConfig>>,
) -> Result<SlotkeeperConfig> {
    let mut config = if let Some(path) = explicit {
        parse_config_file(path)?
    } else if let Some(project) = load_project_config(project_root)? {
        project
    } else {
        user()?.unwrap_or_default()
    };

    if let Some(db) = env_db {
        config.store.path = PathBuf::from(db);
    }

    config.validate()?;
    Ok(config)
}

fn default_store_path() -> PathBuf {
    Path::new(STATE_DIR).join("slots.sqlite3")
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_slot_count() -> u32 {
    3
}

const fn default_max_tasks_per_worker() -> u32 {
    10
}

const fn default_max_claim_attempts() -> u32 {
    5
}

const fn default_timeout_minutes() -> u64 {
    120
}

const fn default_interval_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_with_config(content: Option<&str>) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("temp dir");
        if let Some(content) = content {
            let state = dir.path().join(STATE_DIR);
            std::fs::create_dir_all(&state).expect("create state dir");
            std::fs::write(state.join("config.toml"), content).expect("write config");
        }
        dir
    }

    fn no_user() -> Result<Option<SlotkeeperConfig>> {
        Ok(None)
    }

    #[test]
    fn missing_config_uses_defaults() {
        let dir = project_with_config(None);
        let cfg = resolve_config_with(dir.path(), None, None, no_user).expect("resolve");
        assert_eq!(cfg, SlotkeeperConfig::default());
        assert_eq!(cfg.allocation.slot_count, 3);
        assert_eq!(cfg.allocation.max_claim_attempts, 5);
        assert_eq!(cfg.sweep.timeout(), chrono::Duration::hours(2));
        assert_eq!(
            cfg.store.resolved_path(dir.path()),
            dir.path().join(".slotkeeper/slots.sqlite3")
        );
    }

    #[test]
    fn partial_project_config_keeps_other_defaults() {
        let dir = project_with_config(Some(
            r#"
[allocation]
slot_count = 5

[sweep]
timeout_minutes = 30
"#,
        ));
        let cfg = resolve_config_with(dir.path(), None, None, no_user).expect("resolve");
        assert_eq!(cfg.allocation.slot_count, 5);
        assert_eq!(cfg.allocation.max_tasks_per_worker, 10);
        assert_eq!(cfg.sweep.timeout_minutes, 30);
        assert_eq!(cfg.store.busy_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn project_config_wins_over_user_config() {
        let dir = project_with_config(Some("[allocation]\nslot_count = 4\n"));
        let cfg = resolve_config_with(dir.path(), None, None, || {
            let mut user = SlotkeeperConfig::default();
            user.allocation.slot_count = 9;
            Ok(Some(user))
        })
        .expect("resolve");
        assert_eq!(cfg.allocation.slot_count, 4);
    }

    #[test]
    fn user_config_applies_without_project_file() {
        let dir = project_with_config(None);
        let cfg = resolve_config_with(dir.path(), None, None, || {
            let mut user = SlotkeeperConfig::default();
            user.sweep.timeout_minutes = 45;
            Ok(Some(user))
        })
        .expect("resolve");
        assert_eq!(cfg.sweep.timeout_minutes, 45);
    }

    #[test]
    fn explicit_file_and_env_db_override() {
        let dir = project_with_config(Some("[allocation]\nslot_count = 4\n"));
        let explicit = dir.path().join("other.toml");
        std::fs::write(&explicit, "[store]\npath = \"/srv/slots.db\"\n").expect("write");

        let cfg = resolve_config_with(dir.path(), Some(&explicit), None, no_user).expect("resolve");
        assert_eq!(cfg.allocation.slot_count, 3);
        assert_eq!(cfg.store.path, PathBuf::from("/srv/slots.db"));

        let cfg = resolve_config_with(dir.path(), Some(&explicit), Some("/tmp/x.db"), no_user)
            .expect("resolve");
        assert_eq!(cfg.store.resolved_path(dir.path()), PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = project_with_config(Some("[allocation]\nslot_count = 0\n"));
        let err = resolve_config_with(dir.path(), None, None, no_user).unwrap_err();
        assert!(err.to_string().contains("slot_count"));

        let dir = project_with_config(Some("[sweep]\ntimeout_minutes = \"soon\"\n"));
        let err = resolve_config_with(dir.path(), None, None, no_user).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }
}
