//! Command handlers for `sk`.
//!
//! Each handler takes its clap args plus a [`Context`] carrying the resolved
//! configuration, store location, output mode, and worker flag.

pub mod claim;
pub mod cleanup;
pub mod complete;
pub mod completions;
pub mod init;
pub mod list;
pub mod release;
pub mod stats;

use crate::output::{CliError, OutputMode, render_error};
use crate::worker;
use anyhow::{Context as _, Result};
use slotkeeper_core::admin::Admin;
use slotkeeper_core::alloc::{AllocationPolicy, Allocator};
use slotkeeper_core::clock::SystemClock;
use slotkeeper_core::config::{SlotkeeperConfig, resolve_config};
use slotkeeper_core::error::{ErrorCode, SlotError};
use slotkeeper_core::store::SqliteStore;
use slotkeeper_core::sweep::Sweeper;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type Store = Arc<SqliteStore>;

pub struct Context {
    pub config: SlotkeeperConfig,
    pub db_path: PathBuf,
    pub output: OutputMode,
    worker_flag: Option<String>,
}

impl Context {
    /// Resolve configuration and the store path for a project.
    ///
    /// `--db` wins over `SLOTKEEPER_DB`, which wins over `store.path`.
    pub fn resolve(
        project_root: &Path,
        config_path: Option<&Path>,
        db_flag: Option<&Path>,
        output: OutputMode,
        worker_flag: Option<String>,
    ) -> Result<Self> {
        let config = match resolve_config(project_root, config_path) {
            Ok(config) => config,
            Err(err) => {
                render_error(
                    output,
                    &CliError::with_details(
                        format!("{err:#}"),
                        ErrorCode::ConfigParseError.hint().unwrap_or_default(),
                        ErrorCode::ConfigParseError.code(),
                    ),
                )?;
                return Err(err);
            }
        };

        let db_path = db_flag.map_or_else(
            || config.store.resolved_path(project_root),
            |path| project_root.join(path),
        );

        Ok(Self {
            config,
            db_path,
            output,
            worker_flag,
        })
    }

    /// Open an existing store; `sk init` creates it.
    pub fn open_store(&self) -> Result<Store> {
        if !self.db_path.exists() {
            render_error(
                self.output,
                &CliError::with_details(
                    format!("slot store not found at {}", self.db_path.display()),
                    "run `sk init --tasks N` to create it",
                    "store_missing",
                ),
            )?;
            anyhow::bail!("slot store not found");
        }
        self.open_or_create_store()
    }

    pub fn open_or_create_store(&self) -> Result<Store> {
        let store = SqliteStore::open(&self.db_path, self.config.store.busy_timeout())
            .with_context(|| format!("Failed to open {}", self.db_path.display()))?;
        Ok(Arc::new(store))
    }

    pub fn allocator(&self, store: Store) -> Allocator<Store, SystemClock> {
        Allocator::new(
            store,
            SystemClock,
            AllocationPolicy::from(&self.config.allocation),
        )
    }

    /// Sweeper using the configured window unless `timeout_minutes` overrides it.
    pub fn sweeper(&self, store: Store, timeout_minutes: Option<u64>) -> Sweeper<Store, SystemClock> {
        let mut sweep = self.config.sweep.clone();
        if let Some(minutes) = timeout_minutes {
            sweep.timeout_minutes = minutes;
        }
        Sweeper::new(store, SystemClock, sweep.timeout())
    }

    pub fn admin(&self) -> Result<Admin<Store, SystemClock>> {
        let store = self.open_store()?;
        Ok(Admin::new(
            self.allocator(Arc::clone(&store)),
            self.sweeper(store, None),
        ))
    }

    pub fn worker_flag(&self) -> Option<&str> {
        self.worker_flag.as_deref()
    }

    /// Resolved worker identity, rendering the error when none is set.
    pub fn require_worker(&self) -> Result<String> {
        match worker::require_worker(self.worker_flag()) {
            Ok(worker) => Ok(worker),
            Err(e) => {
                render_error(
                    self.output,
                    &CliError::with_details(
                        &e.message,
                        "Set --worker, SLOTKEEPER_WORKER, or WORKER",
                        e.code,
                    ),
                )?;
                anyhow::bail!("{}", e.message);
            }
        }
    }
}

/// Render a core error and turn it into the command's failure.
pub fn fail(output: OutputMode, err: SlotError) -> anyhow::Error {
    if let Err(render_err) = render_error(output, &CliError::from(&err)) {
        return render_err;
    }
    anyhow::Error::new(err)
}
