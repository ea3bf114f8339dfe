//! slotkeeper-core library.
//!
//! Hands out `K` independent work slots per task to concurrent workers.
//! [`alloc::Allocator`] claims, completes, and releases slots;
//! [`sweep::Sweeper`] reclaims abandoned claims; [`admin::Admin`] serves
//! operators. All of them share one [`store::SlotStore`].

/// # Conventions
///
/// - **Errors**: library operations return [`error::SlotError`]; setup code
///   uses `anyhow::Result`.
/// - **Logging**: Use `tracing` macros (`info!`, `warn!`, `debug!`).
pub mod admin;
pub mod alloc;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod store;
pub mod sweep;

pub use alloc::{AllocationPolicy, Allocator, Claim, CompleteOutcome, ReleaseOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorCode, SlotError};
pub use model::{Slot, SlotKey, SlotStatus};
pub use store::{MemoryStore, SlotStore, SqliteStore};
pub use sweep::{SweepReport, Sweeper};
