//! Canonical SQLite schema for the slot store.
//!
//! - `slots` holds one row per `(task_id, slot_num)`; the status/field
//!   pairing rules are enforced with `CHECK` constraints so no writer can
//!   persist a half-claimed or half-completed slot
//! - `store_meta` records the schema version and creation time

/// Migration v1: slot table plus store metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS slots (
    task_id INTEGER NOT NULL,
    slot_num INTEGER NOT NULL CHECK (slot_num >= 1),
    status TEXT NOT NULL DEFAULT 'available'
        CHECK (status IN ('available', 'in_progress', 'completed')),
    claimed_by TEXT,
    claimed_at_us INTEGER,
    completed_by TEXT,
    completed_at_us INTEGER,
    version INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (task_id, slot_num),
    CHECK (
        (status = 'in_progress' AND claimed_by IS NOT NULL AND claimed_at_us IS NOT NULL)
        OR (status <> 'in_progress' AND claimed_by IS NULL AND claimed_at_us IS NULL)
    ),
    CHECK (
        (status = 'completed' AND completed_by IS NOT NULL AND completed_at_us IS NOT NULL)
        OR (status <> 'completed' AND completed_by IS NULL AND completed_at_us IS NULL)
    )
);

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    created_at_us INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO store_meta (
    id,
    schema_version,
    created_at_us
) VALUES (1, 1, CAST((julianday('now') - 2440587.5) * 86400000000 AS INTEGER));
";

/// Migration v2: read-path indexes for claim scans and per-worker counts.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_slots_status_task
    ON slots(status, task_id, slot_num);

CREATE INDEX IF NOT EXISTS idx_slots_claimed_by
    ON slots(claimed_by)
    WHERE claimed_by IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_slots_completed_by
    ON slots(completed_by)
    WHERE completed_by IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_slots_claimed_at
    ON slots(claimed_at_us)
    WHERE status = 'in_progress';
";

/// Indexes expected after all migrations have run.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_slots_status_task",
    "idx_slots_claimed_by",
    "idx_slots_completed_by",
    "idx_slots_claimed_at",
];
