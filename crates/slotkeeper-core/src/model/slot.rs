use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The three slot lifecycle states.
///
/// `completed` is terminal: nothing moves a slot out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Available,
    InProgress,
    Completed,
}

impl SlotStatus {
    /// Stable storage/wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    /// Returns `true` for states that count against a task's slot budget.
    #[must_use]
    pub const fn is_occupied(self) -> bool {
        matches!(self, Self::InProgress | Self::Completed)
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Error returned when parsing a [`SlotStatus`] from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStatusError {
    pub got: String,
}

impl fmt::Display for ParseStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid slot status: '{}' (expected available, in_progress, completed)",
            self.got
        )
    }
}

impl std::error::Error for ParseStatusError {}

impl FromStr for SlotStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "available" => Ok(Self::Available),
            "in_progress" | "in-progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            _ => Err(ParseStatusError { got: s.to_string() }),
        }
    }
}

/// Identity of one slot: the `slot_num`-th independent rating of `task_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotKey {
    pub task_id: i64,
    pub slot_num: u32,
}

impl SlotKey {
    #[must_use]
    pub const fn new(task_id: i64, slot_num: u32) -> Self {
        Self { task_id, slot_num }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} slot {}", self.task_id, self.slot_num)
    }
}

/// A persisted slot record.
///
/// `claimed_by`/`claimed_at` are set exactly when the slot is in progress;
/// `completed_by`/`completed_at` are set exactly when it is completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub task_id: i64,
    pub slot_num: u32,
    pub status: SlotStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped on every applied conditional update.
    #[serde(default)]
    pub version: u64,
}

impl Slot {
    /// A never-claimed slot.
    #[must_use]
    pub const fn available(key: SlotKey) -> Self {
        Self {
            task_id: key.task_id,
            slot_num: key.slot_num,
            status: SlotStatus::Available,
            claimed_by: None,
            claimed_at: None,
            completed_by: None,
            completed_at: None,
            version: 0,
        }
    }

    #[must_use]
    pub const fn key(&self) -> SlotKey {
        SlotKey::new(self.task_id, self.slot_num)
    }

    /// Returns `true` when `worker_id` currently holds or has completed this slot.
    #[must_use]
    pub fn is_held_by(&self, worker_id: &str) -> bool {
        match self.status {
            SlotStatus::Available => false,
            SlotStatus::InProgress => self.claimed_by.as_deref() == Some(worker_id),
            SlotStatus::Completed => self.completed_by.as_deref() == Some(worker_id),
        }
    }

    /// The worker associated with the slot's current state, if any.
    #[must_use]
    pub fn holder(&self) -> Option<&str> {
        match self.status {
            SlotStatus::Available => None,
            SlotStatus::InProgress => self.claimed_by.as_deref(),
            SlotStatus::Completed => self.completed_by.as_deref(),
        }
    }

    /// Time elapsed since the claim, when in progress.
    #[must_use]
    pub fn held_for(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        match (self.status, self.claimed_at) {
            (SlotStatus::InProgress, Some(at)) => Some(now - at),
            _ => None,
        }
    }

    /// Check the field-pairing rules for the current status.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let claimed = (self.claimed_by.is_some(), self.claimed_at.is_some());
        let completed = (self.completed_by.is_some(), self.completed_at.is_some());

        let ok = match self.status {
            SlotStatus::Available => claimed == (false, false) && completed == (false, false),
            SlotStatus::InProgress => claimed == (true, true) && completed == (false, false),
            SlotStatus::Completed => claimed == (false, false) && completed == (true, true),
        };

        if self.slot_num == 0 {
            return Err(InvariantViolation {
                key: self.key(),
                reason: "slot numbers start at 1",
            });
        }

        if ok {
            Ok(())
        } else {
            Err(InvariantViolation {
                key: self.key(),
                reason: match self.status {
                    SlotStatus::Available => "available slot carries claim or completion fields",
                    SlotStatus::InProgress => {
                        "in-progress slot must have claimed_by and claimed_at and no completion"
                    }
                    SlotStatus::Completed => {
                        "completed slot must have completed_by and completed_at and no claim"
                    }
                },
            })
        }
    }
}

/// A slot record whose fields disagree with its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    pub key: SlotKey,
    pub reason: &'static str,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.reason)
    }
}

impl std::error::Error for InvariantViolation {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    fn in_progress(worker: &str) -> Slot {
        Slot {
            status: SlotStatus::InProgress,
            claimed_by: Some(worker.to_string()),
            claimed_at: Some(at(9, 0)),
            ..Slot::available(SlotKey::new(2, 1))
        }
    }

    #[test]
    fn status_display_parse_roundtrips() {
        for status in [
            SlotStatus::Available,
            SlotStatus::InProgress,
            SlotStatus::Completed,
        ] {
            let parsed: SlotStatus = status.to_string().parse().expect("parse");
            assert_eq!(parsed, status);
        }
        assert!("pending".parse::<SlotStatus>().is_err());
        assert_eq!(
            "In-Progress".parse::<SlotStatus>(),
            Ok(SlotStatus::InProgress)
        );
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&SlotStatus::InProgress).expect("serialize");
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn slot_json_uses_external_field_names() {
        let json = serde_json::to_value(in_progress("worker-a")).expect("serialize");
        assert_eq!(json["taskId"], 2);
        assert_eq!(json["slotNum"], 1);
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["claimedBy"], "worker-a");
        assert_eq!(json["claimedAt"], "2024-03-01T09:00:00Z");
        assert!(json["completedBy"].is_null());
    }

    #[test]
    fn holder_tracks_status() {
        let slot = in_progress("worker-a");
        assert!(slot.is_held_by("worker-a"));
        assert!(!slot.is_held_by("worker-b"));
        assert_eq!(slot.holder(), Some("worker-a"));

        let done = Slot {
            status: SlotStatus::Completed,
            claimed_by: None,
            claimed_at: None,
            completed_by: Some("worker-a".to_string()),
            completed_at: Some(at(9, 30)),
            ..slot
        };
        assert!(done.is_held_by("worker-a"));
        assert!(Slot::available(SlotKey::new(1, 1)).holder().is_none());
    }

    #[test]
    fn held_for_only_applies_in_progress() {
        let slot = in_progress("worker-a");
        assert_eq!(
            slot.held_for(at(11, 5)),
            Some(chrono::Duration::minutes(125))
        );
        assert_eq!(Slot::available(SlotKey::new(1, 1)).held_for(at(11, 5)), None);
    }

    #[test]
    fn invariants_reject_mismatched_fields() {
        assert!(in_progress("w").check_invariants().is_ok());
        assert!(Slot::available(SlotKey::new(1, 3)).check_invariants().is_ok());

        let half_claimed = Slot {
            claimed_at: None,
            ..in_progress("w")
        };
        assert!(half_claimed.check_invariants().is_err());

        let stale_available = Slot {
            status: SlotStatus::Available,
            ..in_progress("w")
        };
        assert!(stale_available.check_invariants().is_err());

        let zero = Slot::available(SlotKey::new(1, 0));
        assert_eq!(
            zero.check_invariants().map_err(|e| e.reason),
            Err("slot numbers start at 1")
        );
    }
}
