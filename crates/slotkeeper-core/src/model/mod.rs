pub mod slot;

pub use slot::{InvariantViolation, ParseStatusError, Slot, SlotKey, SlotStatus};
