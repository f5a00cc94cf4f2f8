// autotune-core/src/core/time.rs
// ============================================================================
// Module: Time Model
// Description: Canonical timestamp representation for traces and run state.
// Purpose: Keep the engine's notion of time explicit and caller-supplied.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! The engine never reads the wall clock itself; every timestamp it operates
//! on is supplied by the caller (the CLI binary, at the top of each tick).
//! This keeps `tick` a pure function of its inputs and makes crash-recovery
//! scenarios (spec scenario 6) reproducible in tests without mocking time.

use serde::Deserialize;
use serde::Serialize;

/// Unix epoch milliseconds, the only timestamp representation the engine
/// deals in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Returns the timestamp as unix milliseconds.
    #[must_use]
    pub const fn as_unix_millis(self) -> i64 {
        self.0
    }

    /// Builds a timestamp from unix milliseconds.
    #[must_use]
    pub const fn from_unix_millis(millis: i64) -> Self {
        Self(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_millis() {
        let earlier = Timestamp::from_unix_millis(100);
        let later = Timestamp::from_unix_millis(200);
        assert!(earlier < later);
    }
}
