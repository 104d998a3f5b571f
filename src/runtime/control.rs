//! Control-flow sentinels for the dual-execution critical section
//!
//! A bit flip in a branch condition can skip one of the two executions or
//! the apply step without leaving any other trace. The critical section
//! therefore threads a small flag structure through its milestones: each
//! checkpoint requires its pair of sentinels to move from `Reset` to `Set`
//! in lockstep, and any deviation is reported as control-flow corruption.
//! The flag reads go through `black_box` so the comparisons survive
//! optimization instead of being folded away as tautologies.

use std::hint::black_box;

use super::error::CorruptionError;

/// One sentinel flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sentinel {
    /// Initial value, before the guarded milestone was reached.
    Reset,
    /// Value after the guarded milestone was passed.
    Set,
}

/// A pair of sentinels that must always agree.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SentinelPair(Sentinel, Sentinel);

impl SentinelPair {
    pub(crate) fn reset() -> Self {
        Self(Sentinel::Reset, Sentinel::Reset)
    }

    pub(crate) fn set() -> Self {
        Self(Sentinel::Set, Sentinel::Set)
    }

    /// Require both flags to still be `Reset` and in agreement, then advance
    /// them to `Set`.
    pub(crate) fn advance(&mut self, label: &'static str) -> Result<(), CorruptionError> {
        let first = black_box(self.0);
        let second = black_box(self.1);
        if first != second || first != Sentinel::Reset {
            return Err(CorruptionError::ControlFlow(format!(
                "{label}: expected paired RESET, found {first:?}/{second:?}"
            )));
        }
        self.0 = Sentinel::Set;
        self.1 = Sentinel::Set;
        Ok(())
    }

    /// Require both flags to be `Set` and in agreement.
    pub(crate) fn confirm_set(&self, label: &'static str) -> Result<(), CorruptionError> {
        let first = black_box(self.0);
        let second = black_box(self.1);
        if first != second || first != Sentinel::Set {
            return Err(CorruptionError::ControlFlow(format!(
                "{label}: expected paired SET, found {first:?}/{second:?}"
            )));
        }
        Ok(())
    }
}

/// The sentinel flags for one dispatch, created per message and passed with
/// exclusive ownership through the critical section.
#[derive(Debug)]
pub(crate) struct ControlFlags {
    /// Pair advanced after the primary execution.
    pub(crate) after_primary: SentinelPair,
    /// Pair advanced after the shadow execution.
    pub(crate) after_shadow: SentinelPair,
    /// Pair advanced after the buffered apply.
    pub(crate) after_apply: SentinelPair,
}

impl ControlFlags {
    pub(crate) fn new() -> Self {
        Self {
            after_primary: SentinelPair::reset(),
            after_shadow: SentinelPair::reset(),
            after_apply: SentinelPair::reset(),
        }
    }
}
