//! Tandem Runtime – a lockstep dual-execution runtime for corruption-detecting
//! state-machine replicas
//!
//! This crate hardens a deterministic message-handling process against
//! transient in-memory faults (bit flips, stray writes, concurrent-
//! modification bugs) with:
//! - Dual execution: every message is handled twice, against the live state
//!   and against an independently maintained shadow copy
//! - Fine-grained interception: per-field read/write tracking with first-read
//!   cross-checks between the two copies
//! - Symmetry-gated commit: buffered writes become visible only after both
//!   executions touched the same fields and keys, in the same order
//! - Control-flow tripwires: paired sentinel checkpoints that turn skipped
//!   branches into fail-fast faults
//! - Verified outputs: each output message carries the shadow execution's
//!   redundancy data, so the next hop can repeat the whole protocol
//!
//! The runtime performs no I/O: transport, serialization, membership and
//! process lifecycle belong to the embedding system.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runtime core modules implementing the dual-execution protocol
pub mod runtime;

// Re-export key types for convenience
pub use runtime::deep::{DeepClone, DeepEquals, ReadOnly};
pub use runtime::encapsulator::{StateAccess, StateAccessExt};
pub use runtime::error::{AccessError, CorruptionError, RuntimeError};
pub use runtime::failure::{CrashFailureHandler, FailureHandler};
pub use runtime::handler::{Descriptorless, DescriptorlessHandler, MessageHandler};
pub use runtime::message::{Digest, Message, RedundancySlot, VerifiedClone};
pub use runtime::state::{LayoutBuilder, ProcessState, StateLayout};
pub use runtime::Runtime;

/// Current version of the Tandem runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
