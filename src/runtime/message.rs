//! Message contract and redundancy helpers
//!
//! Every message entering or leaving the runtime carries its own redundancy
//! data — a second copy of the payload, or a digest of it — so that each hop
//! can independently verify the payload survived transport and handling. The
//! runtime treats messages through the object-safe [`Message`] trait;
//! [`RedundancySlot`], [`VerifiedClone`] and [`Digest`] cover the recurring
//! parts of an implementation.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A unit of input or output for the runtime.
///
/// Implementations must keep the payload verifiable against redundancy data
/// stored on the instance, and must be clonable as trait objects so the
/// unprotected path can snapshot them.
///
/// Handlers receive messages by shared reference and must treat them as
/// read-only; the runtime re-verifies the input after handling and raises
/// `InputMessage` corruption if it changed.
pub trait Message: Any + fmt::Debug + Send {
    /// Check the payload against previously stored redundancy data.
    ///
    /// Returns false when no redundancy data was ever stored: a message
    /// without its verification data is indistinguishable from a corrupted
    /// one.
    fn verify(&self) -> bool;

    /// Extract canonical verification data from `other` and store it on
    /// `self`.
    ///
    /// Only the first call per instance may take effect; later calls must be
    /// ignored so that already-attached verification data cannot be replaced
    /// with data derived from a corrupted copy. Routing the stored data
    /// through a [`RedundancySlot`] provides this.
    fn store_replica(&mut self, other: &dyn Message);

    /// Clone this message as a trait object.
    ///
    /// The typical implementation is `Box::new(deep::clone(self))`.
    fn clone_message(&self) -> Box<dyn Message>;

    /// Take the pre-verified clone of this message, if one was memoized.
    ///
    /// A layer above the runtime may clone and verify a message off the
    /// dispatch path and park the result here; dispatch then skips its own
    /// clone-and-verify step. The default has no memoization.
    fn take_verified_clone(&mut self) -> Option<Box<dyn Message>> {
        None
    }

    /// Memoize a pre-verified clone of this message.
    ///
    /// At most one clone may ever be stored per instance; implementations
    /// backed by [`VerifiedClone`] ignore later calls. The default discards
    /// the clone.
    fn set_verified_clone(&mut self, clone: Box<dyn Message>) {
        let _ = clone;
    }
}

/// Write-once holder for a message's redundancy data.
///
/// The first [`store`](RedundancySlot::store) wins; every later call is
/// ignored. This protects verification data that is already attached from
/// being overwritten by data extracted from a corrupted copy.
#[derive(Debug, Clone, Default)]
pub struct RedundancySlot<T> {
    value: Option<T>,
}

impl<T> RedundancySlot<T> {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self { value: None }
    }

    /// Store redundancy data, unless some was already stored.
    pub fn store(&mut self, value: T) {
        if self.value.is_none() {
            self.value = Some(value);
        }
    }

    /// The stored redundancy data, if any.
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// True once redundancy data has been stored.
    pub fn is_stored(&self) -> bool {
        self.value.is_some()
    }
}

/// Write-once holder for a message's memoized, pre-verified clone.
///
/// Transient: deep-cloning a message must produce a fresh, empty slot.
#[derive(Default)]
pub struct VerifiedClone {
    slot: Option<Box<dyn Message>>,
    sealed: bool,
}

impl VerifiedClone {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a pre-verified clone; ignored if one was ever stored before.
    pub fn set(&mut self, message: Box<dyn Message>) {
        if !self.sealed {
            self.slot = Some(message);
            self.sealed = true;
        }
    }

    /// Take the parked clone, leaving the slot sealed.
    pub fn take(&mut self) -> Option<Box<dyn Message>> {
        self.slot.take()
    }
}

impl fmt::Debug for VerifiedClone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifiedClone")
            .field("present", &self.slot.is_some())
            .field("sealed", &self.sealed)
            .finish()
    }
}

/// Content digest usable as compact redundancy data.
///
/// Messages that are too large to carry a full second copy of their payload
/// can store a digest of the payload's canonical bytes instead and verify
/// against it. The digest travels with the message to the next hop, so it
/// serializes alongside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Digest of the given canonical byte representation.
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::deep::{DeepClone, DeepEquals};

    #[derive(Debug)]
    struct Ping {
        seq: u64,
        redundancy: RedundancySlot<u64>,
    }

    impl DeepClone for Ping {
        fn clone_deep(&self) -> Self {
            Ping {
                seq: self.seq,
                redundancy: self.redundancy.clone(),
            }
        }
    }

    impl DeepEquals for Ping {
        fn equals_deep(&self, other: &Self) -> bool {
            // Redundancy data is non-semantic.
            self.seq == other.seq
        }
    }

    impl Message for Ping {
        fn verify(&self) -> bool {
            self.redundancy.get() == Some(&self.seq)
        }

        fn store_replica(&mut self, other: &dyn Message) {
            if let Some(other) = (other as &dyn Any).downcast_ref::<Ping>() {
                self.redundancy.store(other.seq);
            }
        }

        fn clone_message(&self) -> Box<dyn Message> {
            Box::new(self.clone_deep())
        }
    }

    #[test]
    fn test_redundancy_slot_is_write_once() {
        let mut slot = RedundancySlot::new();
        assert!(!slot.is_stored());
        slot.store(5u64);
        slot.store(9);
        assert_eq!(slot.get(), Some(&5));
    }

    #[test]
    fn test_verify_requires_stored_redundancy() {
        let mut ping = Ping {
            seq: 3,
            redundancy: RedundancySlot::new(),
        };
        assert!(!ping.verify());

        let copy = ping.clone_message();
        ping.store_replica(copy.as_ref());
        assert!(ping.verify());
    }

    #[test]
    fn test_store_replica_keeps_first_data() {
        let mut ping = Ping {
            seq: 3,
            redundancy: RedundancySlot::new(),
        };
        let good = ping.clone_message();
        ping.store_replica(good.as_ref());

        let corrupted = Ping {
            seq: 4,
            redundancy: RedundancySlot::new(),
        };
        ping.store_replica(&corrupted);
        assert!(ping.verify());
    }

    #[test]
    fn test_verified_clone_is_write_once() {
        let mut slot = VerifiedClone::new();
        slot.set(Box::new(Ping {
            seq: 1,
            redundancy: RedundancySlot::new(),
        }));
        slot.set(Box::new(Ping {
            seq: 2,
            redundancy: RedundancySlot::new(),
        }));

        let taken = slot.take().expect("first clone parked");
        let ping = (taken.as_ref() as &dyn Any)
            .downcast_ref::<Ping>()
            .expect("parked clone keeps its type");
        assert_eq!(ping.seq, 1);
        assert!(slot.take().is_none());
    }

    #[test]
    fn test_digest_distinguishes_payloads() {
        let a = Digest::of(b"payload-a");
        let b = Digest::of(b"payload-b");
        assert_eq!(a, Digest::of(b"payload-a"));
        assert_ne!(a, b);
    }
}
