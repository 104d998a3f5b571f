//! Per-message-type processing contract
//!
//! Handling is split in two phases. `process_message` may mutate state
//! (through the accessor surface) and produces cheap descriptors;
//! `get_send_messages` is a read-only projection from descriptors to the
//! final output messages. The split lets the engine compare descriptors
//! across the two executions instead of fully materialized messages, and
//! lets each execution side materialize its own outputs independently.

use std::fmt;

use super::deep::{self, DeepClone, DeepEquals};
use super::encapsulator::StateAccess;
use super::error::Result;
use super::message::Message;
use super::state::ProcessState;

/// Processing logic for one concrete message type.
///
/// Registered with [`Runtime::add_handler`](super::Runtime::add_handler);
/// the engine routes messages to it by the concrete type of
/// [`Self::Message`]. Under protection, `process_message` runs twice per
/// dispatch — it must be deterministic with respect to the message and the
/// state it is given, and must perform all state access through the passed
/// accessor surface.
pub trait MessageHandler<S: ProcessState>: Send {
    /// Concrete message type this handler accepts.
    type Message: Message + DeepClone + DeepEquals;

    /// Intermediate value bridging processing to output materialization,
    /// compared pairwise across the two executions.
    type Descriptor: fmt::Debug + DeepEquals;

    /// Applicability precondition, checked before dispatch and re-checked
    /// after the critical section.
    fn guard_predicate(&self, message: &Self::Message) -> bool;

    /// Process a message, mutating state through the accessor surface and
    /// returning descriptors (or `None` for no output).
    fn process_message(
        &mut self,
        message: &Self::Message,
        state: &mut dyn StateAccess,
    ) -> Result<Option<Vec<Self::Descriptor>>>;

    /// Materialize the final output messages from the descriptors.
    ///
    /// Must only read the passed state, never mutate it.
    fn get_send_messages(
        &self,
        state: &S,
        descriptors: Option<&[Self::Descriptor]>,
    ) -> Option<Vec<Box<dyn Message>>>;
}

/// Processing logic whose descriptors are the output messages themselves.
///
/// For handlers with no meaningful intermediate representation; wrap in
/// [`Descriptorless`] to register.
pub trait DescriptorlessHandler<S: ProcessState>: Send {
    /// Concrete message type this handler accepts.
    type Message: Message + DeepClone + DeepEquals;

    /// Concrete output message type.
    type Output: Message + DeepClone + DeepEquals;

    /// Applicability precondition.
    fn guard_predicate(&self, message: &Self::Message) -> bool;

    /// Process a message, producing the output messages directly.
    fn process_message(
        &mut self,
        message: &Self::Message,
        state: &mut dyn StateAccess,
    ) -> Result<Option<Vec<Self::Output>>>;
}

/// Adapter registering a [`DescriptorlessHandler`] as a [`MessageHandler`]
/// whose descriptors are its output messages.
pub struct Descriptorless<H>(pub H);

impl<S, H> MessageHandler<S> for Descriptorless<H>
where
    S: ProcessState,
    H: DescriptorlessHandler<S>,
{
    type Message = H::Message;
    type Descriptor = H::Output;

    fn guard_predicate(&self, message: &Self::Message) -> bool {
        self.0.guard_predicate(message)
    }

    fn process_message(
        &mut self,
        message: &Self::Message,
        state: &mut dyn StateAccess,
    ) -> Result<Option<Vec<Self::Descriptor>>> {
        self.0.process_message(message, state)
    }

    fn get_send_messages(
        &self,
        _state: &S,
        descriptors: Option<&[Self::Descriptor]>,
    ) -> Option<Vec<Box<dyn Message>>> {
        descriptors.map(|descriptors| {
            descriptors
                .iter()
                .map(|message| Box::new(deep::clone(message)) as Box<dyn Message>)
                .collect()
        })
    }
}
