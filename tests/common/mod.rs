//! Shared fixture for the integration tests: a small counter state, a
//! self-verifying message type and a closure-driven handler.

#![allow(dead_code)]

use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Once};

use parking_lot::Mutex;

use tandem::runtime::deep::{self, DeepClone, DeepEquals};
use tandem::runtime::error::Result;
use tandem::{
    FailureHandler, Message, MessageHandler, ProcessState, RedundancySlot, Runtime, RuntimeError,
    StateAccess, StateAccessExt, StateLayout, VerifiedClone,
};

/// Replicated state: two scalar counters and one keyed table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CounterState {
    pub a: i64,
    pub b: i64,
    pub c: HashMap<String, i64>,
}

tandem::structural_deep!(CounterState);

impl ProcessState for CounterState {
    fn layout() -> StateLayout<Self> {
        StateLayout::builder()
            .scalar("a", |s: &Self| s.a, |s: &mut Self, v| s.a = v)
            .scalar("b", |s: &Self| s.b, |s: &mut Self, v| s.b = v)
            .indexed(
                "c",
                |s: &Self, k: &String| s.c.get(k).copied().unwrap_or(0),
                |s: &mut Self, k: String, v: i64| {
                    s.c.insert(k, v);
                },
            )
            .build()
    }
}

/// Message carrying a signed amount, verified against a redundant copy.
///
/// The payload lives in a `Cell` so corruption tests can flip it in place
/// behind a shared reference.
#[derive(Debug)]
pub struct Delta {
    pub amount: Cell<i64>,
    pub redundancy: RedundancySlot<i64>,
    pub verified_clone: VerifiedClone,
}

impl Delta {
    pub fn new(amount: i64) -> Self {
        Self {
            amount: Cell::new(amount),
            redundancy: RedundancySlot::new(),
            verified_clone: VerifiedClone::new(),
        }
    }

    /// A message with its redundancy data already attached, as a previous
    /// hop would have sent it.
    pub fn sealed(amount: i64) -> Self {
        let mut message = Self::new(amount);
        let snapshot = message.clone_message();
        message.store_replica(snapshot.as_ref());
        message
    }
}

impl DeepClone for Delta {
    fn clone_deep(&self) -> Self {
        Self {
            amount: Cell::new(self.amount.get()),
            redundancy: self.redundancy.clone(),
            // Transient: a clone starts with no memoized clone of its own.
            verified_clone: VerifiedClone::new(),
        }
    }
}

impl DeepEquals for Delta {
    fn equals_deep(&self, other: &Self) -> bool {
        // Redundancy data is non-semantic.
        self.amount.get() == other.amount.get()
    }
}

impl Message for Delta {
    fn verify(&self) -> bool {
        self.redundancy.get().copied() == Some(self.amount.get())
    }

    fn store_replica(&mut self, other: &dyn Message) {
        if let Some(other) = (other as &dyn Any).downcast_ref::<Delta>() {
            self.redundancy.store(other.amount.get());
        }
    }

    fn clone_message(&self) -> Box<dyn Message> {
        Box::new(self.clone_deep())
    }

    fn take_verified_clone(&mut self) -> Option<Box<dyn Message>> {
        self.verified_clone.take()
    }

    fn set_verified_clone(&mut self, clone: Box<dyn Message>) {
        self.verified_clone.set(clone);
    }
}

/// Read the amount back out of an output message.
pub fn amount_of(message: &dyn Message) -> i64 {
    (message as &dyn Any)
        .downcast_ref::<Delta>()
        .expect("output is a Delta")
        .amount
        .get()
}

/// Handler driven by a closure, with descriptors materialized one-to-one
/// into output messages.
pub struct FnHandler<F>(pub F);

impl<F> MessageHandler<CounterState> for FnHandler<F>
where
    F: FnMut(&Delta, &mut dyn StateAccess) -> Result<Option<Vec<Delta>>> + Send,
{
    type Message = Delta;
    type Descriptor = Delta;

    fn guard_predicate(&self, _message: &Delta) -> bool {
        true
    }

    fn process_message(
        &mut self,
        message: &Delta,
        state: &mut dyn StateAccess,
    ) -> Result<Option<Vec<Delta>>> {
        (self.0)(message, state)
    }

    fn get_send_messages(
        &self,
        _state: &CounterState,
        descriptors: Option<&[Delta]>,
    ) -> Option<Vec<Box<dyn Message>>> {
        descriptors.map(|descriptors| {
            descriptors
                .iter()
                .map(|message| Box::new(deep::clone(message)) as Box<dyn Message>)
                .collect()
        })
    }
}

/// The baseline handler: add the payload to counter `a`, emit the new total.
pub struct AddToTotal;

impl MessageHandler<CounterState> for AddToTotal {
    type Message = Delta;
    type Descriptor = Delta;

    fn guard_predicate(&self, _message: &Delta) -> bool {
        true
    }

    fn process_message(
        &mut self,
        message: &Delta,
        state: &mut dyn StateAccess,
    ) -> Result<Option<Vec<Delta>>> {
        let total: i64 = state.get("a")?;
        let total = total + message.amount.get();
        state.set("a", total)?;
        Ok(Some(vec![Delta::new(total)]))
    }

    fn get_send_messages(
        &self,
        _state: &CounterState,
        descriptors: Option<&[Delta]>,
    ) -> Option<Vec<Box<dyn Message>>> {
        descriptors.map(|descriptors| {
            descriptors
                .iter()
                .map(|message| Box::new(deep::clone(message)) as Box<dyn Message>)
                .collect()
        })
    }
}

/// Failure handler that records faults instead of terminating, so tests can
/// assert on what the runtime detected.
#[derive(Clone, Default)]
pub struct RecordingFailureHandler(Arc<Mutex<Vec<RuntimeError>>>);

impl RecordingFailureHandler {
    pub fn take(&self) -> Vec<RuntimeError> {
        std::mem::take(&mut *self.0.lock())
    }

    pub fn single(&self) -> RuntimeError {
        let mut faults = self.take();
        assert_eq!(faults.len(), 1, "expected exactly one fault: {faults:?}");
        faults.remove(0)
    }

    pub fn assert_clean(&self) {
        let faults = self.take();
        assert!(faults.is_empty(), "unexpected faults: {faults:?}");
    }
}

impl FailureHandler for RecordingFailureHandler {
    fn handle_failure(&self, error: RuntimeError) {
        self.0.lock().push(error);
    }
}

/// A bound, protected runtime with a recording failure handler.
pub fn runtime_with<H>(handler: H) -> (Runtime<CounterState>, RecordingFailureHandler)
where
    H: MessageHandler<CounterState> + 'static,
{
    let mut runtime = Runtime::new();
    runtime
        .set_state(CounterState::default())
        .expect("state binds");
    runtime.add_handler(handler);
    let recorder = RecordingFailureHandler::default();
    runtime.set_failure_handler(Box::new(recorder.clone()));
    (runtime, recorder)
}

/// Route test logging through tracing once per process.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
