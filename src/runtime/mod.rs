//! Runtime orchestrator and public API
//!
//! One [`Runtime`] per replicated application: bind the state once, register
//! one handler per concrete message type, then feed every inbound message
//! through [`handle_message`](Runtime::handle_message). Under protection
//! (the default) each message is handled twice — once against the primary
//! state through a buffering strict encapsulator, once against the replica
//! through a write-through light encapsulator — and nothing becomes
//! externally visible until both executions agree on every read, write and
//! output.

use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

// Submodules
pub(crate) mod control;
pub mod deep;
pub mod encapsulator;
pub mod error;
pub mod failure;
pub mod handler;
pub mod message;
pub mod state;

use control::{ControlFlags, SentinelPair};
use encapsulator::{DirectAccess, Encapsulator, LightEncapsulator, StrictEncapsulator};
use error::Result;
use failure::{CrashFailureHandler, FailureHandler};
use state::StateLayout;

/// The pieces of a bound runtime a dispatch works with.
struct DispatchCtx<'a, S: ProcessState> {
    state: &'a Arc<RwLock<S>>,
    replica: &'a Arc<RwLock<S>>,
    strict: &'a mut StrictEncapsulator<S>,
    light: &'a mut LightEncapsulator<S>,
    layout: &'a Arc<StateLayout<S>>,
    control: &'a mut ControlFlags,
    protection: bool,
}

/// Type-erased face of a registered handler.
trait ErasedHandler<S: ProcessState>: Send {
    fn guard_dyn(&self, message: &dyn Message) -> bool;

    fn handle(
        &mut self,
        ctx: DispatchCtx<'_, S>,
        message: &mut dyn Message,
    ) -> Result<Vec<Box<dyn Message>>>;
}

struct HandlerAdapter<H> {
    inner: H,
}

impl<S, H> ErasedHandler<S> for HandlerAdapter<H>
where
    S: ProcessState,
    H: MessageHandler<S>,
{
    fn guard_dyn(&self, message: &dyn Message) -> bool {
        (message as &dyn Any)
            .downcast_ref::<H::Message>()
            .is_some_and(|message| self.inner.guard_predicate(message))
    }

    fn handle(
        &mut self,
        ctx: DispatchCtx<'_, S>,
        message: &mut dyn Message,
    ) -> Result<Vec<Box<dyn Message>>> {
        if ctx.protection {
            self.invoke(ctx, message)
        } else {
            self.invoke_unprotected(ctx, message)
        }
    }
}

impl<H> HandlerAdapter<H> {
    /// The dual-execution critical section.
    fn invoke<S>(
        &mut self,
        ctx: DispatchCtx<'_, S>,
        message: &mut dyn Message,
    ) -> Result<Vec<Box<dyn Message>>>
    where
        S: ProcessState,
        H: MessageHandler<S>,
    {
        // Obtain or compute a verified clone of the input. A memoized clone
        // was already verified by whoever parked it; a fresh one requires the
        // original to verify, and a failure there is malformed input rather
        // than a runtime fault.
        let memoized = message.take_verified_clone().and_then(|boxed| {
            let boxed: Box<dyn Any> = boxed;
            boxed.downcast::<H::Message>().ok().map(|clone| *clone)
        });

        let typed = (&*message as &dyn Any)
            .downcast_ref::<H::Message>()
            .ok_or_else(|| {
                RuntimeError::Execution("message type does not match its handler".to_string())
            })?;

        let cloned = match memoized {
            Some(clone) => clone,
            None => {
                let clone = deep::clone(typed);
                if !typed.verify() {
                    warn!(message = ?typed, "message failed verification, dropping");
                    return Ok(Vec::new());
                }
                clone
            }
        };

        ctx.strict.reset();
        ctx.light.reset();

        // Compute N: primary execution against the buffering encapsulator.
        let descriptors = self.inner.process_message(typed, &mut *ctx.strict)?;

        let primary_mark = SentinelPair::set();
        ctx.control.after_primary.advance("after primary execution")?;

        // Update R: shadow execution of the cloned message against the
        // write-through encapsulator.
        let shadow_descriptors = self.inner.process_message(&cloned, &mut *ctx.light)?;

        ctx.control.after_shadow.advance("after shadow execution")?;
        let shadow_mark = SentinelPair::set();

        // Commit buffered writes to the live state, gated on read/write
        // symmetry between the two executions.
        ctx.strict.apply_modifications(false, ctx.light)?;

        primary_mark.confirm_set("primary mark after apply")?;
        shadow_mark.confirm_set("shadow mark after apply")?;
        ctx.control.after_apply.advance("after apply")?;

        let diverged = match (&descriptors, &shadow_descriptors) {
            (Some(primary), Some(shadow)) => {
                primary.len() != shadow.len()
                    || primary
                        .iter()
                        .zip(shadow.iter())
                        .any(|(a, b)| !deep::compare(a, b))
            }
            (None, None) => false,
            _ => true,
        };
        if diverged {
            return Err(CorruptionError::MessagesGeneration {
                primary: format!("{descriptors:?}"),
                shadow: format!("{shadow_descriptors:?}"),
            }
            .into());
        }

        // Materialize outputs on each side, read-only against the raw copies.
        let responses = self
            .inner
            .get_send_messages(&ctx.state.read(), descriptors.as_deref());
        let replicas = self
            .inner
            .get_send_messages(&ctx.replica.read(), shadow_descriptors.as_deref());

        // The input must have survived handling untouched.
        if !deep::compare(typed, &cloned) {
            return Err(CorruptionError::InputMessage {
                detail: "diverged from its verified clone".to_string(),
                message: format!("{typed:?}"),
            }
            .into());
        }
        if !typed.verify() {
            return Err(CorruptionError::InputMessage {
                detail: "failed verification".to_string(),
                message: format!("{typed:?}"),
            }
            .into());
        }

        // The guard must still hold.
        if !self.inner.guard_predicate(typed) {
            return Err(CorruptionError::Guard {
                message: format!("{typed:?}"),
            }
            .into());
        }

        // A missing or size-mismatched output pair degrades to an empty
        // result instead of raising: the descriptor comparison above already
        // vouched for the two executions, so a disagreement here only drops
        // the output. State changes stay committed.
        let (Some(mut responses), Some(replicas)) = (responses, replicas) else {
            return Ok(Vec::new());
        };
        if responses.len() != replicas.len() {
            return Ok(Vec::new());
        }

        // Attach each shadow message's data as its primary counterpart's
        // redundancy, so the next hop can run this whole protocol again.
        for (response, replica) in responses.iter_mut().zip(replicas.iter()) {
            response.store_replica(replica.as_ref());
        }

        Ok(responses)
    }

    /// Single-execution fast path used when protection is disabled.
    fn invoke_unprotected<S>(
        &mut self,
        ctx: DispatchCtx<'_, S>,
        message: &mut dyn Message,
    ) -> Result<Vec<Box<dyn Message>>>
    where
        S: ProcessState,
        H: MessageHandler<S>,
    {
        let typed = (&*message as &dyn Any)
            .downcast_ref::<H::Message>()
            .ok_or_else(|| {
                RuntimeError::Execution("message type does not match its handler".to_string())
            })?;

        // Verification is advisory here: without a shadow execution there is
        // no safe reaction beyond flagging it.
        if !typed.verify() {
            warn!(message = ?typed, "unprotected dispatch of a message that fails verification");
        }

        let mut direct = DirectAccess::new(Arc::clone(ctx.layout), Arc::clone(ctx.state));
        let descriptors = self.inner.process_message(typed, &mut direct)?;
        let responses = self
            .inner
            .get_send_messages(&ctx.state.read(), descriptors.as_deref());

        let Some(mut responses) = responses else {
            return Ok(Vec::new());
        };

        // Without a shadow run, each output stores its own payload as
        // redundancy data.
        for response in responses.iter_mut() {
            let snapshot = response.clone_message();
            response.store_replica(snapshot.as_ref());
        }

        Ok(responses)
    }
}

/// The dual-execution dispatch engine.
///
/// There should be one runtime per replicated application. After binding
/// state and handlers it turns inbound messages into verified output
/// messages, detecting in-process corruption along the way.
///
/// A runtime is `Send` but not `Sync`: `handle_message` takes `&mut self`,
/// so processing is serialized by construction — one caller (or an external
/// mutex) per instance, as required by the protocol.
pub struct Runtime<S: ProcessState> {
    handlers: HashMap<TypeId, Box<dyn ErasedHandler<S>>>,
    layout: Option<Arc<StateLayout<S>>>,
    state: Option<Arc<RwLock<S>>>,
    replica: Option<Arc<RwLock<S>>>,
    strict: Option<StrictEncapsulator<S>>,
    light: Option<LightEncapsulator<S>>,
    failure_handler: Box<dyn FailureHandler>,
    protection: bool,
    protection_replica: bool,
}

impl<S: ProcessState> Runtime<S> {
    /// Create a new runtime with protection against corruption enabled.
    pub fn new() -> Self {
        Self::with_protection(true)
    }

    /// Create a new runtime, choosing between dual-execution protection and
    /// the single-pass unprotected mode.
    ///
    /// The flag is kept twice and cross-checked on every dispatch, so that a
    /// corrupted mode flag cannot silently disable protection.
    pub fn with_protection(protection: bool) -> Self {
        Self {
            handlers: HashMap::new(),
            layout: None,
            state: None,
            replica: None,
            strict: None,
            light: None,
            failure_handler: Box::new(CrashFailureHandler),
            protection,
            protection_replica: protection,
        }
    }

    /// Bind the application state. One-time: the replica is derived here by
    /// deep clone, and both encapsulators are bound to the pair for the
    /// runtime's whole lifetime.
    pub fn set_state(&mut self, state: S) -> anyhow::Result<()> {
        if self.state.is_some() {
            anyhow::bail!("state is already bound to this runtime");
        }

        let layout = state::layout_of::<S>()?;
        let replica = Arc::new(RwLock::new(deep::clone(&state)));
        let state = Arc::new(RwLock::new(state));

        self.strict = Some(StrictEncapsulator::new(
            Arc::clone(&layout),
            Arc::clone(&state),
            Arc::clone(&replica),
        ));
        self.light = Some(LightEncapsulator::new(
            Arc::clone(&layout),
            Arc::clone(&replica),
            Arc::clone(&state),
        ));
        self.layout = Some(layout);
        self.state = Some(state);
        self.replica = Some(replica);
        Ok(())
    }

    /// Register the handler for its concrete message type.
    ///
    /// One handler per message type; registering another for the same type
    /// replaces the previous one.
    pub fn add_handler<H>(&mut self, handler: H)
    where
        H: MessageHandler<S> + 'static,
    {
        self.handlers.insert(
            TypeId::of::<H::Message>(),
            Box::new(HandlerAdapter { inner: handler }),
        );
    }

    /// Handle one inbound message and produce the verified output messages.
    ///
    /// Unknown message types and guard-failing messages return an empty list;
    /// so does any detected fault, after the failure handler has been given
    /// the error. This method must not be called concurrently; the `&mut`
    /// receiver enforces one caller per instance at compile time.
    pub fn handle_message(&mut self, message: &mut dyn Message) -> Vec<Box<dyn Message>> {
        let mut control = ControlFlags::new();

        let type_id = (&*message as &dyn Any).type_id();
        let Some(handler) = self.handlers.get_mut(&type_id) else {
            warn!(message = ?message, "no handler registered for message type");
            return Vec::new();
        };
        if !handler.guard_dyn(&*message) {
            warn!(message = ?message, "handler guard predicate does not hold");
            return Vec::new();
        }

        let result = if self.protection != self.protection_replica {
            Err(CorruptionError::Variable {
                field: "protection".to_string(),
                value: self.protection.to_string(),
                replica: self.protection_replica.to_string(),
            }
            .into())
        } else {
            match (
                &self.layout,
                &self.state,
                &self.replica,
                &mut self.strict,
                &mut self.light,
            ) {
                (Some(layout), Some(state), Some(replica), Some(strict), Some(light)) => handler
                    .handle(
                        DispatchCtx {
                            state,
                            replica,
                            strict,
                            light,
                            layout,
                            control: &mut control,
                            protection: self.protection,
                        },
                        message,
                    ),
                _ => {
                    warn!("no state bound to this runtime, dropping message");
                    return Vec::new();
                }
            }
        };

        match result {
            Ok(responses) => responses,
            Err(error) => {
                self.failure_handler.handle_failure(error);
                Vec::new()
            }
        }
    }

    /// Replace the failure handler.
    pub fn set_failure_handler(&mut self, handler: Box<dyn FailureHandler>) {
        self.failure_handler = handler;
    }

    /// The current failure handler.
    pub fn failure_handler(&self) -> &dyn FailureHandler {
        self.failure_handler.as_ref()
    }

    /// Whether dual-execution protection is enabled.
    pub fn protection(&self) -> bool {
        self.protection
    }

    /// Handle to the primary state, once bound.
    ///
    /// Intended for diagnostics and fault-injection tests; mutating the
    /// state out of band is exactly the corruption the runtime detects.
    pub fn state(&self) -> Option<&Arc<RwLock<S>>> {
        self.state.as_ref()
    }

    /// Handle to the replica state, once bound. Same caveats as [`state`].
    ///
    /// [`state`]: Runtime::state
    pub fn replica(&self) -> Option<&Arc<RwLock<S>>> {
        self.replica.as_ref()
    }
}

impl<S: ProcessState> Default for Runtime<S> {
    fn default() -> Self {
        Self::new()
    }
}

// Re-export commonly used types
pub use encapsulator::{StateAccess, StateAccessExt};
pub use error::{CorruptionError, RuntimeError};
pub use handler::MessageHandler;
pub use message::Message;
pub use state::ProcessState;
