//! State-access interception layer
//!
//! Handlers never touch a [`ProcessState`](super::state::ProcessState)
//! directly. They go through an encapsulator, which tracks every field and
//! key touched during one dispatch and cross-checks each first read against
//! the counterpart state copy. Two variants exist:
//!
//! - [`StrictEncapsulator`] wraps the primary during the first execution.
//!   Writes are buffered and invisible to the underlying state until
//!   [`apply_modifications`](Encapsulator::apply_modifications), which is
//!   gated on read/write symmetry with the light side and so looks like one
//!   atomic state transition.
//! - [`LightEncapsulator`] wraps the replica during the shadow execution.
//!   Writes go through immediately — the replica is the disposable, checking
//!   copy — and every touched key is durably logged so the strict side's
//!   commit can be matched against it.
//!
//! Indexed fields use a single-slot write-combining cache on both sides: the
//! most recently touched key/value pair stays out of the backing map until a
//! different key displaces it, so repeated same-key access inside one
//! dispatch causes no map traffic.

use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;

use super::error::{AccessError, CorruptionError, Result};
use super::state::{
    FieldKey, FieldRef, FieldValue, IndexedAccessor, KeyBox, ProcessState, ScalarAccessor,
    StateLayout,
};

/// Accessor surface handlers use to read and mutate process state.
///
/// Implemented by both encapsulator variants and by [`DirectAccess`], so the
/// same handler code runs unchanged against the primary execution, the
/// shadow execution and the unprotected fast path. The typed convenience
/// methods live on [`StateAccessExt`].
pub trait StateAccess {
    /// Read a scalar field.
    fn get_value(&mut self, field: &str) -> Result<Box<dyn FieldValue>>;

    /// Write a scalar field.
    fn set_value(&mut self, field: &str, value: Box<dyn FieldValue>) -> Result<()>;

    /// Read an entry of an indexed field.
    fn get_indexed_value(&mut self, field: &str, key: &dyn FieldKey)
        -> Result<Box<dyn FieldValue>>;

    /// Write an entry of an indexed field.
    fn set_indexed_value(
        &mut self,
        field: &str,
        key: &dyn FieldKey,
        value: Box<dyn FieldValue>,
    ) -> Result<()>;
}

/// Typed convenience layer over [`StateAccess`].
pub trait StateAccessExt: StateAccess {
    /// Read a scalar field as a concrete type.
    fn get<T: FieldValue>(&mut self, field: &str) -> Result<T> {
        let value = self.get_value(field)?;
        downcast_value(field, value)
    }

    /// Write a scalar field.
    fn set<T: FieldValue>(&mut self, field: &str, value: T) -> Result<()> {
        self.set_value(field, Box::new(value))
    }

    /// Read an entry of an indexed field as a concrete type.
    fn get_at<K: FieldKey, T: FieldValue>(&mut self, field: &str, key: &K) -> Result<T> {
        let value = self.get_indexed_value(field, key)?;
        downcast_value(field, value)
    }

    /// Write an entry of an indexed field.
    fn set_at<K: FieldKey, T: FieldValue>(&mut self, field: &str, key: K, value: T) -> Result<()> {
        self.set_indexed_value(field, &key, Box::new(value))
    }
}

impl<A: StateAccess + ?Sized> StateAccessExt for A {}

fn downcast_value<T: FieldValue>(field: &str, value: Box<dyn FieldValue>) -> Result<T> {
    let value: Box<dyn Any> = value;
    value.downcast::<T>().map(|v| *v).map_err(|_| {
        AccessError::TypeMismatch {
            field: field.to_string(),
            requested: std::any::type_name::<T>(),
        }
        .into()
    })
}

/// Contract produced by the accessor factory for one bound state instance.
///
/// An encapsulator is created once at binding time and lives as long as the
/// runtime; [`reset`](Encapsulator::reset) clears its tracking at the start
/// of every protected dispatch.
pub trait Encapsulator<S: ProcessState>: StateAccess {
    /// Forget all per-dispatch tracking.
    fn reset(&mut self);

    /// Push buffered writes into the backing state (the replica when
    /// `to_replica` is set), enforcing read/write symmetry against the light
    /// side's access log. A no-op on the light variant, whose writes are
    /// already live.
    fn apply_modifications(
        &mut self,
        to_replica: bool,
        counterpart: &LightEncapsulator<S>,
    ) -> Result<()>;
}

fn variable_mismatch(field: String, value: &dyn FieldValue, replica: &dyn FieldValue)
-> CorruptionError {
    CorruptionError::Variable {
        field,
        value: format!("{value:?}"),
        replica: format!("{replica:?}"),
    }
}

fn ensure_key_type<S>(accessor: &IndexedAccessor<S>, key: &dyn FieldKey)
-> std::result::Result<(), AccessError> {
    if (key as &dyn Any).type_id() != accessor.key_type {
        return Err(AccessError::KeyTypeMismatch {
            field: accessor.name.to_string(),
            requested: key.type_name(),
        });
    }
    Ok(())
}

fn ensure_scalar_type<S>(accessor: &ScalarAccessor<S>, value: &dyn FieldValue)
-> std::result::Result<(), AccessError> {
    if (value as &dyn Any).type_id() != accessor.value_type {
        return Err(AccessError::TypeMismatch {
            field: accessor.name.to_string(),
            requested: value.type_name(),
        });
    }
    Ok(())
}

fn ensure_indexed_type<S>(accessor: &IndexedAccessor<S>, value: &dyn FieldValue)
-> std::result::Result<(), AccessError> {
    if (value as &dyn Any).type_id() != accessor.value_type {
        return Err(AccessError::TypeMismatch {
            field: accessor.name.to_string(),
            requested: value.type_name(),
        });
    }
    Ok(())
}

#[derive(Default)]
struct ScalarSlot {
    read: bool,
    written: bool,
    buffer: Option<Box<dyn FieldValue>>,
}

#[derive(Default)]
struct IndexedSlot {
    /// Cache entries displaced by a key change, in displacement order.
    touched: IndexMap<KeyBox, Box<dyn FieldValue>>,
    /// Write-combining cache: the most recently touched key and value.
    cache: Option<(KeyBox, Box<dyn FieldValue>)>,
}

/// Buffering encapsulator bound to the primary state copy.
pub struct StrictEncapsulator<S: ProcessState> {
    layout: Arc<StateLayout<S>>,
    state: Arc<RwLock<S>>,
    replica: Arc<RwLock<S>>,
    scalars: Vec<ScalarSlot>,
    indexed: Vec<IndexedSlot>,
}

impl<S: ProcessState> StrictEncapsulator<S> {
    /// Bind a strict encapsulator to the primary state and its replica.
    pub fn new(layout: Arc<StateLayout<S>>, state: Arc<RwLock<S>>, replica: Arc<RwLock<S>>) -> Self {
        let scalars = (0..layout.scalars().len()).map(|_| ScalarSlot::default()).collect();
        let indexed = (0..layout.indexed().len()).map(|_| IndexedSlot::default()).collect();
        Self {
            layout,
            state,
            replica,
            scalars,
            indexed,
        }
    }

    fn scalar_get(&mut self, index: usize) -> Result<Box<dyn FieldValue>> {
        let accessor = &self.layout.scalars()[index];
        let slot = &mut self.scalars[index];
        if !slot.read {
            slot.read = true;
            let value = (accessor.get)(&self.state.read());
            let replica = (accessor.get)(&self.replica.read());
            if !value.equals_value(replica.as_ref()) {
                return Err(variable_mismatch(
                    accessor.name.to_string(),
                    value.as_ref(),
                    replica.as_ref(),
                )
                .into());
            }
            slot.buffer = Some(value);
        }
        Ok(slot
            .buffer
            .as_ref()
            .expect("first access fills the buffer")
            .clone_value())
    }

    fn scalar_set(&mut self, index: usize, value: Box<dyn FieldValue>) {
        let slot = &mut self.scalars[index];
        slot.read = true;
        slot.written = true;
        slot.buffer = Some(value);
    }

    fn indexed_get(&mut self, index: usize, key: &dyn FieldKey) -> Result<Box<dyn FieldValue>> {
        let accessor = &self.layout.indexed()[index];
        ensure_key_type(accessor, key)?;
        let slot = &mut self.indexed[index];

        if let Some((cached_key, cached_value)) = &slot.cache {
            if cached_key.matches(key) {
                return Ok(cached_value.clone_value());
            }
            // Key change: displace the previous pair into the touched map.
            let (old_key, old_value) = slot.cache.take().expect("cache occupied");
            slot.touched.insert(old_key, old_value);
            let boxed = KeyBox::from_dyn(key);
            if let Some(value) = slot.touched.get(&boxed) {
                // Already checked and loaded earlier this dispatch.
                let value = value.clone_value();
                slot.cache = Some((boxed, value.clone_value()));
                return Ok(value);
            }
        }

        let value = (accessor.get)(&self.state.read(), key)?;
        let replica = (accessor.get)(&self.replica.read(), key)?;
        if !value.equals_value(replica.as_ref()) {
            return Err(variable_mismatch(
                format!("{}[{:?}]", accessor.name, key),
                value.as_ref(),
                replica.as_ref(),
            )
            .into());
        }
        slot.cache = Some((KeyBox::from_dyn(key), value.clone_value()));
        Ok(value)
    }

    fn indexed_set(
        &mut self,
        index: usize,
        key: &dyn FieldKey,
        value: Box<dyn FieldValue>,
    ) -> Result<()> {
        let accessor = &self.layout.indexed()[index];
        ensure_key_type(accessor, key)?;
        ensure_indexed_type(accessor, value.as_ref())?;
        let slot = &mut self.indexed[index];

        if let Some((cached_key, _)) = &slot.cache {
            if !cached_key.matches(key) {
                let (old_key, old_value) = slot.cache.take().expect("cache occupied");
                slot.touched.insert(old_key, old_value);
            }
        }
        slot.cache = Some((KeyBox::from_dyn(key), value));
        Ok(())
    }
}

impl<S: ProcessState> StateAccess for StrictEncapsulator<S> {
    fn get_value(&mut self, field: &str) -> Result<Box<dyn FieldValue>> {
        match self.layout.field(field)? {
            FieldRef::Scalar(index) => self.scalar_get(index),
            FieldRef::Indexed(_) => Err(AccessError::NotScalar(field.to_string()).into()),
        }
    }

    fn set_value(&mut self, field: &str, value: Box<dyn FieldValue>) -> Result<()> {
        match self.layout.field(field)? {
            FieldRef::Scalar(index) => {
                ensure_scalar_type(&self.layout.scalars()[index], value.as_ref())?;
                self.scalar_set(index, value);
                Ok(())
            }
            FieldRef::Indexed(_) => Err(AccessError::NotScalar(field.to_string()).into()),
        }
    }

    fn get_indexed_value(
        &mut self,
        field: &str,
        key: &dyn FieldKey,
    ) -> Result<Box<dyn FieldValue>> {
        match self.layout.field(field)? {
            FieldRef::Indexed(index) => self.indexed_get(index, key),
            FieldRef::Scalar(_) => Err(AccessError::NotIndexed(field.to_string()).into()),
        }
    }

    fn set_indexed_value(
        &mut self,
        field: &str,
        key: &dyn FieldKey,
        value: Box<dyn FieldValue>,
    ) -> Result<()> {
        match self.layout.field(field)? {
            FieldRef::Indexed(index) => self.indexed_set(index, key, value),
            FieldRef::Scalar(_) => Err(AccessError::NotIndexed(field.to_string()).into()),
        }
    }
}

impl<S: ProcessState> Encapsulator<S> for StrictEncapsulator<S> {
    fn reset(&mut self) {
        for slot in &mut self.scalars {
            slot.read = false;
            slot.written = false;
            slot.buffer = None;
        }
        for slot in &mut self.indexed {
            slot.touched.clear();
            slot.cache = None;
        }
    }

    fn apply_modifications(
        &mut self,
        to_replica: bool,
        counterpart: &LightEncapsulator<S>,
    ) -> Result<()> {
        let target = if to_replica { &self.replica } else { &self.state };
        let mut target = target.write();

        for (index, slot) in self.scalars.iter().enumerate() {
            if !slot.written {
                continue;
            }
            let accessor = &self.layout.scalars()[index];
            if !counterpart.scalar_was_read(index) || !slot.read {
                return Err(CorruptionError::AsymmetricalChanges {
                    field: accessor.name.to_string(),
                    key: None,
                    replica_key: None,
                }
                .into());
            }
            let value = slot
                .buffer
                .as_ref()
                .expect("written implies buffered")
                .clone_value();
            (accessor.set)(&mut target, value)?;
        }

        for (index, slot) in self.indexed.iter().enumerate() {
            let Some((cached_key, cached_value)) = &slot.cache else {
                continue;
            };
            let accessor = &self.layout.indexed()[index];
            let read_log = counterpart.indexed_read_log(index);

            if !slot.touched.is_empty() {
                let mut logged = read_log.iter();
                for (key, value) in &slot.touched {
                    match logged.next() {
                        Some(light_key) if light_key == key => {
                            (accessor.set)(&mut target, key.get(), value.clone_value())?;
                        }
                        other => {
                            return Err(CorruptionError::AsymmetricalChanges {
                                field: accessor.name.to_string(),
                                key: Some(format!("{key:?}")),
                                replica_key: other.map(|k| format!("{k:?}")),
                            }
                            .into());
                        }
                    }
                }
                if let Some(extra) = logged.next() {
                    return Err(CorruptionError::AsymmetricalChanges {
                        field: accessor.name.to_string(),
                        key: None,
                        replica_key: Some(format!("{extra:?}")),
                    }
                    .into());
                }
            } else if !read_log.is_empty() {
                return Err(CorruptionError::AsymmetricalChanges {
                    field: accessor.name.to_string(),
                    key: None,
                    replica_key: read_log.first().map(|k| format!("{k:?}")),
                }
                .into());
            }

            // The cache holds the most recent change; applied last so it wins.
            match counterpart.indexed_latest_key(index) {
                Some(light_key) if light_key == cached_key => {}
                other => {
                    return Err(CorruptionError::AsymmetricalChanges {
                        field: accessor.name.to_string(),
                        key: Some(format!("{cached_key:?}")),
                        replica_key: other.map(|k| format!("{k:?}")),
                    }
                    .into());
                }
            }
            (accessor.set)(&mut target, cached_key.get(), cached_value.clone_value())?;
        }

        Ok(())
    }
}

#[derive(Default)]
struct LightScalarSlot {
    read: bool,
}

#[derive(Default)]
struct LightIndexedSlot {
    /// Keys displaced from the cache, in displacement order.
    read_log: IndexSet<KeyBox>,
    cache: Option<(KeyBox, Box<dyn FieldValue>)>,
}

/// Write-through encapsulator bound to the replica state copy.
pub struct LightEncapsulator<S: ProcessState> {
    layout: Arc<StateLayout<S>>,
    state: Arc<RwLock<S>>,
    counterpart: Arc<RwLock<S>>,
    scalars: Vec<LightScalarSlot>,
    indexed: Vec<LightIndexedSlot>,
}

impl<S: ProcessState> LightEncapsulator<S> {
    /// Bind a light encapsulator to its own storage (the replica) and the
    /// counterpart copy used for first-read cross-checks (the primary).
    pub fn new(
        layout: Arc<StateLayout<S>>,
        state: Arc<RwLock<S>>,
        counterpart: Arc<RwLock<S>>,
    ) -> Self {
        let scalars = (0..layout.scalars().len())
            .map(|_| LightScalarSlot::default())
            .collect();
        let indexed = (0..layout.indexed().len())
            .map(|_| LightIndexedSlot::default())
            .collect();
        Self {
            layout,
            state,
            counterpart,
            scalars,
            indexed,
        }
    }

    pub(crate) fn scalar_was_read(&self, index: usize) -> bool {
        self.scalars[index].read
    }

    pub(crate) fn indexed_read_log(&self, index: usize) -> &IndexSet<KeyBox> {
        &self.indexed[index].read_log
    }

    pub(crate) fn indexed_latest_key(&self, index: usize) -> Option<&KeyBox> {
        self.indexed[index].cache.as_ref().map(|(key, _)| key)
    }

    fn scalar_get(&mut self, index: usize) -> Result<Box<dyn FieldValue>> {
        let accessor = &self.layout.scalars()[index];
        let slot = &mut self.scalars[index];
        if !slot.read {
            slot.read = true;
            let value = (accessor.get)(&self.state.read());
            let other = (accessor.get)(&self.counterpart.read());
            if !value.equals_value(other.as_ref()) {
                return Err(variable_mismatch(
                    accessor.name.to_string(),
                    value.as_ref(),
                    other.as_ref(),
                )
                .into());
            }
        }
        Ok((accessor.get)(&self.state.read()))
    }

    fn scalar_set(&mut self, index: usize, value: Box<dyn FieldValue>) -> Result<()> {
        let accessor = &self.layout.scalars()[index];
        self.scalars[index].read = true;
        (accessor.set)(&mut self.state.write(), value)?;
        Ok(())
    }

    fn indexed_get(&mut self, index: usize, key: &dyn FieldKey) -> Result<Box<dyn FieldValue>> {
        let accessor = &self.layout.indexed()[index];
        ensure_key_type(accessor, key)?;
        let slot = &mut self.indexed[index];

        if let Some((cached_key, cached_value)) = &slot.cache {
            if cached_key.matches(key) {
                return Ok(cached_value.clone_value());
            }
            let (old_key, _) = slot.cache.take().expect("cache occupied");
            slot.read_log.insert(old_key);
        }

        let boxed = KeyBox::from_dyn(key);
        let value = (accessor.get)(&self.state.read(), key)?;
        if !slot.read_log.contains(&boxed) {
            // First touch of this key: it must still agree with the
            // counterpart. Keys touched earlier may legitimately diverge,
            // since this side writes through while the strict side buffers.
            let other = (accessor.get)(&self.counterpart.read(), key)?;
            if !value.equals_value(other.as_ref()) {
                return Err(variable_mismatch(
                    format!("{}[{:?}]", accessor.name, key),
                    value.as_ref(),
                    other.as_ref(),
                )
                .into());
            }
        }
        slot.cache = Some((boxed, value.clone_value()));
        Ok(value)
    }

    fn indexed_set(
        &mut self,
        index: usize,
        key: &dyn FieldKey,
        value: Box<dyn FieldValue>,
    ) -> Result<()> {
        let accessor = &self.layout.indexed()[index];
        ensure_key_type(accessor, key)?;
        ensure_indexed_type(accessor, value.as_ref())?;
        let slot = &mut self.indexed[index];

        if let Some((cached_key, _)) = &slot.cache {
            if !cached_key.matches(key) {
                let (old_key, _) = slot.cache.take().expect("cache occupied");
                slot.read_log.insert(old_key);
            }
        }
        let cached = value.clone_value();
        (accessor.set)(&mut self.state.write(), key, value)?;
        slot.cache = Some((KeyBox::from_dyn(key), cached));
        Ok(())
    }
}

impl<S: ProcessState> StateAccess for LightEncapsulator<S> {
    fn get_value(&mut self, field: &str) -> Result<Box<dyn FieldValue>> {
        match self.layout.field(field)? {
            FieldRef::Scalar(index) => self.scalar_get(index),
            FieldRef::Indexed(_) => Err(AccessError::NotScalar(field.to_string()).into()),
        }
    }

    fn set_value(&mut self, field: &str, value: Box<dyn FieldValue>) -> Result<()> {
        match self.layout.field(field)? {
            FieldRef::Scalar(index) => {
                ensure_scalar_type(&self.layout.scalars()[index], value.as_ref())?;
                self.scalar_set(index, value)
            }
            FieldRef::Indexed(_) => Err(AccessError::NotScalar(field.to_string()).into()),
        }
    }

    fn get_indexed_value(
        &mut self,
        field: &str,
        key: &dyn FieldKey,
    ) -> Result<Box<dyn FieldValue>> {
        match self.layout.field(field)? {
            FieldRef::Indexed(index) => self.indexed_get(index, key),
            FieldRef::Scalar(_) => Err(AccessError::NotIndexed(field.to_string()).into()),
        }
    }

    fn set_indexed_value(
        &mut self,
        field: &str,
        key: &dyn FieldKey,
        value: Box<dyn FieldValue>,
    ) -> Result<()> {
        match self.layout.field(field)? {
            FieldRef::Indexed(index) => self.indexed_set(index, key, value),
            FieldRef::Scalar(_) => Err(AccessError::NotIndexed(field.to_string()).into()),
        }
    }
}

impl<S: ProcessState> Encapsulator<S> for LightEncapsulator<S> {
    fn reset(&mut self) {
        for slot in &mut self.scalars {
            slot.read = false;
        }
        for slot in &mut self.indexed {
            slot.read_log.clear();
            slot.cache = None;
        }
    }

    fn apply_modifications(&mut self, _to_replica: bool, _counterpart: &LightEncapsulator<S>)
    -> Result<()> {
        // Writes on this side are already live; only the strict commit is gated.
        Ok(())
    }
}

/// Untracked pass-through access, used on the unprotected fast path and for
/// driving handlers standalone in tests.
pub struct DirectAccess<S: ProcessState> {
    layout: Arc<StateLayout<S>>,
    state: Arc<RwLock<S>>,
}

impl<S: ProcessState> DirectAccess<S> {
    /// Bind direct access to a state instance.
    pub fn new(layout: Arc<StateLayout<S>>, state: Arc<RwLock<S>>) -> Self {
        Self { layout, state }
    }
}

impl<S: ProcessState> StateAccess for DirectAccess<S> {
    fn get_value(&mut self, field: &str) -> Result<Box<dyn FieldValue>> {
        match self.layout.field(field)? {
            FieldRef::Scalar(index) => Ok((self.layout.scalars()[index].get)(&self.state.read())),
            FieldRef::Indexed(_) => Err(AccessError::NotScalar(field.to_string()).into()),
        }
    }

    fn set_value(&mut self, field: &str, value: Box<dyn FieldValue>) -> Result<()> {
        match self.layout.field(field)? {
            FieldRef::Scalar(index) => {
                (self.layout.scalars()[index].set)(&mut self.state.write(), value)?;
                Ok(())
            }
            FieldRef::Indexed(_) => Err(AccessError::NotScalar(field.to_string()).into()),
        }
    }

    fn get_indexed_value(
        &mut self,
        field: &str,
        key: &dyn FieldKey,
    ) -> Result<Box<dyn FieldValue>> {
        match self.layout.field(field)? {
            FieldRef::Indexed(index) => {
                Ok((self.layout.indexed()[index].get)(&self.state.read(), key)?)
            }
            FieldRef::Scalar(_) => Err(AccessError::NotIndexed(field.to_string()).into()),
        }
    }

    fn set_indexed_value(
        &mut self,
        field: &str,
        key: &dyn FieldKey,
        value: Box<dyn FieldValue>,
    ) -> Result<()> {
        match self.layout.field(field)? {
            FieldRef::Indexed(index) => {
                (self.layout.indexed()[index].set)(&mut self.state.write(), key, value)?;
                Ok(())
            }
            FieldRef::Scalar(_) => Err(AccessError::NotIndexed(field.to_string()).into()),
        }
    }
}
