//! Process state contract and accessor layout registry
//!
//! A replicated state type exposes nothing but accessor pairs: scalar
//! get/set, and keyed get/set for indexed fields. The pairs are declared
//! once, declaratively, in [`ProcessState::layout`]; the resulting
//! [`StateLayout`] is the factory from which the runtime builds the
//! intercepting encapsulators for that type. Layouts are validated and
//! cached once per state type in a global catalog, so every runtime bound to
//! the same type shares one set of accessor closures.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::deep::{DeepClone, DeepEquals};
use super::error::{AccessError, RuntimeError};

/// User-defined replicated state.
///
/// Implementors describe their accessor surface in [`layout`]; the runtime
/// owns the two live instances (primary and replica) for its whole lifetime
/// and mutates them only through the verified apply step.
///
/// [`layout`]: ProcessState::layout
pub trait ProcessState: DeepClone + Send + Sync + 'static {
    /// Declare every scalar and indexed accessor pair of this type.
    fn layout() -> StateLayout<Self>
    where
        Self: Sized;
}

/// A value that can live in a tracked state field.
///
/// Blanket-implemented for every type with the deep-copy capabilities plus
/// `Debug` (for corruption diagnostics) and `Send` (state moves with the
/// runtime).
pub trait FieldValue: Any + fmt::Debug + Send {
    /// Clone this value as a trait object.
    fn clone_value(&self) -> Box<dyn FieldValue>;

    /// Deep-compare against another erased value; false on type mismatch.
    fn equals_value(&self, other: &dyn FieldValue) -> bool;

    /// Name of the concrete type, for diagnostics.
    fn type_name(&self) -> &'static str;
}

impl<T> FieldValue for T
where
    T: DeepClone + DeepEquals + fmt::Debug + Send + 'static,
{
    fn clone_value(&self) -> Box<dyn FieldValue> {
        Box::new(self.clone_deep())
    }

    fn equals_value(&self, other: &dyn FieldValue) -> bool {
        (other as &dyn Any)
            .downcast_ref::<T>()
            .is_some_and(|other| self.equals_deep(other))
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A key addressing an entry of an indexed field.
///
/// Blanket-implemented for hashable, comparable, clonable key types.
pub trait FieldKey: Any + fmt::Debug + Send {
    /// Compare against another erased key; false on type mismatch.
    fn eq_key(&self, other: &dyn FieldKey) -> bool;

    /// Feed this key into a hasher, consistently with [`eq_key`].
    ///
    /// [`eq_key`]: FieldKey::eq_key
    fn hash_key(&self, hasher: &mut dyn Hasher);

    /// Clone this key as a trait object.
    fn clone_key(&self) -> Box<dyn FieldKey>;

    /// Name of the concrete type, for diagnostics.
    fn type_name(&self) -> &'static str;
}

impl<K> FieldKey for K
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
{
    fn eq_key(&self, other: &dyn FieldKey) -> bool {
        (other as &dyn Any)
            .downcast_ref::<K>()
            .is_some_and(|other| self == other)
    }

    fn hash_key(&self, mut hasher: &mut dyn Hasher) {
        self.hash(&mut hasher);
    }

    fn clone_key(&self) -> Box<dyn FieldKey> {
        Box::new(self.clone())
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<K>()
    }
}

/// Owned, hashable wrapper around an erased field key.
///
/// Used as the key type of the per-dispatch tracking structures (the
/// write-combining caches, the touched map and the read-key log).
pub struct KeyBox(Box<dyn FieldKey>);

impl KeyBox {
    /// Wrap a concrete key.
    pub fn new<K: FieldKey>(key: K) -> Self {
        Self(Box::new(key))
    }

    /// Wrap a borrowed erased key by cloning it.
    pub fn from_dyn(key: &dyn FieldKey) -> Self {
        Self(key.clone_key())
    }

    /// Borrow the erased key.
    pub fn get(&self) -> &dyn FieldKey {
        self.0.as_ref()
    }

    /// Compare against a borrowed erased key.
    pub fn matches(&self, key: &dyn FieldKey) -> bool {
        self.0.eq_key(key)
    }
}

impl Clone for KeyBox {
    fn clone(&self) -> Self {
        Self(self.0.clone_key())
    }
}

impl PartialEq for KeyBox {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_key(other.0.as_ref())
    }
}

impl Eq for KeyBox {}

impl Hash for KeyBox {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_key(state);
    }
}

impl fmt::Debug for KeyBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

type ScalarGet<S> = Box<dyn Fn(&S) -> Box<dyn FieldValue> + Send + Sync>;
type ScalarSet<S> =
    Box<dyn Fn(&mut S, Box<dyn FieldValue>) -> Result<(), AccessError> + Send + Sync>;
type IndexedGet<S> =
    Box<dyn Fn(&S, &dyn FieldKey) -> Result<Box<dyn FieldValue>, AccessError> + Send + Sync>;
type IndexedSet<S> = Box<
    dyn Fn(&mut S, &dyn FieldKey, Box<dyn FieldValue>) -> Result<(), AccessError> + Send + Sync,
>;

pub(crate) struct ScalarAccessor<S> {
    pub(crate) name: &'static str,
    pub(crate) value_type: TypeId,
    pub(crate) get: ScalarGet<S>,
    pub(crate) set: ScalarSet<S>,
}

pub(crate) struct IndexedAccessor<S> {
    pub(crate) name: &'static str,
    pub(crate) key_type: TypeId,
    pub(crate) value_type: TypeId,
    pub(crate) get: IndexedGet<S>,
    pub(crate) set: IndexedSet<S>,
}

#[derive(Clone, Copy)]
pub(crate) enum FieldRef {
    Scalar(usize),
    Indexed(usize),
}

/// The accessor surface of one state type.
///
/// Holds one type-erased accessor pair per declared field, plus the name
/// index used to resolve accesses. Built once per type and shared by every
/// encapsulator for that type.
pub struct StateLayout<S> {
    scalars: Vec<ScalarAccessor<S>>,
    indexed: Vec<IndexedAccessor<S>>,
    fields: HashMap<&'static str, FieldRef>,
    duplicate: Option<&'static str>,
}

impl<S> fmt::Debug for StateLayout<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateLayout")
            .field("scalars", &self.scalars.len())
            .field("indexed", &self.indexed.len())
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("duplicate", &self.duplicate)
            .finish()
    }
}

impl<S: ProcessState> StateLayout<S> {
    /// Start declaring a layout.
    pub fn builder() -> LayoutBuilder<S> {
        LayoutBuilder {
            scalars: Vec::new(),
            indexed: Vec::new(),
        }
    }

    pub(crate) fn field(&self, name: &str) -> Result<FieldRef, AccessError> {
        self.fields
            .get(name)
            .copied()
            .ok_or_else(|| AccessError::UnknownField(name.to_string()))
    }

    pub(crate) fn scalars(&self) -> &[ScalarAccessor<S>] {
        &self.scalars
    }

    pub(crate) fn indexed(&self) -> &[IndexedAccessor<S>] {
        &self.indexed
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        match self.duplicate {
            Some(name) => Err(format!("field '{name}' declared more than once")),
            None => Ok(()),
        }
    }
}

/// Declarative builder for a [`StateLayout`].
pub struct LayoutBuilder<S> {
    scalars: Vec<ScalarAccessor<S>>,
    indexed: Vec<IndexedAccessor<S>>,
}

impl<S: ProcessState> LayoutBuilder<S> {
    /// Declare a scalar accessor pair.
    ///
    /// The getter returns the field's current value by value; the setter
    /// replaces it.
    pub fn scalar<T, G, P>(mut self, name: &'static str, get: G, set: P) -> Self
    where
        T: FieldValue,
        G: Fn(&S) -> T + Send + Sync + 'static,
        P: Fn(&mut S, T) + Send + Sync + 'static,
    {
        self.scalars.push(ScalarAccessor {
            name,
            value_type: TypeId::of::<T>(),
            get: Box::new(move |state| Box::new(get(state))),
            set: Box::new(move |state, value| {
                let requested = value.type_name();
                let value: Box<dyn Any> = value;
                let value = value.downcast::<T>().map_err(|_| AccessError::TypeMismatch {
                    field: name.to_string(),
                    requested,
                })?;
                set(state, *value);
                Ok(())
            }),
        });
        self
    }

    /// Declare an indexed (keyed) accessor pair.
    ///
    /// The getter must be total: for keys without an entry it returns the
    /// field's default value rather than failing.
    pub fn indexed<K, T, G, P>(mut self, name: &'static str, get: G, set: P) -> Self
    where
        K: FieldKey + Eq + Hash + Clone,
        T: FieldValue,
        G: Fn(&S, &K) -> T + Send + Sync + 'static,
        P: Fn(&mut S, K, T) + Send + Sync + 'static,
    {
        self.indexed.push(IndexedAccessor {
            name,
            key_type: TypeId::of::<K>(),
            value_type: TypeId::of::<T>(),
            get: Box::new(move |state, key| {
                let key = (key as &dyn Any).downcast_ref::<K>().ok_or_else(|| {
                    AccessError::KeyTypeMismatch {
                        field: name.to_string(),
                        requested: key.type_name(),
                    }
                })?;
                Ok(Box::new(get(state, key)))
            }),
            set: Box::new(move |state, key, value| {
                let key = (key as &dyn Any)
                    .downcast_ref::<K>()
                    .ok_or_else(|| AccessError::KeyTypeMismatch {
                        field: name.to_string(),
                        requested: key.type_name(),
                    })?
                    .clone();
                let requested = value.type_name();
                let value: Box<dyn Any> = value;
                let value = value.downcast::<T>().map_err(|_| AccessError::TypeMismatch {
                    field: name.to_string(),
                    requested,
                })?;
                set(state, key, *value);
                Ok(())
            }),
        });
        self
    }

    /// Finish the declaration.
    pub fn build(self) -> StateLayout<S> {
        let mut fields = HashMap::new();
        let mut duplicate = None;
        for (index, accessor) in self.scalars.iter().enumerate() {
            if fields.insert(accessor.name, FieldRef::Scalar(index)).is_some() {
                duplicate = Some(accessor.name);
            }
        }
        for (index, accessor) in self.indexed.iter().enumerate() {
            if fields
                .insert(accessor.name, FieldRef::Indexed(index))
                .is_some()
            {
                duplicate = Some(accessor.name);
            }
        }
        StateLayout {
            scalars: self.scalars,
            indexed: self.indexed,
            fields,
            duplicate,
        }
    }
}

/// Global catalog of validated layouts, keyed by state type.
static LAYOUTS: Lazy<RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Resolve the cached [`StateLayout`] for a state type, building and
/// validating it on first use.
pub fn layout_of<S: ProcessState>() -> Result<Arc<StateLayout<S>>, RuntimeError> {
    let type_id = TypeId::of::<S>();
    if let Some(existing) = LAYOUTS.read().get(&type_id) {
        return Ok(Arc::clone(existing)
            .downcast::<StateLayout<S>>()
            .expect("layout catalog keyed by state type"));
    }

    let layout = S::layout();
    layout.validate().map_err(RuntimeError::Layout)?;

    let mut catalog = LAYOUTS.write();
    let entry = catalog
        .entry(type_id)
        .or_insert_with(|| Arc::new(layout) as Arc<dyn Any + Send + Sync>);
    Ok(Arc::clone(entry)
        .downcast::<StateLayout<S>>()
        .expect("layout catalog keyed by state type"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct Tally {
        total: i64,
        votes: HashMap<String, i64>,
    }

    crate::structural_deep!(Tally);

    impl ProcessState for Tally {
        fn layout() -> StateLayout<Self> {
            StateLayout::builder()
                .scalar("total", |s: &Self| s.total, |s: &mut Self, v| s.total = v)
                .indexed(
                    "votes",
                    |s: &Self, k: &String| s.votes.get(k).copied().unwrap_or(0),
                    |s: &mut Self, k: String, v: i64| {
                        s.votes.insert(k, v);
                    },
                )
                .build()
        }
    }

    #[test]
    fn test_layout_resolves_fields() {
        let layout = Tally::layout();
        assert!(matches!(layout.field("total"), Ok(FieldRef::Scalar(0))));
        assert!(matches!(layout.field("votes"), Ok(FieldRef::Indexed(0))));
        assert!(matches!(
            layout.field("missing"),
            Err(AccessError::UnknownField(_))
        ));
    }

    #[test]
    fn test_accessors_roundtrip_through_erasure() {
        let layout = Tally::layout();
        let mut state = Tally::default();

        let scalar = &layout.scalars()[0];
        (scalar.set)(&mut state, Box::new(42i64)).unwrap();
        let value = (scalar.get)(&state);
        assert!(value.equals_value(&42i64));

        let indexed = &layout.indexed()[0];
        (indexed.set)(&mut state, &"n1".to_string(), Box::new(7i64)).unwrap();
        let value = (indexed.get)(&state, &"n1".to_string()).unwrap();
        assert!(value.equals_value(&7i64));
        assert_eq!(state.votes.get("n1"), Some(&7));
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let layout = Tally::layout();
        let mut state = Tally::default();

        let scalar = &layout.scalars()[0];
        let err = (scalar.set)(&mut state, Box::new("nope".to_string())).unwrap_err();
        assert!(matches!(err, AccessError::TypeMismatch { .. }));

        let indexed = &layout.indexed()[0];
        let err = (indexed.get)(&state, &7u8).unwrap_err();
        assert!(matches!(err, AccessError::KeyTypeMismatch { .. }));
    }

    #[test]
    fn test_key_box_equality_and_hashing() {
        use std::collections::hash_map::DefaultHasher;

        let a = KeyBox::new("k1".to_string());
        let b = KeyBox::new("k1".to_string());
        let c = KeyBox::new("k2".to_string());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.matches(&"k1".to_string()));

        let hash = |k: &KeyBox| {
            let mut hasher = DefaultHasher::new();
            k.hash(&mut hasher);
            hasher.finish()
        };
        assert_eq!(hash(&a), hash(&b));
    }

    #[test]
    fn test_layout_catalog_caches_per_type() {
        let first = layout_of::<Tally>().unwrap();
        let second = layout_of::<Tally>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[derive(Debug, Clone, PartialEq, Default)]
    struct Doubled {
        x: i64,
    }

    crate::structural_deep!(Doubled);

    impl ProcessState for Doubled {
        fn layout() -> StateLayout<Self> {
            StateLayout::builder()
                .scalar("x", |s: &Self| s.x, |s: &mut Self, v| s.x = v)
                .scalar("x", |s: &Self| s.x, |s: &mut Self, v| s.x = v)
                .build()
        }
    }

    #[test]
    fn test_duplicate_fields_fail_validation() {
        let err = layout_of::<Doubled>().unwrap_err();
        assert!(matches!(err, RuntimeError::Layout(_)));
    }
}
