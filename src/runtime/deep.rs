//! Deep clone and deep comparison capabilities
//!
//! Every corruption check in the runtime bottoms out in the two helpers
//! defined here: [`clone`] produces the snapshots and shadow copies, and
//! [`compare`] decides whether two copies still agree. Value types opt in
//! through [`DeepClone`] and [`DeepEquals`]; immutable values can short-cut
//! both through the [`ReadOnly`] marker, which turns cloning into reference
//! aliasing.
//!
//! Both helpers are side-effect-free and never panic on well-formed input.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

/// Marker for values that are immutable for their entire lifetime.
///
/// A `ReadOnly` value shared through an [`Arc`] is cloned by aliasing rather
/// than copying: both state copies may point at the same allocation without
/// weakening corruption detection, because the bytes can never legitimately
/// change. Implementors promise the absence of interior mutability.
pub trait ReadOnly {}

/// Capability to produce a fresh, structurally independent copy.
///
/// `clone_deep` must copy every semantically meaningful member recursively;
/// transient members (memoized clones, caches) should be reset instead of
/// copied. For plain aggregates deriving `Clone`, [`structural_deep!`]
/// produces this implementation.
///
/// [`structural_deep!`]: crate::structural_deep
pub trait DeepClone {
    /// Create a deep copy of this value.
    fn clone_deep(&self) -> Self;
}

/// Capability to compare two values member by member.
///
/// `equals_deep` must consider every semantically meaningful member and skip
/// non-semantic ones — a message's redundancy data, for example, is excluded
/// so that attaching it does not make a message unequal to its clone.
pub trait DeepEquals {
    /// Compare this value against another of the same type.
    fn equals_deep(&self, other: &Self) -> bool;
}

/// Deep-clone a value through its [`DeepClone`] capability.
pub fn clone<T: DeepClone>(value: &T) -> T {
    value.clone_deep()
}

/// Deep-compare two values through their [`DeepEquals`] capability.
pub fn compare<T: DeepEquals + ?Sized>(a: &T, b: &T) -> bool {
    a.equals_deep(b)
}

/// Implements [`DeepClone`] and [`DeepEquals`] for plain aggregate types
/// whose `Clone` and `PartialEq` are already structural — no shared mutable
/// interior, no transient members.
///
/// ```
/// use tandem::structural_deep;
///
/// #[derive(Debug, Clone, PartialEq)]
/// struct Ballot {
///     round: u64,
///     proposer: u32,
/// }
///
/// structural_deep!(Ballot);
/// ```
#[macro_export]
macro_rules! structural_deep {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::runtime::deep::DeepClone for $ty {
            fn clone_deep(&self) -> Self {
                ::std::clone::Clone::clone(self)
            }
        }

        impl $crate::runtime::deep::DeepEquals for $ty {
            fn equals_deep(&self, other: &Self) -> bool {
                self == other
            }
        }
    )+};
}

macro_rules! deep_by_value {
    ($($ty:ty),+ $(,)?) => {$(
        impl DeepClone for $ty {
            fn clone_deep(&self) -> Self {
                *self
            }
        }

        impl DeepEquals for $ty {
            fn equals_deep(&self, other: &Self) -> bool {
                self == other
            }
        }
    )+};
}

deep_by_value!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize
);

// Floats compare bitwise: a corrupted NaN payload is still corruption, and a
// legitimate NaN must not read as a mismatch against its own clone.
impl DeepClone for f32 {
    fn clone_deep(&self) -> Self {
        *self
    }
}

impl DeepEquals for f32 {
    fn equals_deep(&self, other: &Self) -> bool {
        self.to_bits() == other.to_bits()
    }
}

impl DeepClone for f64 {
    fn clone_deep(&self) -> Self {
        *self
    }
}

impl DeepEquals for f64 {
    fn equals_deep(&self, other: &Self) -> bool {
        self.to_bits() == other.to_bits()
    }
}

impl DeepClone for String {
    fn clone_deep(&self) -> Self {
        self.clone()
    }
}

impl DeepEquals for String {
    fn equals_deep(&self, other: &Self) -> bool {
        self == other
    }
}

impl<T: DeepClone> DeepClone for Option<T> {
    fn clone_deep(&self) -> Self {
        self.as_ref().map(|v| v.clone_deep())
    }
}

impl<T: DeepEquals> DeepEquals for Option<T> {
    fn equals_deep(&self, other: &Self) -> bool {
        match (self, other) {
            (None, None) => true,
            (Some(a), Some(b)) => a.equals_deep(b),
            _ => false,
        }
    }
}

impl<T: DeepClone> DeepClone for Box<T> {
    fn clone_deep(&self) -> Self {
        Box::new((**self).clone_deep())
    }
}

impl<T: DeepEquals> DeepEquals for Box<T> {
    fn equals_deep(&self, other: &Self) -> bool {
        (**self).equals_deep(other)
    }
}

impl<T: DeepClone> DeepClone for Vec<T> {
    fn clone_deep(&self) -> Self {
        self.iter().map(|v| v.clone_deep()).collect()
    }
}

impl<T: DeepEquals> DeepEquals for Vec<T> {
    fn equals_deep(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self.iter().zip(other.iter()).all(|(a, b)| a.equals_deep(b))
    }
}

impl<T: DeepClone, const N: usize> DeepClone for [T; N] {
    fn clone_deep(&self) -> Self {
        std::array::from_fn(|i| self[i].clone_deep())
    }
}

impl<T: DeepEquals, const N: usize> DeepEquals for [T; N] {
    fn equals_deep(&self, other: &Self) -> bool {
        self.iter().zip(other.iter()).all(|(a, b)| a.equals_deep(b))
    }
}

impl<A: DeepClone, B: DeepClone> DeepClone for (A, B) {
    fn clone_deep(&self) -> Self {
        (self.0.clone_deep(), self.1.clone_deep())
    }
}

impl<A: DeepEquals, B: DeepEquals> DeepEquals for (A, B) {
    fn equals_deep(&self, other: &Self) -> bool {
        self.0.equals_deep(&other.0) && self.1.equals_deep(&other.1)
    }
}

impl<A: DeepClone, B: DeepClone, C: DeepClone> DeepClone for (A, B, C) {
    fn clone_deep(&self) -> Self {
        (
            self.0.clone_deep(),
            self.1.clone_deep(),
            self.2.clone_deep(),
        )
    }
}

impl<A: DeepEquals, B: DeepEquals, C: DeepEquals> DeepEquals for (A, B, C) {
    fn equals_deep(&self, other: &Self) -> bool {
        self.0.equals_deep(&other.0)
            && self.1.equals_deep(&other.1)
            && self.2.equals_deep(&other.2)
    }
}

impl<K: Eq + Hash + Clone, V: DeepClone> DeepClone for HashMap<K, V> {
    fn clone_deep(&self) -> Self {
        self.iter()
            .map(|(k, v)| (k.clone(), v.clone_deep()))
            .collect()
    }
}

impl<K: Eq + Hash, V: DeepEquals> DeepEquals for HashMap<K, V> {
    fn equals_deep(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|o| v.equals_deep(o)))
    }
}

impl<K: Ord + Clone, V: DeepClone> DeepClone for BTreeMap<K, V> {
    fn clone_deep(&self) -> Self {
        self.iter()
            .map(|(k, v)| (k.clone(), v.clone_deep()))
            .collect()
    }
}

impl<K: Ord, V: DeepEquals> DeepEquals for BTreeMap<K, V> {
    fn equals_deep(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|o| v.equals_deep(o)))
    }
}

impl<T: Eq + Hash + Clone> DeepClone for HashSet<T> {
    fn clone_deep(&self) -> Self {
        self.iter().cloned().collect()
    }
}

impl<T: Eq + Hash> DeepEquals for HashSet<T> {
    fn equals_deep(&self, other: &Self) -> bool {
        self == other
    }
}

impl<T: Ord + Clone> DeepClone for BTreeSet<T> {
    fn clone_deep(&self) -> Self {
        self.iter().cloned().collect()
    }
}

impl<T: Ord> DeepEquals for BTreeSet<T> {
    fn equals_deep(&self, other: &Self) -> bool {
        self == other
    }
}

// Interior-mutable scalar cells. These appear in message payloads so tests
// and fault-injection harnesses can flip bits in place behind a shared
// reference, exactly the corruption this runtime exists to catch.
impl<T: Copy> DeepClone for Cell<T> {
    fn clone_deep(&self) -> Self {
        Cell::new(self.get())
    }
}

impl<T: Copy + PartialEq> DeepEquals for Cell<T> {
    fn equals_deep(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

// The ReadOnly fast path: cloning aliases, comparison short-cuts on pointer
// identity before falling back to content equality.
impl<T: ReadOnly + ?Sized> DeepClone for Arc<T> {
    fn clone_deep(&self) -> Self {
        Arc::clone(self)
    }
}

impl<T: ReadOnly + PartialEq + ?Sized> DeepEquals for Arc<T> {
    fn equals_deep(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other) || **self == **other
    }
}
