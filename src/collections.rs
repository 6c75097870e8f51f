//! Hash map alias backed by gxhash when the `gxhash` feature is on
//!
//! gxhash needs AES and SSE2 intrinsics. Building without the feature falls
//! back to the std map, with a [`HashMapExt`] shim so call sites can use
//! `HashMap::new()` either way.

#[cfg(feature = "gxhash")]
pub use gxhash::{HashMap, HashMapExt};

#[cfg(not(feature = "gxhash"))]
pub use std::collections::HashMap;

/// Constructors the gxhash map exposes as a trait
#[cfg(not(feature = "gxhash"))]
pub trait HashMapExt {
    /// Empty map
    fn new() -> Self;

    /// Empty map with room for `capacity` entries
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<K, V> HashMapExt for HashMap<K, V> {
    fn new() -> Self {
        HashMap::default()
    }

    fn with_capacity(capacity: usize) -> Self {
        HashMap::with_capacity_and_hasher(capacity, Default::default())
    }
}
