// This module groups everything that carries process-global singleton state from one
// layer's build process into the next: the closed typed key-value store used as the
// persisted payload, the singleton store with its per-type persist flags and lookup
// surface, and the loader that recreates singletons by declared name from a prior
// layer's snapshot through an explicit registration table.

//! Singleton persistence across layers.
//!
//! # Key Components
//!
//! ## Typed key-value store (`key_value`)
//! - Closed value model: i32, i64, string, and lists of i32, bool and string
//! - Read/write symmetry, shape mismatches are fatal
//!
//! ## Singleton store (`singleton`)
//! - One live instance per type name, one instance may fill several roles
//! - CREATE / FORBIDDEN / NOTHING persist flags
//!
//! ## Loader (`loader`)
//! - Recreate-by-name through a [`loader::RecreateTable`]

pub mod key_value;
pub mod loader;
pub mod singleton;

pub use key_value::{KeyValueReader, KeyValueStore, KeyValueWriter, KvValue};
pub use loader::{load_image_singletons, LoadedSingletons, Recreate, RecreateFn, RecreateTable};
pub use singleton::{Installation, LayeredSingleton, PersistFlag, SingletonStore, SingletonType};
