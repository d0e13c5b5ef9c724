//! Layered image builds.
//!
//! A native image can be built as a chain of layers: an initial layer, any
//! number of shared layers, and a final application layer, each compiled by
//! its own process. This crate is the state-sharing subsystem between those
//! processes. It carries singletons, named heap constants, defined symbols
//! and compilation behaviors from one layer into the next, and packs each
//! layer's output into a layer archive.
//!
//! # Primary Usage
//!
//! ```ignore
//! use layered_image::core::{BuildConfig, BuildSession, LayerRole};
//! use layered_image::persist::RecreateTable;
//!
//! let config = BuildConfig::from_env()?;
//! let session = BuildSession::open("out/libbase.nil", LayerRole::Application, "app", config, &RecreateTable::new())?;
//! let greeting = session.constants().get_constant("Greeting.INSTANCE")?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Errors, configuration, layer identity, build session
//! - [`heap`] - Heap constants as the registries see them
//! - [`persist`] - Typed key-value store and singleton persistence
//! - [`constants`] - Constant registry and relocatable constant table
//! - [`symbols`] - Cross-layer symbol tracking
//! - [`behavior`] - Per-entity compilation behaviors
//! - [`archive`] - Snapshot codec and layer archive files

pub mod archive;
pub mod behavior;
pub mod constants;
pub mod core;
pub mod heap;
pub mod persist;
pub mod symbols;

pub use crate::archive::{LayerArchive, LayerArchiveWriter, LayerOption, LayerSnapshot};
pub use crate::behavior::{BehaviorRegistry, CompilationBehavior};
pub use crate::constants::{ConstantRegistry, RelocatableConstantTable};
pub use crate::core::{BuildConfig, BuildSession, LayerError, LayerResult, LayerRole};
pub use crate::heap::{HeapConstant, HeapLayout, HeapObject, ImageHeap};
pub use crate::persist::{KeyValueStore, LayeredSingleton, PersistFlag, RecreateTable, SingletonStore};
pub use crate::symbols::SymbolTracker;
