// This module serves as the central hub for the layered build's core infrastructure,
// the pieces every registry and the archive depend on. It exports and organizes the
// error model (one error enum split into user-facing aborts and internal invariant
// violations), the build configuration (platform identifier, reference compression and
// checksum verification, with environment overrides), layer identity (ordinal ids and
// the initial / shared / application roles) and the build session that owns one
// instance of every registry for the duration of a single layer's build and drives the
// registries through their seal milestones in a fixed order.

//! Core layered-build infrastructure.
//!
//! # Key Components
//!
//! ## Errors (`error`)
//! - [`LayerError`] with its two fatal classes
//!
//! ## Configuration (`config`)
//! - Platform identifier, reference compression, checksum verification
//! - `LAYER_*` environment overrides
//!
//! ## Layer identity (`layer`)
//! - Ordinal [`LayerId`], [`LayerRole`] and the [`LayerDescriptor`] chain rules
//!
//! ## Build session (`session`)
//! - Owns every registry of one layer build
//! - Enforces the order of the seal milestones

pub mod config;
pub mod error;
pub mod layer;
pub mod session;
pub mod test_utils;

pub use config::{BuildConfig, ReferenceCompression};
pub use error::{ErrorClass, LayerError, LayerResult};
pub use layer::{LayerDescriptor, LayerId, LayerRole};
pub use session::{BuildSession, Milestone, SessionStats};
