//! Cross-layer constants.
//!
//! - [`registry`]: named constants with the candidate / committed / future
//!   protocol
//! - [`relocatable`]: the per-layer slot table generated code loads through

pub mod registry;
pub mod relocatable;

pub use registry::{ConstantEntry, ConstantRegistry, FuturePlaceholder, SealSummary};
pub use relocatable::{LoadExpr, RelocatableConstantTable};
