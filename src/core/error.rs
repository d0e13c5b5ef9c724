// This module defines error types for the layered build using the thiserror crate for
// idiomatic Rust error handling. LayerError is the single error enum shared by every
// registry, the snapshot codec and the layer archive. Each variant belongs to one of two
// fatal classes: a user-facing abort (bad paths, malformed layer options, unreadable or
// foreign archives) that the build operator can fix, or an internal invariant violation
// (double registration, use after seal, slot table gaps, missing recreate entries) that
// signals a caller broke a registry contract. Variants carry the offending key, symbol,
// type name or path so the message is actionable. The module also provides
// LayerResult<T> as a convenience type alias for Result<T, LayerError>.

//! Error types for the layered build.
//!
//! Using thiserror for idiomatic error handling. Nothing here is meant to be
//! retried: any error aborts the current layer's build.

use std::path::PathBuf;
use thiserror::Error;

/// The two fatal error classes of a layer build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Something the build operator can fix.
    UserAbort,
    /// A registry contract was violated by a caller.
    InternalInvariant,
}

/// Main error type for the layer registries and archive.
#[derive(Error, Debug)]
pub enum LayerError {
    // ---------------------------------------------------------------------
    // User-facing aborts
    // ---------------------------------------------------------------------
    #[error("Cannot write layer archive to {}: {reason}", path.display())]
    NotWritable {
        path: PathBuf,
        reason: String,
    },

    #[error("Invalid layer name '{name}': {reason}")]
    InvalidLayerName {
        name: String,
        reason: String,
    },

    #[error("Missing file: {}", path.display())]
    MissingFile {
        path: PathBuf,
    },

    #[error("Malformed layer option '{option}': {reason}")]
    MalformedLayerOption {
        option: String,
        reason: String,
    },

    #[error("Invalid layer archive {}: {reason}", path.display())]
    InvalidArchive {
        path: PathBuf,
        reason: String,
    },

    #[error("Corrupt layer snapshot: {reason}")]
    CorruptSnapshot {
        reason: String,
    },

    #[error("Layer was built for platform '{found}' but this build targets '{expected}'")]
    PlatformMismatch {
        expected: String,
        found: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed layer properties: {0}")]
    Properties(#[from] serde_json::Error),

    // ---------------------------------------------------------------------
    // Internal invariant violations
    // ---------------------------------------------------------------------
    #[error("Key '{key}' is already bound to a different value")]
    DuplicateKey {
        key: String,
    },

    #[error("Constant key '{key}' is already registered")]
    AlreadyRegistered {
        key: String,
    },

    #[error("Protocol violation for '{key}': {reason}")]
    ProtocolViolation {
        key: String,
        reason: String,
    },

    #[error("No earlier layer registered constant '{key}'")]
    UnknownKey {
        key: String,
    },

    #[error("{registry} is sealed; late registration of '{item}'")]
    LateRegistration {
        registry: &'static str,
        item: String,
    },

    #[error("Relocatable constant table has no constant at slot {index} (table length {len})")]
    SlotLeak {
        index: u32,
        len: u32,
    },

    #[error("Constant {what} was never registered in the relocatable table")]
    UnregisteredConstant {
        what: String,
    },

    #[error("Future constants never finalized before the application layer: {keys:?}")]
    UnresolvedFuture {
        keys: Vec<String>,
    },

    #[error("Committed constant '{key}' is not part of the image heap")]
    CommittedNotMaterialized {
        key: String,
    },

    #[error("Symbol '{symbol}' is not defined by an earlier layer")]
    UnknownSymbol {
        symbol: String,
    },

    #[error("Singleton '{type_name}' is already installed")]
    DuplicateSingleton {
        type_name: String,
    },

    #[error("Singleton '{type_name}' is not installed")]
    SingletonNotFound {
        type_name: String,
    },

    #[error("Singleton '{type_name}' is forbidden in this layer")]
    ForbiddenSingleton {
        type_name: String,
    },

    #[error("Singleton '{type_name}' is not of the requested type")]
    SingletonTypeMismatch {
        type_name: String,
    },

    #[error("No recreate entry registered for '{name}'")]
    MissingRecreateEntry {
        name: String,
    },

    #[error("Deserialization failed for key '{key}': {reason}")]
    Deserialization {
        key: String,
        reason: String,
    },

    #[error("Object file emission failed: {0}")]
    ObjectWrite(#[from] object::write::Error),
}

impl LayerError {
    /// Which fatal class this error belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            LayerError::NotWritable { .. }
            | LayerError::InvalidLayerName { .. }
            | LayerError::MissingFile { .. }
            | LayerError::MalformedLayerOption { .. }
            | LayerError::InvalidArchive { .. }
            | LayerError::CorruptSnapshot { .. }
            | LayerError::PlatformMismatch { .. }
            | LayerError::Io(_)
            | LayerError::Properties(_) => ErrorClass::UserAbort,
            _ => ErrorClass::InternalInvariant,
        }
    }

    pub fn is_user_facing(&self) -> bool {
        self.class() == ErrorClass::UserAbort
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        LayerError::CorruptSnapshot {
            reason: reason.into(),
        }
    }

    pub(crate) fn late(registry: &'static str, item: impl Into<String>) -> Self {
        LayerError::LateRegistration {
            registry,
            item: item.into(),
        }
    }
}

/// Result type alias for layer operations.
pub type LayerResult<T> = Result<T, LayerError>;
