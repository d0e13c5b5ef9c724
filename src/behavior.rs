//! Declared compilation behaviors.
//!
//! Some methods must be compiled into the initial layer no matter which layer
//! first reaches them, others must be delayed until the application layer.
//! The registry only stores the declared intent; the scheduler that acts on it
//! lives elsewhere. Declarations are accepted until analysis begins and are
//! inherited by every later layer.

use std::fmt;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::archive::snapshot::BehaviorRecord;
use crate::core::error::{LayerError, LayerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompilationBehavior {
    PinToInitialLayer,
    FullyDelayToApplicationLayer,
}

impl CompilationBehavior {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            CompilationBehavior::PinToInitialLayer => 0,
            CompilationBehavior::FullyDelayToApplicationLayer => 1,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(CompilationBehavior::PinToInitialLayer),
            1 => Some(CompilationBehavior::FullyDelayToApplicationLayer),
            _ => None,
        }
    }
}

impl fmt::Display for CompilationBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompilationBehavior::PinToInitialLayer => "pin-to-initial-layer",
            CompilationBehavior::FullyDelayToApplicationLayer => "fully-delay-to-application-layer",
        })
    }
}

#[derive(Default)]
struct Inner {
    behaviors: HashMap<String, CompilationBehavior>,
    sealed: bool,
}

/// Set of `(entity, behavior)` declarations.
#[derive(Default)]
pub struct BehaviorRegistry {
    inner: RwLock<Inner>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the declarations of earlier layers.
    pub fn inherited(records: &[BehaviorRecord]) -> LayerResult<Self> {
        let registry = Self::new();
        for record in records {
            registry.register(&record.entity, record.behavior)?;
        }
        Ok(registry)
    }

    /// Declare `behavior` for `entity`. Re-declaring the same behavior is a
    /// no-op.
    pub fn register(&self, entity: &str, behavior: CompilationBehavior) -> LayerResult<()> {
        let mut inner = self.inner.write();
        if inner.sealed {
            return Err(LayerError::late("compilation behavior registry", entity));
        }
        match inner.behaviors.get(entity).copied() {
            Some(existing) if existing == behavior => Ok(()),
            Some(_) => Err(LayerError::DuplicateKey {
                key: entity.to_string(),
            }),
            None => {
                log::trace!("Compilation behavior {} for {}", behavior, entity);
                inner.behaviors.insert(entity.to_string(), behavior);
                Ok(())
            }
        }
    }

    /// Stop accepting declarations. Called when analysis begins.
    pub fn seal(&self) {
        let mut inner = self.inner.write();
        if !inner.sealed {
            inner.sealed = true;
            log::debug!("Compilation behaviors sealed ({} declared)", inner.behaviors.len());
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.read().sealed
    }

    pub fn behavior_of(&self, entity: &str) -> Option<CompilationBehavior> {
        self.inner.read().behaviors.get(entity).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.read().behaviors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().behaviors.is_empty()
    }

    /// Declarations in entity order.
    pub fn export(&self) -> Vec<BehaviorRecord> {
        let mut records: Vec<BehaviorRecord> = self
            .inner
            .read()
            .behaviors
            .iter()
            .map(|(entity, behavior)| BehaviorRecord {
                entity: entity.clone(),
                behavior: *behavior,
            })
            .collect();
        records.sort_by(|a, b| a.entity.cmp(&b.entity));
        records
    }
}
