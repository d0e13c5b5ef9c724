// This module implements the constant registry, a key-addressed store of compile-time
// constant values that lets a layer consume a value registered by an earlier layer by
// name. Each key of the current layer moves through an explicit tagged state: Candidate
// (registered optimistically during analysis), Committed (guaranteed to be in this
// layer's image heap), FuturePending (key and declared type reserved, value supplied by
// a later layer) and FutureFinalized. Bindings inherited from earlier layers are loaded
// from the prior snapshot and are read-only; getConstant only ever consults them, so a
// layer that finalizes a future never reads its own value back. Registration is
// linearizable per key through the DashMap entry API, and an RwLock phase guard makes
// every registration fail fast once the heap layout has sealed the registry.

//! Constant registry shared across layers.

use std::fmt;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::archive::snapshot::{ConstantRecord, ConstantState, HeapObjectRecord, LayerSnapshot};
use crate::core::error::{LayerError, LayerResult};
use crate::core::layer::{LayerDescriptor, LayerId, LayerRole};
use crate::heap::{HeapConstant, HeapLayout};

/// Forward reference handed out by [`ConstantRegistry::register_future`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuturePlaceholder {
    pub key: String,
    pub declared_type: String,
    /// Link name code generation may reference until the value exists.
    pub symbol: String,
}

impl FuturePlaceholder {
    fn new(key: &str, declared_type: &str) -> Self {
        Self {
            key: key.to_string(),
            declared_type: declared_type.to_string(),
            symbol: future_symbol(key),
        }
    }
}

/// Deterministic link name for the future bound to `key`.
pub fn future_symbol(key: &str) -> String {
    let sanitised: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("__layer_future_{}", sanitised)
}

/// State of a key registered by the current layer.
#[derive(Debug, Clone)]
pub enum ConstantEntry {
    Candidate(HeapConstant),
    Committed(HeapConstant),
    FuturePending {
        placeholder: FuturePlaceholder,
    },
    FutureFinalized {
        declared_type: String,
        value: HeapConstant,
    },
}

impl ConstantEntry {
    fn state_name(&self) -> &'static str {
        match self {
            ConstantEntry::Candidate(_) => "candidate",
            ConstantEntry::Committed(_) => "committed",
            ConstantEntry::FuturePending { .. } => "future (pending)",
            ConstantEntry::FutureFinalized { .. } => "future (finalized)",
        }
    }
}

/// A binding inherited from an earlier layer.
#[derive(Debug, Clone)]
enum PriorBinding {
    Committed {
        value: HeapConstant,
        layer: LayerId,
    },
    FuturePending {
        declared_type: String,
        layer: LayerId,
    },
    FutureFinalized {
        declared_type: String,
        value: HeapConstant,
        finalized_in: LayerId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Sealed,
}

/// Counts reported by [`ConstantRegistry::seal`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SealSummary {
    pub promoted: usize,
    pub dropped: usize,
    pub committed: usize,
    pub finalized: usize,
    pub pending: usize,
}

impl fmt::Display for SealSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} committed ({} promoted, {} dropped), {} finalized, {} pending",
            self.committed, self.promoted, self.dropped, self.finalized, self.pending
        )
    }
}

/// Constant registry for one layer build.
pub struct ConstantRegistry {
    layer: LayerDescriptor,
    prior: HashMap<String, PriorBinding>,
    entries: DashMap<String, ConstantEntry>,
    phase: RwLock<Phase>,
}

impl ConstantRegistry {
    /// Registry for a layer with no predecessor.
    pub fn new(layer: LayerDescriptor) -> Self {
        Self {
            layer,
            prior: HashMap::new(),
            entries: DashMap::new(),
            phase: RwLock::new(Phase::Open),
        }
    }

    /// Registry for `layer`, inheriting every binding recorded in `prior`.
    ///
    /// Records sharing a heap object id resolve to one [`HeapConstant`].
    pub fn from_snapshot(layer: LayerDescriptor, prior: &LayerSnapshot) -> LayerResult<Self> {
        let mut objects: HashMap<u32, HeapConstant> = HashMap::new();
        let mut resolve = |id: u32| -> LayerResult<HeapConstant> {
            if let Some(constant) = objects.get(&id) {
                return Ok(constant.clone());
            }
            let object = prior
                .heap_object(id)
                .ok_or_else(|| LayerError::corrupt(format!("missing heap object {}", id)))?;
            let constant = HeapConstant::new(object.clone());
            objects.insert(id, constant.clone());
            Ok(constant)
        };

        let mut bindings = HashMap::with_capacity(prior.constants.len());
        for record in &prior.constants {
            let binding = match &record.state {
                ConstantState::Committed { object_id, layer } => PriorBinding::Committed {
                    value: resolve(*object_id)?,
                    layer: *layer,
                },
                ConstantState::FuturePending { declared_type, layer } => PriorBinding::FuturePending {
                    declared_type: declared_type.clone(),
                    layer: *layer,
                },
                ConstantState::FutureFinalized {
                    declared_type,
                    object_id,
                    finalized_in,
                } => PriorBinding::FutureFinalized {
                    declared_type: declared_type.clone(),
                    value: resolve(*object_id)?,
                    finalized_in: *finalized_in,
                },
            };
            if bindings.insert(record.key.clone(), binding).is_some() {
                return Err(LayerError::corrupt(format!("constant '{}' recorded twice", record.key)));
            }
        }

        log::debug!(
            "Constant registry for {} inherits {} bindings",
            layer.id,
            bindings.len()
        );
        Ok(Self {
            layer,
            prior: bindings,
            entries: DashMap::new(),
            phase: RwLock::new(Phase::Open),
        })
    }

    pub fn layer(&self) -> &LayerDescriptor {
        &self.layer
    }

    pub fn is_sealed(&self) -> bool {
        *self.phase.read() == Phase::Sealed
    }

    /// Number of keys registered by this layer.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of bindings inherited from earlier layers.
    pub fn inherited_len(&self) -> usize {
        self.prior.len()
    }

    fn reject_prior(&self, key: &str) -> LayerResult<()> {
        if self.prior.contains_key(key) {
            return Err(LayerError::DuplicateKey { key: key.to_string() });
        }
        Ok(())
    }

    /// Record `value` as a candidate. Registering the same constant twice is
    /// a no-op; a different constant under the same key is an error.
    pub fn register_candidate(&self, key: &str, value: HeapConstant) -> LayerResult<()> {
        let phase = self.phase.read();
        if *phase == Phase::Sealed {
            return Err(LayerError::late("constant registry", key));
        }
        self.reject_prior(key)?;

        match self.entries.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                log::trace!("Constant candidate {} -> {:?}", key, value);
                slot.insert(ConstantEntry::Candidate(value));
                Ok(())
            }
            Entry::Occupied(slot) => match slot.get() {
                ConstantEntry::Candidate(existing) | ConstantEntry::Committed(existing) if *existing == value => Ok(()),
                _ => Err(LayerError::DuplicateKey { key: key.to_string() }),
            },
        }
    }

    /// Record `value` as committed: it must end up in this layer's heap.
    /// Upgrades a candidate holding the same constant.
    pub fn register_committed(&self, key: &str, value: HeapConstant) -> LayerResult<()> {
        let phase = self.phase.read();
        if *phase == Phase::Sealed {
            return Err(LayerError::late("constant registry", key));
        }
        self.reject_prior(key)?;

        match self.entries.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                log::trace!("Constant committed {} -> {:?}", key, value);
                slot.insert(ConstantEntry::Committed(value));
                Ok(())
            }
            Entry::Occupied(mut slot) => match slot.get() {
                ConstantEntry::Committed(existing) if *existing == value => Ok(()),
                ConstantEntry::Candidate(existing) if *existing == value => {
                    slot.insert(ConstantEntry::Committed(value));
                    Ok(())
                }
                _ => Err(LayerError::DuplicateKey { key: key.to_string() }),
            },
        }
    }

    /// Reserve `key` for a value supplied by a later layer.
    pub fn register_future(&self, key: &str, declared_type: &str) -> LayerResult<FuturePlaceholder> {
        let phase = self.phase.read();
        if *phase == Phase::Sealed {
            return Err(LayerError::late("constant registry", key));
        }
        if self.prior.contains_key(key) {
            return Err(LayerError::AlreadyRegistered { key: key.to_string() });
        }

        match self.entries.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                let placeholder = FuturePlaceholder::new(key, declared_type);
                log::debug!("Future {} reserved as {} ({})", key, declared_type, placeholder.symbol);
                slot.insert(ConstantEntry::FuturePending {
                    placeholder: placeholder.clone(),
                });
                Ok(placeholder)
            }
            Entry::Occupied(_) => Err(LayerError::AlreadyRegistered { key: key.to_string() }),
        }
    }

    /// Supply the value of a pending future, reserved by this layer or an
    /// earlier one.
    pub fn finalize_future(&self, key: &str, value: HeapConstant) -> LayerResult<()> {
        let phase = self.phase.read();
        if *phase == Phase::Sealed {
            return Err(LayerError::late("constant registry", key));
        }

        let check_type = |declared_type: &str| -> LayerResult<()> {
            if value.type_name() != declared_type {
                return Err(LayerError::ProtocolViolation {
                    key: key.to_string(),
                    reason: format!(
                        "future declared as {} finalized with a value of type {}",
                        declared_type,
                        value.type_name()
                    ),
                });
            }
            Ok(())
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let declared_type = match slot.get() {
                    ConstantEntry::FuturePending { placeholder } => placeholder.declared_type.clone(),
                    other => {
                        return Err(LayerError::ProtocolViolation {
                            key: key.to_string(),
                            reason: format!("cannot finalize a {} constant", other.state_name()),
                        })
                    }
                };
                check_type(&declared_type)?;
                log::debug!("Future {} finalized in the layer that reserved it", key);
                slot.insert(ConstantEntry::FutureFinalized { declared_type, value });
                Ok(())
            }
            Entry::Vacant(slot) => match self.prior.get(key) {
                Some(PriorBinding::FuturePending { declared_type, layer }) => {
                    check_type(declared_type)?;
                    log::debug!("Future {} reserved in {} finalized in {}", key, layer, self.layer.id);
                    slot.insert(ConstantEntry::FutureFinalized {
                        declared_type: declared_type.clone(),
                        value,
                    });
                    Ok(())
                }
                Some(_) => Err(LayerError::ProtocolViolation {
                    key: key.to_string(),
                    reason: "an earlier layer already bound a value to this key".into(),
                }),
                None => Err(LayerError::ProtocolViolation {
                    key: key.to_string(),
                    reason: "no future was registered under this key".into(),
                }),
            },
        }
    }

    /// Value bound to `key` by an earlier layer.
    pub fn get_constant(&self, key: &str) -> LayerResult<HeapConstant> {
        match self.prior.get(key) {
            Some(PriorBinding::Committed { value, .. }) | Some(PriorBinding::FutureFinalized { value, .. }) => {
                Ok(value.clone())
            }
            Some(PriorBinding::FuturePending { .. }) | None => Err(LayerError::UnknownKey { key: key.to_string() }),
        }
    }

    /// Whether `key` is bound in this layer or any earlier one, in any state.
    pub fn constant_exists(&self, key: &str) -> bool {
        self.prior.contains_key(key) || self.entries.contains_key(key)
    }

    /// Whether `key` is bound to an actual value, committed or finalized,
    /// in this layer or an earlier one. Candidates and pending futures do
    /// not count.
    pub fn has_value(&self, key: &str) -> bool {
        if let Some(entry) = self.entries.get(key) {
            if matches!(
                entry.value(),
                ConstantEntry::Committed(_) | ConstantEntry::FutureFinalized { .. }
            ) {
                return true;
            }
        }
        matches!(
            self.prior.get(key),
            Some(PriorBinding::Committed { .. }) | Some(PriorBinding::FutureFinalized { .. })
        )
    }

    /// This layer's entry for `key`.
    pub fn entry(&self, key: &str) -> Option<ConstantEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Placeholder for a future that is still pending, in this layer or an
    /// earlier one.
    pub fn pending_future(&self, key: &str) -> Option<FuturePlaceholder> {
        if let Some(entry) = self.entries.get(key) {
            return match entry.value() {
                ConstantEntry::FuturePending { placeholder } => Some(placeholder.clone()),
                _ => None,
            };
        }
        match self.prior.get(key) {
            Some(PriorBinding::FuturePending { declared_type, .. }) => Some(FuturePlaceholder::new(key, declared_type)),
            _ => None,
        }
    }

    /// Committed and finalized values of this layer, in key order. The heap
    /// builder roots these.
    pub fn roots(&self) -> Vec<HeapConstant> {
        let mut roots: Vec<(String, HeapConstant)> = self
            .entries
            .iter()
            .filter_map(|entry| match entry.value() {
                ConstantEntry::Committed(value) | ConstantEntry::FutureFinalized { value, .. } => {
                    Some((entry.key().clone(), value.clone()))
                }
                _ => None,
            })
            .collect();
        roots.sort_by(|a, b| a.0.cmp(&b.0));
        roots.into_iter().map(|(_, value)| value).collect()
    }

    /// Settle candidate decisions against the final heap layout.
    ///
    /// Candidates that were materialized become committed and the rest are
    /// dropped. In an application layer every future must be finalized.
    pub fn seal(&self, heap: &dyn HeapLayout) -> LayerResult<SealSummary> {
        let mut phase = self.phase.write();
        if *phase == Phase::Sealed {
            return Err(LayerError::ProtocolViolation {
                key: "constant registry".into(),
                reason: "already sealed".into(),
            });
        }

        // No entry changes until every check has passed.
        let mut summary = SealSummary::default();
        let mut promoted = Vec::new();
        let mut dropped = Vec::new();
        let mut unresolved = Vec::new();
        for entry in self.entries.iter() {
            match entry.value() {
                ConstantEntry::Candidate(value) if heap.is_materialized(value) => {
                    promoted.push((entry.key().clone(), value.clone()));
                }
                ConstantEntry::Candidate(_) => dropped.push(entry.key().clone()),
                ConstantEntry::Committed(value) | ConstantEntry::FutureFinalized { value, .. }
                    if !heap.is_materialized(value) =>
                {
                    return Err(LayerError::CommittedNotMaterialized {
                        key: entry.key().clone(),
                    });
                }
                ConstantEntry::Committed(_) => summary.committed += 1,
                ConstantEntry::FutureFinalized { .. } => summary.finalized += 1,
                ConstantEntry::FuturePending { .. } => {
                    summary.pending += 1;
                    unresolved.push(entry.key().clone());
                }
            }
        }
        unresolved.extend(
            self.prior
                .iter()
                .filter(|(key, binding)| {
                    matches!(binding, PriorBinding::FuturePending { .. }) && !self.entries.contains_key(key.as_str())
                })
                .map(|(key, _)| key.clone()),
        );
        if self.layer.role == LayerRole::Application && !unresolved.is_empty() {
            unresolved.sort();
            return Err(LayerError::UnresolvedFuture { keys: unresolved });
        }

        for (key, value) in promoted {
            if let Some(mut entry) = self.entries.get_mut(&key) {
                *entry.value_mut() = ConstantEntry::Committed(value);
                summary.promoted += 1;
                summary.committed += 1;
            }
        }
        for key in &dropped {
            log::warn!("Constant candidate '{}' was not materialized; dropped", key);
            self.entries.remove(key);
        }
        summary.dropped = dropped.len();

        *phase = Phase::Sealed;
        log::debug!("Constant registry sealed for {}: {}", self.layer.id, summary);
        Ok(summary)
    }

    /// Cumulative constant records for the next layer, inherited bindings
    /// first resolved against this layer's finalizations. Heap object ids
    /// are assigned densely from 0 in key order.
    pub fn export(&self) -> LayerResult<(Vec<ConstantRecord>, Vec<HeapObjectRecord>)> {
        if !self.is_sealed() {
            return Err(LayerError::ProtocolViolation {
                key: "constant registry".into(),
                reason: "export before seal".into(),
            });
        }

        let mut keys: Vec<String> = self.prior.keys().cloned().collect();
        keys.extend(
            self.entries
                .iter()
                .map(|entry| entry.key().clone())
                .filter(|key| !self.prior.contains_key(key.as_str())),
        );
        keys.sort();

        let mut ids: HashMap<usize, u32> = HashMap::new();
        let mut objects = Vec::new();
        let mut object_id = |value: &HeapConstant| -> u32 {
            *ids.entry(value.identity()).or_insert_with(|| {
                let id = objects.len() as u32;
                objects.push(HeapObjectRecord {
                    id,
                    object: value.object().clone(),
                });
                id
            })
        };

        let current = self.layer.id;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let state = match (self.entries.get(&key).map(|e| e.value().clone()), self.prior.get(&key)) {
                (Some(ConstantEntry::Committed(value)), _) => ConstantState::Committed {
                    object_id: object_id(&value),
                    layer: current,
                },
                (Some(ConstantEntry::FuturePending { placeholder }), _) => ConstantState::FuturePending {
                    declared_type: placeholder.declared_type,
                    layer: current,
                },
                (Some(ConstantEntry::FutureFinalized { declared_type, value }), _) => {
                    ConstantState::FutureFinalized {
                        declared_type,
                        object_id: object_id(&value),
                        finalized_in: current,
                    }
                }
                (Some(ConstantEntry::Candidate(_)), _) => {
                    return Err(LayerError::ProtocolViolation {
                        key,
                        reason: "candidate survived seal".into(),
                    })
                }
                (None, Some(PriorBinding::Committed { value, layer })) => ConstantState::Committed {
                    object_id: object_id(value),
                    layer: *layer,
                },
                (None, Some(PriorBinding::FuturePending { declared_type, layer })) => ConstantState::FuturePending {
                    declared_type: declared_type.clone(),
                    layer: *layer,
                },
                (
                    None,
                    Some(PriorBinding::FutureFinalized {
                        declared_type,
                        value,
                        finalized_in,
                    }),
                ) => ConstantState::FutureFinalized {
                    declared_type: declared_type.clone(),
                    object_id: object_id(value),
                    finalized_in: *finalized_in,
                },
                (None, None) => continue,
            };
            records.push(ConstantRecord { key, state });
        }

        log::debug!(
            "Exported {} constant records, {} heap objects",
            records.len(),
            objects.len()
        );
        Ok((records, objects))
    }
}
