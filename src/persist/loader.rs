//! Recreating singletons from a prior layer's snapshot.
//!
//! Persistable singleton types register a named constructor in a
//! [`RecreateTable`] before the loader runs. The loader looks each CREATE
//! record's recreate name up in that table, so reconstruction goes by declared
//! name and never by runtime type introspection.

use std::collections::BTreeMap;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::archive::snapshot::LayerSnapshot;
use crate::core::error::{LayerError, LayerResult};
use crate::persist::key_value::KeyValueReader;
use crate::persist::singleton::{LayeredSingleton, PersistFlag, SingletonType};

/// Constructor recreating a singleton from its persisted payload.
pub type RecreateFn = fn(&KeyValueReader<'_>) -> LayerResult<Arc<dyn LayeredSingleton>>;

/// A singleton type that can be recreated from a loader.
pub trait Recreate: SingletonType {
    /// Must be deterministic given identical payload.
    fn create_from_loader(reader: &KeyValueReader<'_>) -> LayerResult<Self>;
}

fn recreate_thunk<T: Recreate>(reader: &KeyValueReader<'_>) -> LayerResult<Arc<dyn LayeredSingleton>> {
    Ok(Arc::new(T::create_from_loader(reader)?))
}

/// Build-time table of named recreate functions.
#[derive(Default)]
pub struct RecreateTable {
    entries: HashMap<String, RecreateFn>,
}

impl RecreateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, recreate: RecreateFn) -> LayerResult<()> {
        if self.entries.contains_key(name) {
            return Err(LayerError::DuplicateKey { key: name.to_string() });
        }
        self.entries.insert(name.to_string(), recreate);
        Ok(())
    }

    /// Register `T` under its type name.
    pub fn register_type<T: Recreate>(&mut self) -> LayerResult<()> {
        self.register(T::TYPE_NAME, recreate_thunk::<T>)
    }

    pub fn get(&self, name: &str) -> Option<RecreateFn> {
        self.entries.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A freshly recreated instance and every type name it was installed under.
pub struct LoadedSingleton {
    pub instance: Arc<dyn LayeredSingleton>,
    pub type_names: Vec<String>,
}

/// A type forbidden by an earlier layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForbiddenEntry {
    pub type_name: String,
    pub initial_layer_only: bool,
    pub constant_key: Option<String>,
}

/// Output of [`load_image_singletons`].
#[derive(Default)]
pub struct LoadedSingletons {
    pub instances: Vec<LoadedSingleton>,
    pub forbidden: Vec<ForbiddenEntry>,
}

impl LoadedSingletons {
    /// Type names mapped to the forbidden sentinel.
    pub fn forbidden_names(&self) -> impl Iterator<Item = &str> {
        self.forbidden.iter().map(|f| f.type_name.as_str())
    }
}

/// Recreate every CREATE singleton of `snapshot` and collect the forbidden
/// types. Records sharing an object id yield one instance.
pub fn load_image_singletons(snapshot: &LayerSnapshot, table: &RecreateTable) -> LayerResult<LoadedSingletons> {
    let mut by_object: BTreeMap<i32, Vec<String>> = BTreeMap::new();
    let mut loaded = LoadedSingletons::default();

    for record in &snapshot.singletons {
        match record.flag {
            PersistFlag::Create => by_object
                .entry(record.object_id)
                .or_default()
                .push(record.type_name.clone()),
            PersistFlag::Forbidden => loaded.forbidden.push(ForbiddenEntry {
                type_name: record.type_name.clone(),
                initial_layer_only: record.initial_layer_only,
                constant_key: record.constant_key.clone(),
            }),
            PersistFlag::Nothing => {}
        }
    }

    for (object_id, type_names) in by_object {
        let object = snapshot.singleton_object(object_id).ok_or_else(|| LayerError::CorruptSnapshot {
            reason: format!("singleton object {} is missing", object_id),
        })?;
        let recreate = table
            .get(&object.recreate_name)
            .ok_or_else(|| LayerError::MissingRecreateEntry {
                name: object.recreate_name.clone(),
            })?;
        let instance = recreate(&object.store.reader())?;
        log::debug!(
            "Recreated singleton {} for {:?} from layer {}",
            object.recreate_name,
            type_names,
            snapshot.layer.id
        );
        loaded.instances.push(LoadedSingleton { instance, type_names });
    }

    Ok(loaded)
}
