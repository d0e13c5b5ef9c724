// This module implements the singleton persistence store. Every process-global singleton
// of a layer build is installed here under one or more type names, at most one live
// instance per name. At the end of a layer's build each distinct instance is asked once,
// through prepare_persist, to write its forward-carrying state into a fresh key-value
// store and to report the PersistFlag recorded for it: CREATE carries the state into the
// next layer where it is recreated by name, FORBIDDEN marks the type as unreachable in
// later layers, NOTHING keeps it layer-local. The store then emits one record per type
// name plus one object record per CREATE instance, object ids starting at 1. Forbidden
// types are kept as sentinel slots so a later lookup fails with a distinguishable
// forbidden error, and are re-emitted so the prohibition holds for the whole chain.

//! Singleton persistence store and lookup surface.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::archive::snapshot::{SingletonObjectRecord, SingletonRecord, NO_OBJECT};
use crate::constants::registry::ConstantRegistry;
use crate::core::error::{LayerError, LayerResult};
use crate::heap::HeapConstant;
use crate::persist::key_value::{KeyValueStore, KeyValueWriter};
use crate::persist::loader::LoadedSingletons;

/// Per-type directive controlling whether singleton state crosses layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistFlag {
    /// State is persisted and the singleton is recreated in the next layer.
    Create,
    /// The type must never be reachable in later layers.
    Forbidden,
    /// The singleton is layer-local.
    Nothing,
}

impl PersistFlag {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            PersistFlag::Create => 0,
            PersistFlag::Forbidden => 1,
            PersistFlag::Nothing => 2,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PersistFlag::Create),
            1 => Some(PersistFlag::Forbidden),
            2 => Some(PersistFlag::Nothing),
            _ => None,
        }
    }
}

impl fmt::Display for PersistFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PersistFlag::Create => "CREATE",
            PersistFlag::Forbidden => "FORBIDDEN",
            PersistFlag::Nothing => "NOTHING",
        })
    }
}

/// Where a singleton may be installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installation {
    Independent,
    /// Only the initial layer ever holds a live instance.
    InitialLayerOnly,
}

/// A process-global singleton participating in layered builds.
pub trait LayeredSingleton: Any + Send + Sync {
    /// Write forward-carrying state and report the flag for this layer.
    fn prepare_persist(&self, writer: &mut KeyValueWriter) -> LayerResult<PersistFlag>;

    /// Name under which the recreate function is registered. Required for
    /// singletons that return [`PersistFlag::Create`].
    fn recreate_name(&self) -> Option<&'static str> {
        None
    }

    fn installation(&self) -> Installation {
        Installation::Independent
    }

    /// Upcast for typed lookup. Implementations return `self`.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A singleton type addressable by a stable name.
pub trait SingletonType: LayeredSingleton + Sized {
    const TYPE_NAME: &'static str;
}

enum SingletonSlot {
    Live(Arc<dyn LayeredSingleton>),
    /// Sentinel for a type forbidden by an earlier layer.
    Forbidden {
        initial_layer_only: bool,
        constant_key: Option<String>,
    },
}

struct PersistInfo {
    flag: PersistFlag,
    id: i32,
    initial_layer_only: bool,
    class_name: String,
    recreate_name: String,
    store: KeyValueStore,
}

/// Process-global singleton table for one layer build.
#[derive(Default)]
pub struct SingletonStore {
    slots: RwLock<HashMap<String, SingletonSlot>>,
    persisted: RwLock<bool>,
}

fn instance_identity(instance: &Arc<dyn LayeredSingleton>) -> usize {
    Arc::as_ptr(instance) as *const () as usize
}

impl SingletonStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `instance` under its own type name.
    pub fn install<T: SingletonType>(&self, instance: Arc<T>) -> LayerResult<()> {
        self.install_as(T::TYPE_NAME, instance)
    }

    /// Install `instance` under `type_name`. One instance may be installed
    /// under several names.
    pub fn install_as(&self, type_name: &str, instance: Arc<dyn LayeredSingleton>) -> LayerResult<()> {
        let persisted = self.persisted.read();
        if *persisted {
            return Err(LayerError::late("singleton store", type_name));
        }
        let mut slots = self.slots.write();
        match slots.get(type_name) {
            Some(SingletonSlot::Live(_)) => Err(LayerError::DuplicateSingleton {
                type_name: type_name.to_string(),
            }),
            Some(SingletonSlot::Forbidden { .. }) => Err(LayerError::ForbiddenSingleton {
                type_name: type_name.to_string(),
            }),
            None => {
                log::trace!("Singleton installed: {}", type_name);
                slots.insert(type_name.to_string(), SingletonSlot::Live(instance));
                Ok(())
            }
        }
    }

    /// Install everything reconstructed from the prior layer's snapshot.
    pub fn install_loaded(&self, loaded: LoadedSingletons) -> LayerResult<()> {
        for entry in loaded.instances {
            for type_name in &entry.type_names {
                self.install_as(type_name, entry.instance.clone())?;
            }
        }
        let mut slots = self.slots.write();
        for forbidden in loaded.forbidden {
            if slots.contains_key(&forbidden.type_name) {
                return Err(LayerError::DuplicateSingleton {
                    type_name: forbidden.type_name,
                });
            }
            slots.insert(
                forbidden.type_name,
                SingletonSlot::Forbidden {
                    initial_layer_only: forbidden.initial_layer_only,
                    constant_key: forbidden.constant_key,
                },
            );
        }
        Ok(())
    }

    /// Typed lookup.
    pub fn lookup<T: SingletonType>(&self) -> LayerResult<Arc<T>> {
        let instance = self.lookup_named(T::TYPE_NAME)?;
        instance
            .as_any()
            .downcast::<T>()
            .map_err(|_| LayerError::SingletonTypeMismatch {
                type_name: T::TYPE_NAME.to_string(),
            })
    }

    /// Lookup by type name.
    pub fn lookup_named(&self, type_name: &str) -> LayerResult<Arc<dyn LayeredSingleton>> {
        match self.slots.read().get(type_name) {
            Some(SingletonSlot::Live(instance)) => Ok(instance.clone()),
            Some(SingletonSlot::Forbidden { .. }) => Err(LayerError::ForbiddenSingleton {
                type_name: type_name.to_string(),
            }),
            None => Err(LayerError::SingletonNotFound {
                type_name: type_name.to_string(),
            }),
        }
    }

    /// Whether a live instance is installed for `T`.
    pub fn exists<T: SingletonType>(&self) -> bool {
        self.exists_named(T::TYPE_NAME)
    }

    pub fn exists_named(&self, type_name: &str) -> bool {
        matches!(self.slots.read().get(type_name), Some(SingletonSlot::Live(_)))
    }

    pub fn is_forbidden(&self, type_name: &str) -> bool {
        matches!(self.slots.read().get(type_name), Some(SingletonSlot::Forbidden { .. }))
    }

    /// Value a forbidden initial-layer singleton exposed through the constant
    /// registry when its layer sealed.
    pub fn initial_layer_constant(&self, type_name: &str, constants: &ConstantRegistry) -> LayerResult<HeapConstant> {
        let key = match self.slots.read().get(type_name) {
            Some(SingletonSlot::Forbidden {
                initial_layer_only: true,
                constant_key: Some(key),
            }) => key.clone(),
            Some(SingletonSlot::Forbidden { .. }) => {
                return Err(LayerError::ForbiddenSingleton {
                    type_name: type_name.to_string(),
                })
            }
            Some(SingletonSlot::Live(_)) | None => {
                return Err(LayerError::SingletonNotFound {
                    type_name: type_name.to_string(),
                })
            }
        };
        constants.get_constant(&key)
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Run the persist phase and produce the snapshot records.
    ///
    /// `has_value` asks the constant registry whether a key is bound to a
    /// value. Only initial-layer-only singletons get the escape-path key.
    /// After this call no further singletons can be installed.
    pub fn persist(
        &self,
        has_value: impl Fn(&str) -> bool,
    ) -> LayerResult<(Vec<SingletonRecord>, Vec<SingletonObjectRecord>)> {
        {
            let mut persisted = self.persisted.write();
            if *persisted {
                return Err(LayerError::ProtocolViolation {
                    key: "singleton store".into(),
                    reason: "persist phase already ran".into(),
                });
            }
            *persisted = true;
        }

        let slots = self.slots.read();
        let mut keys: Vec<&String> = slots.keys().collect();
        keys.sort();

        let mut infos: HashMap<usize, PersistInfo> = HashMap::new();
        let mut next_id = 1;
        let mut records = Vec::with_capacity(keys.len());

        for key in keys {
            let record = match &slots[key] {
                SingletonSlot::Forbidden {
                    initial_layer_only,
                    constant_key,
                } => SingletonRecord {
                    type_name: key.clone(),
                    flag: PersistFlag::Forbidden,
                    object_id: NO_OBJECT,
                    initial_layer_only: *initial_layer_only,
                    constant_key: constant_key.clone().filter(|_| *initial_layer_only),
                },
                SingletonSlot::Live(instance) => {
                    let identity = instance_identity(instance);
                    if !infos.contains_key(&identity) {
                        let info = Self::prepare(key, instance, &mut next_id)?;
                        infos.insert(identity, info);
                    }
                    let info = &infos[&identity];
                    let constant_key = (info.initial_layer_only && info.flag == PersistFlag::Forbidden && has_value(key))
                        .then(|| key.clone());
                    SingletonRecord {
                        type_name: key.clone(),
                        flag: info.flag,
                        object_id: info.id,
                        initial_layer_only: info.initial_layer_only,
                        constant_key,
                    }
                }
            };
            log::trace!("Singleton {} persisted as {}", record.type_name, record.flag);
            records.push(record);
        }

        let mut objects: Vec<SingletonObjectRecord> = infos
            .into_values()
            .filter(|info| info.flag == PersistFlag::Create)
            .map(|info| SingletonObjectRecord {
                id: info.id,
                class_name: info.class_name,
                recreate_name: info.recreate_name,
                store: info.store,
            })
            .collect();
        objects.sort_by_key(|object| object.id);

        log::debug!(
            "Persisted {} singleton records, {} singleton objects",
            records.len(),
            objects.len()
        );
        Ok((records, objects))
    }

    fn prepare(key: &str, instance: &Arc<dyn LayeredSingleton>, next_id: &mut i32) -> LayerResult<PersistInfo> {
        let mut writer = KeyValueWriter::new();
        let flag = instance.prepare_persist(&mut writer)?;
        let initial_layer_only = instance.installation() == Installation::InitialLayerOnly;

        if initial_layer_only && flag != PersistFlag::Forbidden {
            return Err(LayerError::ProtocolViolation {
                key: key.to_string(),
                reason: format!("initial-layer-only singleton must persist as FORBIDDEN, got {}", flag),
            });
        }

        if flag != PersistFlag::Create {
            return Ok(PersistInfo {
                flag,
                id: NO_OBJECT,
                initial_layer_only,
                class_name: key.to_string(),
                recreate_name: String::new(),
                store: KeyValueStore::new(),
            });
        }

        let recreate_name = instance
            .recreate_name()
            .ok_or_else(|| LayerError::MissingRecreateEntry { name: key.to_string() })?;
        let id = *next_id;
        *next_id += 1;
        Ok(PersistInfo {
            flag,
            id,
            initial_layer_only,
            class_name: key.to_string(),
            recreate_name: recreate_name.to_string(),
            store: writer.finish(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::layer::LayerDescriptor;
    use crate::persist::loader::ForbiddenEntry;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    fn records_by_type(records: &[SingletonRecord]) -> BTreeMap<&str, &SingletonRecord> {
        records.iter().map(|r| (r.type_name.as_str(), r)).collect()
    }

    struct ModuleTable {
        modules: Mutex<Vec<String>>,
    }

    impl LayeredSingleton for ModuleTable {
        fn prepare_persist(&self, writer: &mut KeyValueWriter) -> LayerResult<PersistFlag> {
            writer.write_string_list("modules", &self.modules.lock())?;
            Ok(PersistFlag::Create)
        }

        fn recreate_name(&self) -> Option<&'static str> {
            Some("ModuleTable")
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    impl SingletonType for ModuleTable {
        const TYPE_NAME: &'static str = "ModuleTable";
    }

    struct BootInfo;

    impl LayeredSingleton for BootInfo {
        fn prepare_persist(&self, _writer: &mut KeyValueWriter) -> LayerResult<PersistFlag> {
            Ok(PersistFlag::Forbidden)
        }

        fn installation(&self) -> Installation {
            Installation::InitialLayerOnly
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    impl SingletonType for BootInfo {
        const TYPE_NAME: &'static str = "BootInfo";
    }

    struct Scratch;

    impl LayeredSingleton for Scratch {
        fn prepare_persist(&self, writer: &mut KeyValueWriter) -> LayerResult<PersistFlag> {
            writer.write_int("ignored", 1)?;
            Ok(PersistFlag::Nothing)
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn module_table(names: &[&str]) -> Arc<ModuleTable> {
        Arc::new(ModuleTable {
            modules: Mutex::new(names.iter().map(|s| s.to_string()).collect()),
        })
    }

    #[test]
    fn test_install_and_lookup() {
        let store = SingletonStore::new();
        store.install(module_table(&["base"])).unwrap();

        assert!(store.exists::<ModuleTable>());
        let table = store.lookup::<ModuleTable>().unwrap();
        assert_eq!(table.modules.lock().as_slice(), ["base"]);

        assert!(matches!(
            store.lookup::<BootInfo>(),
            Err(LayerError::SingletonNotFound { .. })
        ));
    }

    #[test]
    fn test_one_instance_per_type() {
        let store = SingletonStore::new();
        store.install(module_table(&[])).unwrap();
        let err = store.install(module_table(&[])).unwrap_err();
        assert!(matches!(err, LayerError::DuplicateSingleton { .. }));
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let store = SingletonStore::new();
        store.install_as(ModuleTable::TYPE_NAME, Arc::new(Scratch)).unwrap();
        assert!(matches!(
            store.lookup::<ModuleTable>(),
            Err(LayerError::SingletonTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_persist_shares_one_object_between_roles() {
        let store = SingletonStore::new();
        let table = module_table(&["a", "b"]);
        store.install(table.clone()).unwrap();
        store.install_as("ModuleLookup", table).unwrap();
        store.install_as("Scratch", Arc::new(Scratch)).unwrap();

        let (records, objects) = store.persist(|_| false).unwrap();
        let by_type = records_by_type(&records);

        assert_eq!(records.len(), 3);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].id, 1);
        assert_eq!(objects[0].recreate_name, "ModuleTable");
        assert_eq!(
            objects[0].store.reader().read_string_list("modules").unwrap(),
            &["a", "b"]
        );
        assert_eq!(by_type["ModuleTable"].object_id, 1);
        assert_eq!(by_type["ModuleLookup"].object_id, 1);
        assert_eq!(by_type["Scratch"].flag, PersistFlag::Nothing);
        assert_eq!(by_type["Scratch"].object_id, NO_OBJECT);
    }

    #[test]
    fn test_initial_layer_only_escape_path() {
        let store = SingletonStore::new();
        store.install(Arc::new(BootInfo)).unwrap();

        let (records, objects) = store.persist(|key| key == "BootInfo").unwrap();
        assert!(objects.is_empty());
        assert_eq!(records[0].flag, PersistFlag::Forbidden);
        assert!(records[0].initial_layer_only);
        assert_eq!(records[0].constant_key.as_deref(), Some("BootInfo"));
    }

    struct Policy;

    impl LayeredSingleton for Policy {
        fn prepare_persist(&self, _writer: &mut KeyValueWriter) -> LayerResult<PersistFlag> {
            Ok(PersistFlag::Forbidden)
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    impl SingletonType for Policy {
        const TYPE_NAME: &'static str = "Policy";
    }

    #[test]
    fn test_independent_forbidden_gets_no_constant_key() {
        let store = SingletonStore::new();
        store.install(Arc::new(Policy)).unwrap();

        let (records, _) = store.persist(|_| true).unwrap();
        assert_eq!(records[0].flag, PersistFlag::Forbidden);
        assert!(!records[0].initial_layer_only);
        assert_eq!(records[0].constant_key, None);
    }

    #[test]
    fn test_escape_path_needs_a_settled_value() {
        let registry = ConstantRegistry::new(LayerDescriptor::initial("libbase"));
        registry.register_future("BootInfo", "BootInfo").unwrap();

        let store = SingletonStore::new();
        store.install(Arc::new(BootInfo)).unwrap();
        let (records, _) = store.persist(|key| registry.has_value(key)).unwrap();
        assert!(records[0].initial_layer_only);
        assert_eq!(records[0].constant_key, None);
    }

    #[test]
    fn test_loaded_escape_key_limited_to_initial_layer_only() {
        let registry = ConstantRegistry::new(LayerDescriptor::initial("libbase"));
        let store = SingletonStore::new();
        store
            .install_loaded(LoadedSingletons {
                instances: Vec::new(),
                forbidden: vec![
                    ForbiddenEntry {
                        type_name: "BootInfo".into(),
                        initial_layer_only: true,
                        constant_key: Some("BootInfo".into()),
                    },
                    ForbiddenEntry {
                        type_name: "Policy".into(),
                        initial_layer_only: false,
                        constant_key: Some("Policy".into()),
                    },
                ],
            })
            .unwrap();

        assert!(matches!(
            store.initial_layer_constant("Policy", &registry),
            Err(LayerError::ForbiddenSingleton { .. })
        ));
        // The key is followed, the registry simply has no binding for it.
        assert!(matches!(
            store.initial_layer_constant("BootInfo", &registry),
            Err(LayerError::UnknownKey { .. })
        ));

        let (records, _) = store.persist(|_| true).unwrap();
        let by_type = records_by_type(&records);
        assert_eq!(by_type["BootInfo"].constant_key.as_deref(), Some("BootInfo"));
        assert_eq!(by_type["Policy"].constant_key, None);
    }

    #[test]
    fn test_initial_layer_only_must_be_forbidden() {
        struct Leaky;
        impl LayeredSingleton for Leaky {
            fn prepare_persist(&self, _w: &mut KeyValueWriter) -> LayerResult<PersistFlag> {
                Ok(PersistFlag::Create)
            }
            fn recreate_name(&self) -> Option<&'static str> {
                Some("Leaky")
            }
            fn installation(&self) -> Installation {
                Installation::InitialLayerOnly
            }
            fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
                self
            }
        }

        let store = SingletonStore::new();
        store.install_as("Leaky", Arc::new(Leaky)).unwrap();
        assert!(matches!(
            store.persist(|_| false),
            Err(LayerError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_create_requires_recreate_name() {
        struct Nameless;
        impl LayeredSingleton for Nameless {
            fn prepare_persist(&self, _w: &mut KeyValueWriter) -> LayerResult<PersistFlag> {
                Ok(PersistFlag::Create)
            }
            fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
                self
            }
        }

        let store = SingletonStore::new();
        store.install_as("Nameless", Arc::new(Nameless)).unwrap();
        assert!(matches!(
            store.persist(|_| false),
            Err(LayerError::MissingRecreateEntry { .. })
        ));
    }

    #[test]
    fn test_install_after_persist_fails() {
        let store = SingletonStore::new();
        store.persist(|_| false).unwrap();
        let err = store.install(module_table(&[])).unwrap_err();
        assert!(matches!(err, LayerError::LateRegistration { .. }));
        assert!(store.persist(|_| false).is_err());
    }
}
