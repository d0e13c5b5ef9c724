use std::any::Any;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use layered_image::archive::snapshot::{ConstantState, NO_OBJECT};
use layered_image::archive::{LayerArchive, LayerArchiveWriter};
use layered_image::constants::ConstantEntry;
use layered_image::core::{BuildConfig, BuildSession, LayerError, LayerResult, LayerRole};
use layered_image::heap::{HeapConstant, HeapObject, ImageHeap};
use layered_image::persist::{
    Installation, KeyValueReader, KeyValueWriter, LayeredSingleton, PersistFlag, Recreate, RecreateTable,
    SingletonType,
};
use object::write::Object as WriteObject;
use object::{Architecture, BinaryFormat, Endianness, Object, ObjectSymbol};
use parking_lot::Mutex;
use tempfile::TempDir;

const PLATFORM: &str = "linux-x86_64";

fn config() -> BuildConfig {
    BuildConfig {
        platform: PLATFORM.into(),
        ..BuildConfig::default()
    }
}

fn string_constant(type_name: &str, value: &str) -> HeapConstant {
    let mut w = KeyValueWriter::new();
    w.write_string("value", value).unwrap();
    HeapConstant::new(HeapObject::new(type_name, w.finish()))
}

fn new_object() -> WriteObject<'static> {
    WriteObject::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little)
}

fn artifact(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(format!("{}.so", name));
    fs::write(&path, b"\x7fELF layer").unwrap();
    path
}

/// Module table carried forward into every later layer.
struct ModuleTable {
    modules: Mutex<Vec<String>>,
}

impl LayeredSingleton for ModuleTable {
    fn prepare_persist(&self, writer: &mut KeyValueWriter) -> LayerResult<PersistFlag> {
        writer.write_string_list("modules", &self.modules.lock())?;
        Ok(PersistFlag::Create)
    }

    fn recreate_name(&self) -> Option<&'static str> {
        Some(Self::TYPE_NAME)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl SingletonType for ModuleTable {
    const TYPE_NAME: &'static str = "ModuleTable";
}

impl Recreate for ModuleTable {
    fn create_from_loader(reader: &KeyValueReader<'_>) -> LayerResult<Self> {
        Ok(Self {
            modules: Mutex::new(reader.read_string_list("modules")?.to_vec()),
        })
    }
}

/// Host information only the initial layer may hold.
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

fn recreate_table() -> RecreateTable {
    let mut table = RecreateTable::new();
    table.register_type::<ModuleTable>().unwrap();
    table
}

/// Drive `session` from analysis through snapshot and return the snapshot
/// together with the emitted object bytes.
fn finish_layer(session: &BuildSession, heap: &ImageHeap) -> (layered_image::LayerSnapshot, Vec<u8>) {
    session.begin_analysis().unwrap();
    session.finish_analysis().unwrap();
    session.finish_heap_layout(heap).unwrap();
    let mut obj = new_object();
    session.emit_symbols(&mut obj).unwrap();
    let snapshot = session.snapshot().unwrap();
    (snapshot, obj.write().unwrap())
}

/// Build the initial layer `libbase` into `dir`:
/// - committed constant `X` and future `Y: T`
/// - defined symbol `base_entry`
/// - CREATE singleton `ModuleTable`, initial-layer-only `BootInfo` exposed as constant
fn build_base(dir: &Path) -> (PathBuf, HeapConstant) {
    let session = BuildSession::initial("libbase", config()).unwrap();
    let x = string_constant("java.lang.String", "hello from base");
    let boot = string_constant("BootInfo", "x86_64 host");

    session.constants().register_committed("X", x.clone()).unwrap();
    session.constants().register_committed("BootInfo", boot.clone()).unwrap();
    let placeholder = session.constants().register_future("Y", "T").unwrap();
    assert_eq!(placeholder.symbol, "__layer_future_Y");
    session.relocatable().register_loadable(&x).unwrap();
    session.symbols().record_definition("base_entry").unwrap();

    session
        .singletons()
        .install(Arc::new(ModuleTable {
            modules: Mutex::new(vec!["java.base".into()]),
        }))
        .unwrap();
    session.singletons().install(Arc::new(BootInfo)).unwrap();

    let mut heap = ImageHeap::new(16);
    heap.materialize(&x);
    heap.materialize(&boot);

    let (snapshot, _) = finish_layer(&session, &heap);
    let writer = LayerArchiveWriter::new(dir, PLATFORM).arguments(["--layer-create=libbase.nil"]);
    let path = session
        .write_archive(&writer, &snapshot, &artifact(dir, "libbase"))
        .unwrap();
    (path, x)
}

#[test]
fn committed_constant_crosses_layers() {
    let dir = TempDir::new().unwrap();
    let (base_path, x) = build_base(dir.path());

    let base = LayerArchive::open(&base_path, &config()).unwrap();
    let session = BuildSession::on_top_of(&base, LayerRole::Shared, "libmid", config(), &recreate_table()).unwrap();
    assert_eq!(session.layer().id.0, 1);

    let loaded = session.constants().get_constant("X").unwrap();
    assert_eq!(loaded.object(), x.object());

    let err = session
        .constants()
        .register_committed("X", string_constant("java.lang.String", "shadow"))
        .unwrap_err();
    assert!(matches!(err, LayerError::DuplicateKey { .. }));
    assert!(session.constants().constant_exists("X"));
}

#[test]
fn future_stays_unknown_until_finalized() {
    let dir = TempDir::new().unwrap();
    let (base_path, _) = build_base(dir.path());
    let base = LayerArchive::open(&base_path, &config()).unwrap();
    assert!(base
        .snapshot()
        .constants
        .iter()
        .any(|record| record.key == "Y" && matches!(record.state, ConstantState::FuturePending { .. })));

    // A shared layer passes the future on untouched.
    let mid = BuildSession::on_top_of(&base, LayerRole::Shared, "libmid", config(), &recreate_table()).unwrap();
    let err = mid.constants().get_constant("Y").unwrap_err();
    assert!(matches!(err, LayerError::UnknownKey { ref key } if key == "Y"));
    assert!(mid.constants().pending_future("Y").is_some());

    let (snapshot, _) = finish_layer(&mid, &ImageHeap::new(16));
    let mid_path = mid
        .write_archive(&LayerArchiveWriter::new(dir.path(), PLATFORM), &snapshot, &artifact(dir.path(), "libmid"))
        .unwrap();
    let mid_archive = LayerArchive::open(&mid_path, &config()).unwrap();

    // An application layer that never finalizes cannot seal.
    let app = BuildSession::on_top_of(&mid_archive, LayerRole::Application, "app", config(), &recreate_table()).unwrap();
    app.begin_analysis().unwrap();
    app.finish_analysis().unwrap();
    let err = app.finish_heap_layout(&ImageHeap::new(16)).unwrap_err();
    assert!(matches!(err, LayerError::UnresolvedFuture { ref keys } if keys == &["Y".to_string()]));

    // One that finalizes it can, but the value is still not an earlier layer's.
    let app = BuildSession::on_top_of(&mid_archive, LayerRole::Application, "app", config(), &recreate_table()).unwrap();
    let y = string_constant("T", "late value");
    app.constants().finalize_future("Y", y.clone()).unwrap();
    assert!(app.constants().get_constant("Y").is_err());

    let mut heap = ImageHeap::new(16);
    heap.materialize(&y);
    app.begin_analysis().unwrap();
    app.finish_analysis().unwrap();
    let summary = app.finish_heap_layout(&heap).unwrap();
    assert_eq!(summary.finalized, 1);
    assert!(app.constants().pending_future("Y").is_none());
}

#[test]
fn concurrent_candidates_converge() {
    let session = BuildSession::initial("libbase", config()).unwrap();
    let z = string_constant("java.lang.String", "shared");

    thread::scope(|scope| {
        for _ in 0..8 {
            let session = &session;
            let z = z.clone();
            scope.spawn(move || {
                session.constants().register_candidate("Z", z.clone()).unwrap();
                session.relocatable().register_loadable(&z).unwrap();
            });
        }
    });

    assert_eq!(session.constants().len(), 1);
    assert_eq!(session.relocatable().len(), 1);
    match session.constants().entry("Z") {
        Some(ConstantEntry::Candidate(value)) => assert_eq!(value, z),
        other => panic!("unexpected entry {:?}", other),
    }
}

#[test]
fn undefined_symbols_are_emitted() {
    let dir = TempDir::new().unwrap();
    let (base_path, _) = build_base(dir.path());
    let base = LayerArchive::open(&base_path, &config()).unwrap();
    let session = BuildSession::on_top_of(&base, LayerRole::Shared, "libmid", config(), &recreate_table()).unwrap();

    session.symbols().register_reference("base_entry").unwrap();
    session.symbols().register_reference("base_entry").unwrap();
    let err = session.symbols().register_reference("nowhere").unwrap_err();
    assert!(matches!(err, LayerError::UnknownSymbol { .. }));

    let x = session.constants().get_constant("X").unwrap();
    let slot = session.relocatable().register_loadable(&x).unwrap();
    assert_eq!(slot, 0);

    let (snapshot, bytes) = finish_layer(&session, &ImageHeap::new(16));
    let file = object::File::parse(&*bytes).unwrap();
    let entry = file.symbol_by_name("base_entry").unwrap();
    assert!(entry.is_undefined());
    let table = file.symbol_by_name("__layer1_constant_table").unwrap();
    assert!(!table.is_undefined());
    assert!(table.is_global());

    assert!(snapshot.symbols.iter().any(|s| s.name == "base_entry" && s.layer.0 == 0));
    assert_eq!(session.stats().symbol_references, 1);
}

#[test]
fn singletons_recreated_and_forbidden() {
    let dir = TempDir::new().unwrap();
    let (base_path, _) = build_base(dir.path());
    let base = LayerArchive::open(&base_path, &config()).unwrap();

    let boot = base
        .snapshot()
        .singletons
        .iter()
        .find(|record| record.type_name == "BootInfo")
        .unwrap();
    assert_eq!(boot.flag, PersistFlag::Forbidden);
    assert_eq!(boot.object_id, NO_OBJECT);
    assert_eq!(boot.constant_key.as_deref(), Some("BootInfo"));

    let session = BuildSession::on_top_of(&base, LayerRole::Shared, "libmid", config(), &recreate_table()).unwrap();
    let modules = session.singletons().lookup::<ModuleTable>().unwrap();
    assert_eq!(*modules.modules.lock(), vec!["java.base".to_string()]);
    modules.modules.lock().push("java.sql".into());

    let err = session.singletons().lookup::<BootInfo>().err().unwrap();
    assert!(matches!(err, LayerError::ForbiddenSingleton { .. }));
    assert!(!session.singletons().exists::<BootInfo>());
    assert!(session.singletons().install(Arc::new(BootInfo)).is_err());

    let boot = session
        .singletons()
        .initial_layer_constant("BootInfo", session.constants())
        .unwrap();
    assert_eq!(boot.type_name(), "BootInfo");
    assert_eq!(session.stats().singletons_loaded, 1);

    // The prohibition and the updated state both carry into the next layer.
    let (snapshot, _) = finish_layer(&session, &ImageHeap::new(16));
    let mid_path = session
        .write_archive(&LayerArchiveWriter::new(dir.path(), PLATFORM), &snapshot, &artifact(dir.path(), "libmid"))
        .unwrap();
    let mid = LayerArchive::open(&mid_path, &config()).unwrap();
    let app = BuildSession::on_top_of(&mid, LayerRole::Application, "app", config(), &recreate_table()).unwrap();
    assert!(app.singletons().is_forbidden("BootInfo"));
    let modules = app.singletons().lookup::<ModuleTable>().unwrap();
    assert_eq!(modules.modules.lock().len(), 2);
}

#[test]
fn missing_recreate_entry_aborts_load() {
    let dir = TempDir::new().unwrap();
    let (base_path, _) = build_base(dir.path());
    let base = LayerArchive::open(&base_path, &config()).unwrap();

    let err = BuildSession::on_top_of(&base, LayerRole::Shared, "libmid", config(), &RecreateTable::new())
        .err()
        .unwrap();
    assert!(matches!(err, LayerError::MissingRecreateEntry { ref name } if name == "ModuleTable"));
}

#[test]
fn loaded_archive_is_never_overwritten() {
    let dir = TempDir::new().unwrap();
    let (base_path, _) = build_base(dir.path());
    let before = fs::read(&base_path).unwrap();

    let session = BuildSession::open(&base_path, LayerRole::Shared, "libbase", config(), &recreate_table()).unwrap();
    let (snapshot, _) = finish_layer(&session, &ImageHeap::new(16));
    let err = session
        .write_archive(
            &LayerArchiveWriter::new(dir.path(), PLATFORM),
            &snapshot,
            &artifact(dir.path(), "libbase2"),
        )
        .unwrap_err();
    assert!(matches!(err, LayerError::NotWritable { .. }));
    assert!(err.is_user_facing());
    assert_eq!(fs::read(&base_path).unwrap(), before);
}

#[test]
fn application_layer_writes_no_archive() {
    let dir = TempDir::new().unwrap();
    let (base_path, _) = build_base(dir.path());

    let app = BuildSession::open(&base_path, LayerRole::Application, "app", config(), &recreate_table()).unwrap();
    let (snapshot, _) = finish_layer_with_future(&app);
    let err = app
        .write_archive(&LayerArchiveWriter::new(dir.path(), PLATFORM), &snapshot, &artifact(dir.path(), "app"))
        .unwrap_err();
    assert!(matches!(err, LayerError::InvalidLayerName { .. }));
    assert!(!dir.path().join("app.nil").exists());
}

fn finish_layer_with_future(app: &BuildSession) -> (layered_image::LayerSnapshot, Vec<u8>) {
    let y = string_constant("T", "app value");
    app.constants().finalize_future("Y", y.clone()).unwrap();
    let mut heap = ImageHeap::new(16);
    heap.materialize(&y);
    finish_layer(app, &heap)
}
