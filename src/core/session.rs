// This module provides the build session, the explicit build context that owns one
// instance of every layer registry for the lifetime of a single layer's build. A session
// is created either for the initial layer or on top of a prior layer's archive, in which
// case it inherits the prior constant bindings, defined symbols and compilation
// behaviors and recreates the persisted singletons through the caller's recreate table.
// The session walks the build milestones in a fixed order: behaviors seal when analysis
// begins, the relocatable constant table seals when analysis finishes, the constant
// registry seals against the final heap layout, the symbol tracker seals when the
// artifact's symbols are emitted, and finally the singleton store persists while the
// snapshot for the next layer is assembled. SessionStats summarizes what the layer
// registered and inherited.

//! Build session for one layer.
//!
//! The session replaces any process-global locator: analysis and code
//! generation reach every registry through the session they were handed.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use object::write::Object;
use parking_lot::Mutex;

use super::config::BuildConfig;
use super::error::{LayerError, LayerResult};
use super::layer::{LayerDescriptor, LayerRole};
use crate::archive::reader::LayerArchive;
use crate::archive::snapshot::LayerSnapshot;
use crate::archive::validate_layer_name;
use crate::archive::writer::LayerArchiveWriter;
use crate::behavior::BehaviorRegistry;
use crate::constants::registry::{ConstantRegistry, SealSummary};
use crate::constants::relocatable::RelocatableConstantTable;
use crate::heap::HeapLayout;
use crate::persist::loader::{load_image_singletons, RecreateTable};
use crate::persist::singleton::SingletonStore;
use crate::symbols::SymbolTracker;

/// Build milestones, in the order a session passes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Milestone {
    Registration,
    Analysis,
    Analyzed,
    HeapLaidOut,
    Emitted,
    Snapshotted,
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Milestone::Registration => "registration",
            Milestone::Analysis => "analysis",
            Milestone::Analyzed => "analysis finished",
            Milestone::HeapLaidOut => "heap laid out",
            Milestone::Emitted => "symbols emitted",
            Milestone::Snapshotted => "snapshot taken",
        })
    }
}

/// Registries of one layer build.
pub struct BuildSession {
    config: BuildConfig,
    layer: LayerDescriptor,
    prior_archive: Option<PathBuf>,
    constants: ConstantRegistry,
    relocatable: RelocatableConstantTable,
    symbols: SymbolTracker,
    singletons: SingletonStore,
    behaviors: BehaviorRegistry,
    milestone: Mutex<Milestone>,
    singletons_loaded: usize,
}

impl BuildSession {
    /// Session for the initial layer `name`.
    pub fn initial(name: &str, config: BuildConfig) -> LayerResult<Self> {
        validate_layer_name(name, LayerRole::Initial)?;
        let layer = LayerDescriptor::initial(name);
        log::debug!("Starting initial layer '{}'", name);
        Ok(Self {
            constants: ConstantRegistry::new(layer.clone()),
            relocatable: RelocatableConstantTable::new(layer.id, config.reference_compression),
            symbols: SymbolTracker::new(layer.id, &[]),
            singletons: SingletonStore::new(),
            behaviors: BehaviorRegistry::new(),
            milestone: Mutex::new(Milestone::Registration),
            singletons_loaded: 0,
            prior_archive: None,
            layer,
            config,
        })
    }

    /// Session for layer `name` built on top of `prior`.
    pub fn on_top_of(
        prior: &LayerArchive,
        role: LayerRole,
        name: &str,
        config: BuildConfig,
        recreate: &RecreateTable,
    ) -> LayerResult<Self> {
        let mut session = Self::from_snapshot(prior.snapshot(), role, name, config, recreate)?;
        session.prior_archive = Some(prior.path().to_path_buf());
        Ok(session)
    }

    /// Open the archive at `path` and build layer `name` on top of it.
    pub fn open(
        path: impl AsRef<Path>,
        role: LayerRole,
        name: &str,
        config: BuildConfig,
        recreate: &RecreateTable,
    ) -> LayerResult<Self> {
        let archive = LayerArchive::open(path, &config)?;
        Self::on_top_of(&archive, role, name, config, recreate)
    }

    /// Session for layer `name` inheriting the state recorded in `prior`.
    pub fn from_snapshot(
        prior: &LayerSnapshot,
        role: LayerRole,
        name: &str,
        config: BuildConfig,
        recreate: &RecreateTable,
    ) -> LayerResult<Self> {
        validate_layer_name(name, role)?;
        let layer = LayerDescriptor::on_top_of(&prior.layer, role, name)?;

        let loaded = load_image_singletons(prior, recreate)?;
        let singletons_loaded = loaded.instances.len();
        let singletons = SingletonStore::new();
        singletons.install_loaded(loaded)?;

        log::debug!(
            "Starting {} layer '{}' ({}) on top of '{}'",
            layer.role,
            layer.name,
            layer.id,
            prior.layer.name
        );
        Ok(Self {
            constants: ConstantRegistry::from_snapshot(layer.clone(), prior)?,
            relocatable: RelocatableConstantTable::new(layer.id, config.reference_compression),
            symbols: SymbolTracker::new(layer.id, &prior.symbols),
            behaviors: BehaviorRegistry::inherited(&prior.behaviors)?,
            singletons,
            milestone: Mutex::new(Milestone::Registration),
            singletons_loaded,
            prior_archive: None,
            layer,
            config,
        })
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn layer(&self) -> &LayerDescriptor {
        &self.layer
    }

    /// Archive this session was built on, if any.
    pub fn prior_archive(&self) -> Option<&Path> {
        self.prior_archive.as_deref()
    }

    pub fn constants(&self) -> &ConstantRegistry {
        &self.constants
    }

    pub fn relocatable(&self) -> &RelocatableConstantTable {
        &self.relocatable
    }

    pub fn symbols(&self) -> &SymbolTracker {
        &self.symbols
    }

    pub fn singletons(&self) -> &SingletonStore {
        &self.singletons
    }

    pub fn behaviors(&self) -> &BehaviorRegistry {
        &self.behaviors
    }

    pub fn milestone(&self) -> Milestone {
        *self.milestone.lock()
    }

    /// Run `step` if the session is at `from`, then move it to `to`.
    fn advance<T>(&self, from: Milestone, to: Milestone, step: impl FnOnce() -> LayerResult<T>) -> LayerResult<T> {
        let mut current = self.milestone.lock();
        if *current != from {
            return Err(LayerError::ProtocolViolation {
                key: "build session".into(),
                reason: format!("cannot reach '{}' while at '{}'", to, *current),
            });
        }
        let out = step()?;
        *current = to;
        log::debug!("{} reached milestone '{}'", self.layer.id, to);
        Ok(out)
    }

    /// Analysis begins: no more compilation behaviors may be declared.
    pub fn begin_analysis(&self) -> LayerResult<()> {
        self.advance(Milestone::Registration, Milestone::Analysis, || {
            self.behaviors.seal();
            Ok(())
        })
    }

    /// Analysis finished: seal the relocatable constant table. Returns the
    /// number of slots.
    pub fn finish_analysis(&self) -> LayerResult<usize> {
        self.advance(Milestone::Analysis, Milestone::Analyzed, || {
            Ok(self.relocatable.seal()?.len())
        })
    }

    /// Heap layout is final: settle constant registrations against it.
    pub fn finish_heap_layout(&self, heap: &dyn HeapLayout) -> LayerResult<SealSummary> {
        self.advance(Milestone::Analyzed, Milestone::HeapLaidOut, || self.constants.seal(heap))
    }

    /// Emit the constant table and the undefined cross-layer symbols into
    /// the layer's object file. Returns the number of undefined symbols.
    pub fn emit_symbols(&self, obj: &mut Object<'_>) -> LayerResult<usize> {
        self.advance(Milestone::HeapLaidOut, Milestone::Emitted, || {
            self.relocatable.define_table(obj)?;
            self.symbols.define_symbols(obj)
        })
    }

    /// Persist singletons and assemble the snapshot for the next layer.
    pub fn snapshot(&self) -> LayerResult<LayerSnapshot> {
        self.advance(Milestone::Emitted, Milestone::Snapshotted, || {
            let (singletons, singleton_objects) = self
                .singletons
                .persist(|type_name| self.constants.has_value(type_name))?;
            let (constants, heap_objects) = self.constants.export()?;
            Ok(LayerSnapshot {
                layer: self.layer.clone(),
                singletons,
                singleton_objects,
                heap_objects,
                constants,
                symbols: self.symbols.export(),
                behaviors: self.behaviors.export(),
            })
        })
    }

    /// Write the layer archive for `snapshot`. The archive this session was
    /// built on is never overwritten.
    pub fn write_archive(
        &self,
        writer: &LayerArchiveWriter,
        snapshot: &LayerSnapshot,
        artifact: &Path,
    ) -> LayerResult<PathBuf> {
        if self.milestone() != Milestone::Snapshotted {
            return Err(LayerError::ProtocolViolation {
                key: "build session".into(),
                reason: "archive written before the snapshot was taken".into(),
            });
        }
        if snapshot.layer != self.layer {
            return Err(LayerError::ProtocolViolation {
                key: "build session".into(),
                reason: format!("snapshot belongs to layer '{}'", snapshot.layer.name),
            });
        }

        let dest = writer.archive_path(&self.layer.name);
        if let Some(prior) = &self.prior_archive {
            let same = match (fs::canonicalize(prior), fs::canonicalize(&dest)) {
                (Ok(a), Ok(b)) => a == b,
                _ => *prior == dest,
            };
            if same {
                return Err(LayerError::NotWritable {
                    path: dest,
                    reason: "refusing to overwrite the archive this layer was built on".into(),
                });
            }
        }
        writer.write(snapshot, artifact)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            layer: self.layer.name.clone(),
            inherited_constants: self.constants.inherited_len(),
            constants_registered: self.constants.len(),
            loadable_slots: self.relocatable.len(),
            symbol_references: self.symbols.reference_count(),
            singletons_installed: self.singletons.len(),
            singletons_loaded: self.singletons_loaded,
            behaviors_declared: self.behaviors.len(),
        }
    }
}

/// Registration statistics of a build session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub layer: String,

    /// Constant bindings inherited from earlier layers.
    pub inherited_constants: usize,

    /// Constant keys registered by this layer.
    pub constants_registered: usize,

    /// Slots in the relocatable constant table.
    pub loadable_slots: usize,

    /// Distinct earlier-layer symbols referenced.
    pub symbol_references: usize,

    /// Singleton type names installed, forbidden ones included.
    pub singletons_installed: usize,

    /// Singleton instances recreated from the prior layer.
    pub singletons_loaded: usize,

    pub behaviors_declared: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Layer Session Statistics ({}):", self.layer)?;
        writeln!(f, "  Inherited constants: {}", self.inherited_constants)?;
        writeln!(f, "  Constants registered: {}", self.constants_registered)?;
        writeln!(f, "  Loadable slots: {}", self.loadable_slots)?;
        writeln!(f, "  Symbol references: {}", self.symbol_references)?;
        writeln!(f, "  Singletons installed: {}", self.singletons_installed)?;
        writeln!(f, "  Singletons loaded: {}", self.singletons_loaded)?;
        writeln!(f, "  Compilation behaviors: {}", self.behaviors_declared)?;
        Ok(())
    }
}
