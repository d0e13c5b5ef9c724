// This module implements the symbol tracker. Generated code of the current layer may
// call or address symbols that an earlier layer compiled. The tracker knows every symbol
// defined by the layers below (from the prior snapshot), records which of them the
// current layer actually references, and at artifact emission declares each referenced
// symbol as undefined in the layer's object file so the platform linker resolves it when
// layers are combined. Emission seals the tracker; any reference recorded afterwards
// would be missing from the artifact and therefore fails. The tracker also collects the
// symbols this layer defines so the next layer can reference them in turn.

//! Cross-layer symbol references.

use std::collections::BTreeSet;

use hashbrown::{HashMap, HashSet};
use object::write::{Object, Symbol, SymbolSection};
use object::{SymbolFlags, SymbolKind, SymbolScope};
use parking_lot::{Mutex, RwLock};

use crate::archive::snapshot::DefinedSymbol;
use crate::core::error::{LayerError, LayerResult};
use crate::core::layer::LayerId;

/// Tracks references to symbols defined by earlier layers.
pub struct SymbolTracker {
    layer: LayerId,
    prior: HashMap<String, LayerId>,
    referenced: Mutex<HashSet<String>>,
    defined: Mutex<BTreeSet<String>>,
    sealed: RwLock<bool>,
}

impl SymbolTracker {
    /// Tracker for `layer`, given every symbol defined by earlier layers.
    pub fn new(layer: LayerId, prior: &[DefinedSymbol]) -> Self {
        let prior = prior
            .iter()
            .filter(|symbol| symbol.layer < layer)
            .map(|symbol| (symbol.name.clone(), symbol.layer))
            .collect();
        Self {
            layer,
            prior,
            referenced: Mutex::new(HashSet::new()),
            defined: Mutex::new(BTreeSet::new()),
            sealed: RwLock::new(false),
        }
    }

    /// Layer that defined `symbol`, if an earlier one did.
    pub fn defining_layer(&self, symbol: &str) -> Option<LayerId> {
        self.prior.get(symbol).copied()
    }

    /// Record that this layer's code references `symbol`.
    pub fn register_reference(&self, symbol: &str) -> LayerResult<()> {
        let sealed = self.sealed.read();
        if *sealed {
            return Err(LayerError::late("symbol tracker", symbol));
        }
        if !self.prior.contains_key(symbol) {
            return Err(LayerError::UnknownSymbol {
                symbol: symbol.to_string(),
            });
        }
        if self.referenced.lock().insert(symbol.to_string()) {
            log::trace!("{} references {}", self.layer, symbol);
        }
        Ok(())
    }

    /// Record a symbol this layer defines, for later layers to reference.
    pub fn record_definition(&self, symbol: &str) -> LayerResult<()> {
        let sealed = self.sealed.read();
        if *sealed {
            return Err(LayerError::late("symbol tracker", symbol));
        }
        if let Some(layer) = self.prior.get(symbol) {
            return Err(LayerError::DuplicateKey {
                key: format!("{} (defined by {})", symbol, layer),
            });
        }
        self.defined.lock().insert(symbol.to_string());
        Ok(())
    }

    pub fn reference_count(&self) -> usize {
        self.referenced.lock().len()
    }

    /// Referenced symbols in name order.
    pub fn references(&self) -> Vec<String> {
        let mut names: Vec<String> = self.referenced.lock().iter().cloned().collect();
        names.sort();
        names
    }

    pub fn is_sealed(&self) -> bool {
        *self.sealed.read()
    }

    /// Seal the tracker and declare every referenced symbol as undefined in
    /// `obj`. Returns the number of symbols declared.
    pub fn define_symbols(&self, obj: &mut Object<'_>) -> LayerResult<usize> {
        let mut sealed = self.sealed.write();
        if *sealed {
            return Err(LayerError::late("symbol tracker", "define_symbols"));
        }
        *sealed = true;

        let names = self.references();
        for name in &names {
            obj.add_symbol(Symbol {
                name: name.as_bytes().to_vec(),
                value: 0,
                size: 0,
                kind: SymbolKind::Unknown,
                scope: SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Undefined,
                flags: SymbolFlags::None,
            });
        }
        log::debug!("{} declares {} undefined symbols", self.layer, names.len());
        Ok(names.len())
    }

    /// Symbols defined by this layer and every earlier one, for the next
    /// layer's snapshot.
    pub fn export(&self) -> Vec<DefinedSymbol> {
        let mut symbols: Vec<DefinedSymbol> = self
            .prior
            .iter()
            .map(|(name, layer)| DefinedSymbol {
                name: name.clone(),
                layer: *layer,
            })
            .chain(self.defined.lock().iter().map(|name| DefinedSymbol {
                name: name.clone(),
                layer: self.layer,
            }))
            .collect();
        symbols.sort_by(|a, b| a.name.cmp(&b.name));
        symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{Architecture, BinaryFormat, Endianness, Object as _, ObjectSymbol};

    fn tracker() -> SymbolTracker {
        SymbolTracker::new(
            LayerId(1),
            &[
                DefinedSymbol {
                    name: "base_init".into(),
                    layer: LayerId(0),
                },
                DefinedSymbol {
                    name: "base_alloc".into(),
                    layer: LayerId(0),
                },
            ],
        )
    }

    #[test]
    fn test_unknown_symbol_rejected() {
        let t = tracker();
        assert!(matches!(
            t.register_reference("not_there"),
            Err(LayerError::UnknownSymbol { .. })
        ));
        assert_eq!(t.defining_layer("base_init"), Some(LayerId(0)));
    }

    #[test]
    fn test_define_symbols_emits_undefined() {
        let t = tracker();
        t.register_reference("base_init").unwrap();
        t.register_reference("base_alloc").unwrap();
        t.register_reference("base_init").unwrap();

        let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        assert_eq!(t.define_symbols(&mut obj).unwrap(), 2);

        let bytes = obj.write().unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        let undefined: Vec<_> = file
            .symbols()
            .filter(|s| s.is_undefined())
            .map(|s| s.name().unwrap().to_string())
            .collect();
        assert_eq!(undefined, vec!["base_alloc", "base_init"]);
    }

    #[test]
    fn test_sealed_after_emission() {
        let t = tracker();
        let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        t.define_symbols(&mut obj).unwrap();

        assert!(t.is_sealed());
        assert!(matches!(
            t.register_reference("base_init"),
            Err(LayerError::LateRegistration { .. })
        ));
        assert!(t.define_symbols(&mut obj).is_err());
    }

    #[test]
    fn test_export_accumulates_definitions() {
        let t = tracker();
        t.record_definition("app_main").unwrap();
        assert!(t.record_definition("base_init").is_err());

        let names: Vec<_> = t.export().into_iter().map(|s| (s.name, s.layer.0)).collect();
        assert_eq!(
            names,
            vec![
                ("app_main".to_string(), 1),
                ("base_alloc".to_string(), 0),
                ("base_init".to_string(), 0),
            ]
        );
    }
}
