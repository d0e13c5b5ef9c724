//! Relocatable constant table.
//!
//! Every heap constant referenced by generated code gets a slot in one dense
//! per-layer array. Code addresses a constant as `base + index * stride` and
//! loads one reference from there, so the linker only resolves a single
//! relocatable symbol per layer: the array base.
//!
//! Slots are assigned from an atomic counter while analysis runs. Sealing at
//! the end of analysis freezes the counter and materializes the array.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use object::write::{Object, Symbol, SymbolId, SymbolSection};
use object::{SectionKind, SymbolFlags, SymbolKind, SymbolScope};
use parking_lot::RwLock;

use crate::core::config::ReferenceCompression;
use crate::core::error::{LayerError, LayerResult};
use crate::core::layer::LayerId;
use crate::heap::HeapConstant;

/// Section holding the table in the layer's object file.
pub const TABLE_SECTION: &[u8] = b".rodata.layer_constants";

/// Link name of the table base for `layer`.
pub fn table_symbol(layer: LayerId) -> String {
    format!("__layer{}_constant_table", layer.0)
}

/// Addressing expression for one table slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadExpr {
    pub base_symbol: String,
    pub index: u32,
    /// Byte offset from the base: `index * stride`.
    pub offset: u64,
    pub stride: u32,
    pub compression: ReferenceCompression,
}

impl LoadExpr {
    /// Perform the load against a resolved table base, decompressing the
    /// stored reference the same way ordinary heap reads do.
    pub fn load(&self, table_base: u64, heap_base: u64, read: impl Fn(u64, u32) -> u64) -> u64 {
        let stored = read(table_base + self.offset, self.stride);
        self.compression.decompress(stored, heap_base)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Sealed,
}

/// Slot table for one layer.
pub struct RelocatableConstantTable {
    layer: LayerId,
    compression: ReferenceCompression,
    slots: DashMap<usize, (u32, HeapConstant)>,
    next_index: AtomicU32,
    phase: RwLock<Phase>,
    sealed: OnceLock<Vec<HeapConstant>>,
}

impl RelocatableConstantTable {
    pub fn new(layer: LayerId, compression: ReferenceCompression) -> Self {
        Self {
            layer,
            compression,
            slots: DashMap::new(),
            next_index: AtomicU32::new(0),
            phase: RwLock::new(Phase::Open),
            sealed: OnceLock::new(),
        }
    }

    pub fn base_symbol(&self) -> String {
        table_symbol(self.layer)
    }

    pub fn stride(&self) -> u32 {
        self.compression.reference_size()
    }

    /// Slot index of `constant`, assigning the next one if it is new.
    pub fn register_loadable(&self, constant: &HeapConstant) -> LayerResult<u32> {
        let phase = self.phase.read();
        if *phase == Phase::Sealed {
            return Err(LayerError::late("relocatable constant table", format!("{:?}", constant)));
        }

        match self.slots.entry(constant.identity()) {
            Entry::Occupied(slot) => Ok(slot.get().0),
            Entry::Vacant(slot) => {
                let index = self.next_index.fetch_add(1, Ordering::SeqCst);
                log::trace!("Slot {} assigned to {:?}", index, constant);
                slot.insert((index, constant.clone()));
                Ok(index)
            }
        }
    }

    pub fn slot_of(&self, constant: &HeapConstant) -> Option<u32> {
        self.slots.get(&constant.identity()).map(|slot| slot.0)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Freeze slot assignment and build the dense array.
    pub fn seal(&self) -> LayerResult<&[HeapConstant]> {
        let mut phase = self.phase.write();
        if *phase == Phase::Sealed {
            return Err(LayerError::ProtocolViolation {
                key: "relocatable constant table".into(),
                reason: "already sealed".into(),
            });
        }

        let len = self.next_index.load(Ordering::SeqCst);
        let mut array: Vec<Option<HeapConstant>> = vec![None; len as usize];
        for slot in self.slots.iter() {
            let (index, constant) = slot.value();
            match array.get_mut(*index as usize) {
                Some(cell) if cell.is_none() => *cell = Some(constant.clone()),
                _ => return Err(LayerError::SlotLeak { index: *index, len }),
            }
        }
        let array = array
            .into_iter()
            .enumerate()
            .map(|(index, cell)| cell.ok_or(LayerError::SlotLeak { index: index as u32, len }))
            .collect::<LayerResult<Vec<_>>>()?;

        *phase = Phase::Sealed;
        log::debug!("Relocatable constant table for {} sealed with {} slots", self.layer, len);
        Ok(self.sealed.get_or_init(|| array).as_slice())
    }

    /// The sealed array, if sealing already happened.
    pub fn table(&self) -> Option<&[HeapConstant]> {
        self.sealed.get().map(Vec::as_slice)
    }

    /// Addressing expression loading `constant` through the table.
    pub fn emit_load(&self, constant: &HeapConstant) -> LayerResult<LoadExpr> {
        let index = self.slot_of(constant).ok_or_else(|| LayerError::UnregisteredConstant {
            what: format!("{:?}", constant),
        })?;
        let stride = self.stride();
        Ok(LoadExpr {
            base_symbol: self.base_symbol(),
            index,
            offset: u64::from(index) * u64::from(stride),
            stride,
            compression: self.compression,
        })
    }

    /// Emit the table storage and its global base symbol into `obj`.
    pub fn define_table(&self, obj: &mut Object<'_>) -> LayerResult<SymbolId> {
        let table = self.table().ok_or_else(|| LayerError::ProtocolViolation {
            key: "relocatable constant table".into(),
            reason: "table defined before seal".into(),
        })?;

        let size = table.len() as u64 * u64::from(self.stride());
        let section = obj.add_section(Vec::new(), TABLE_SECTION.to_vec(), SectionKind::ReadOnlyData);
        let offset = obj.append_section_data(section, &vec![0u8; size as usize], u64::from(self.stride()));
        let symbol = obj.add_symbol(Symbol {
            name: self.base_symbol().into_bytes(),
            value: offset,
            size,
            kind: SymbolKind::Data,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Section(section),
            flags: SymbolFlags::None,
        });
        log::debug!("Defined {} ({} bytes)", self.base_symbol(), size);
        Ok(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapObject;
    use crate::persist::key_value::KeyValueStore;
    use object::{Architecture, BinaryFormat, Endianness, Object as _, ObjectSection, ObjectSymbol};
    use std::sync::Arc;
    use std::thread;

    fn constant(name: &str) -> HeapConstant {
        HeapConstant::new(HeapObject::new(name, KeyValueStore::new()))
    }

    fn table() -> RelocatableConstantTable {
        RelocatableConstantTable::new(LayerId(1), ReferenceCompression::uncompressed())
    }

    #[test]
    fn test_indices_are_dense_and_idempotent() {
        let t = table();
        let a = constant("A");
        let b = constant("B");
        assert_eq!(t.register_loadable(&a).unwrap(), 0);
        assert_eq!(t.register_loadable(&b).unwrap(), 1);
        assert_eq!(t.register_loadable(&a).unwrap(), 0);

        let sealed = t.seal().unwrap();
        assert_eq!(sealed.len(), 2);
        assert_eq!(sealed[0], a);
        assert_eq!(sealed[1], b);
    }

    #[test]
    fn test_register_after_seal_fails() {
        let t = table();
        t.seal().unwrap();
        let err = t.register_loadable(&constant("A")).unwrap_err();
        assert!(matches!(err, LayerError::LateRegistration { .. }));
        assert!(t.seal().is_err());
    }

    #[test]
    fn test_concurrent_registration_is_unique() {
        let t = Arc::new(table());
        let constants: Vec<_> = (0..64).map(|i| constant(&format!("C{}", i))).collect();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let t = t.clone();
                let constants = constants.clone();
                thread::spawn(move || {
                    for c in &constants {
                        t.register_loadable(c).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let sealed = t.seal().unwrap();
        assert_eq!(sealed.len(), constants.len());
        for c in &constants {
            let index = t.slot_of(c).unwrap() as usize;
            assert_eq!(sealed[index], *c);
        }
    }

    #[test]
    fn test_emit_load_applies_compression() {
        let t = RelocatableConstantTable::new(LayerId(2), ReferenceCompression::with_shift(3));
        let a = constant("A");
        let b = constant("B");
        t.register_loadable(&a).unwrap();
        t.register_loadable(&b).unwrap();

        let load = t.emit_load(&b).unwrap();
        assert_eq!(load.base_symbol, "__layer2_constant_table");
        assert_eq!(load.offset, 4);

        let heap_base = 0x4000_0000;
        let address = load.load(0x1000, heap_base, |addr, size| {
            assert_eq!((addr, size), (0x1004, 4));
            0x10
        });
        assert_eq!(address, heap_base + 0x80);

        assert!(matches!(
            t.emit_load(&constant("C")),
            Err(LayerError::UnregisteredConstant { .. })
        ));
    }

    #[test]
    fn test_define_table_symbol() {
        let t = table();
        t.register_loadable(&constant("A")).unwrap();
        t.register_loadable(&constant("B")).unwrap();

        let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        assert!(t.define_table(&mut obj).is_err());
        t.seal().unwrap();
        t.define_table(&mut obj).unwrap();

        let bytes = obj.write().unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        let symbol = file.symbol_by_name("__layer1_constant_table").unwrap();
        assert_eq!(symbol.size(), 16);
        assert!(symbol.is_global());
        let section = file.section_by_name(".rodata.layer_constants").unwrap();
        assert_eq!(section.size(), 16);
    }
}
