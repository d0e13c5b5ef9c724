// This module defines the snapshot payload that carries registry state from one layer's
// build process to the next, together with its binary codec. A snapshot holds the
// singleton records and their persisted key-value objects, the serialized heap objects
// referenced by the constant table, the constant records themselves, the symbols defined
// by every layer so far and the declared compilation behaviors. The encoding is
// little-endian: an 8-byte magic, a format version, a sequence of tagged length-prefixed
// segments and a trailing SHA-256 over all segment bytes. Decoding validates magic,
// version, segment framing and (optionally) the checksum, and reports any violation as
// a corrupt snapshot so the operator can rebuild the offending layer.

//! Snapshot payload and binary codec.

use sha2::{Digest, Sha256};

use crate::behavior::CompilationBehavior;
use crate::core::error::{LayerError, LayerResult};
use crate::core::layer::{LayerDescriptor, LayerId, LayerRole};
use crate::heap::HeapObject;
use crate::persist::key_value::{KeyValueStore, KvValue};
use crate::persist::singleton::PersistFlag;

/// Magic bytes at the start of every snapshot.
pub const SNAPSHOT_MAGIC: &[u8; 8] = b"LAYERSNP";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Object id recorded for singletons that carry no payload.
pub const NO_OBJECT: i32 = -1;

/// Per-type singleton record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingletonRecord {
    pub type_name: String,
    pub flag: PersistFlag,
    /// Id of the [`SingletonObjectRecord`] for CREATE records, else [`NO_OBJECT`].
    pub object_id: i32,
    pub initial_layer_only: bool,
    /// Constant registry key exposing the value of a forbidden singleton.
    pub constant_key: Option<String>,
}

/// Persisted state of one singleton instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingletonObjectRecord {
    pub id: i32,
    pub class_name: String,
    pub recreate_name: String,
    pub store: KeyValueStore,
}

/// Serialized heap object referenced by constant records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapObjectRecord {
    pub id: u32,
    pub object: HeapObject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstantState {
    Committed {
        object_id: u32,
        layer: LayerId,
    },
    FuturePending {
        declared_type: String,
        layer: LayerId,
    },
    FutureFinalized {
        declared_type: String,
        object_id: u32,
        finalized_in: LayerId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantRecord {
    pub key: String,
    pub state: ConstantState,
}

/// A symbol defined by some layer, referencable by later layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinedSymbol {
    pub name: String,
    pub layer: LayerId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BehaviorRecord {
    pub entity: String,
    pub behavior: CompilationBehavior,
}

/// Complete state handed from one layer to the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSnapshot {
    pub layer: LayerDescriptor,
    pub singletons: Vec<SingletonRecord>,
    pub singleton_objects: Vec<SingletonObjectRecord>,
    pub heap_objects: Vec<HeapObjectRecord>,
    pub constants: Vec<ConstantRecord>,
    pub symbols: Vec<DefinedSymbol>,
    pub behaviors: Vec<BehaviorRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum SegmentKind {
    Layer = 1,
    Singletons = 2,
    SingletonObjects = 3,
    HeapObjects = 4,
    Constants = 5,
    Symbols = 6,
    Behaviors = 7,
}

impl SegmentKind {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            1 => SegmentKind::Layer,
            2 => SegmentKind::Singletons,
            3 => SegmentKind::SingletonObjects,
            4 => SegmentKind::HeapObjects,
            5 => SegmentKind::Constants,
            6 => SegmentKind::Symbols,
            7 => SegmentKind::Behaviors,
            _ => return None,
        })
    }
}

impl LayerSnapshot {
    /// Empty snapshot for `layer`.
    pub fn empty(layer: LayerDescriptor) -> Self {
        Self {
            layer,
            singletons: Vec::new(),
            singleton_objects: Vec::new(),
            heap_objects: Vec::new(),
            constants: Vec::new(),
            symbols: Vec::new(),
            behaviors: Vec::new(),
        }
    }

    pub fn heap_object(&self, id: u32) -> Option<&HeapObject> {
        self.heap_objects
            .iter()
            .find(|record| record.id == id)
            .map(|record| &record.object)
    }

    pub fn singleton_object(&self, id: i32) -> Option<&SingletonObjectRecord> {
        self.singleton_objects.iter().find(|record| record.id == id)
    }

    /// Encode into the binary snapshot format.
    pub fn encode(&self) -> Vec<u8> {
        let mut segments = Encoder::default();

        segments.segment(SegmentKind::Layer, |e| {
            e.u32(self.layer.id.0);
            e.u8(self.layer.role.to_byte());
            e.str(&self.layer.name);
        });

        segments.segment(SegmentKind::Singletons, |e| {
            e.u32(self.singletons.len() as u32);
            for record in &self.singletons {
                e.str(&record.type_name);
                e.u8(record.flag.to_byte());
                e.i32(record.object_id);
                e.bool(record.initial_layer_only);
                e.opt_str(record.constant_key.as_deref());
            }
        });

        segments.segment(SegmentKind::SingletonObjects, |e| {
            e.u32(self.singleton_objects.len() as u32);
            for record in &self.singleton_objects {
                e.i32(record.id);
                e.str(&record.class_name);
                e.str(&record.recreate_name);
                e.store(&record.store);
            }
        });

        segments.segment(SegmentKind::HeapObjects, |e| {
            e.u32(self.heap_objects.len() as u32);
            for record in &self.heap_objects {
                e.u32(record.id);
                e.str(&record.object.type_name);
                e.store(&record.object.fields);
            }
        });

        segments.segment(SegmentKind::Constants, |e| {
            e.u32(self.constants.len() as u32);
            for record in &self.constants {
                e.str(&record.key);
                match &record.state {
                    ConstantState::Committed { object_id, layer } => {
                        e.u8(0);
                        e.u32(*object_id);
                        e.u32(layer.0);
                    }
                    ConstantState::FuturePending { declared_type, layer } => {
                        e.u8(1);
                        e.str(declared_type);
                        e.u32(layer.0);
                    }
                    ConstantState::FutureFinalized {
                        declared_type,
                        object_id,
                        finalized_in,
                    } => {
                        e.u8(2);
                        e.str(declared_type);
                        e.u32(*object_id);
                        e.u32(finalized_in.0);
                    }
                }
            }
        });

        segments.segment(SegmentKind::Symbols, |e| {
            e.u32(self.symbols.len() as u32);
            for symbol in &self.symbols {
                e.str(&symbol.name);
                e.u32(symbol.layer.0);
            }
        });

        segments.segment(SegmentKind::Behaviors, |e| {
            e.u32(self.behaviors.len() as u32);
            for record in &self.behaviors {
                e.str(&record.entity);
                e.u8(record.behavior.to_byte());
            }
        });

        let body = segments.buf;
        let mut out = Vec::with_capacity(body.len() + 48);
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&Sha256::digest(&body));
        out
    }

    /// Decode a snapshot, optionally verifying its checksum.
    pub fn decode(bytes: &[u8], verify_checksum: bool) -> LayerResult<Self> {
        const HEADER: usize = 12;
        const CHECKSUM: usize = 32;

        if bytes.len() < HEADER + CHECKSUM {
            return Err(LayerError::corrupt("snapshot is truncated"));
        }
        if &bytes[..8] != SNAPSHOT_MAGIC {
            return Err(LayerError::corrupt("bad magic"));
        }
        let version = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if version != SNAPSHOT_VERSION {
            return Err(LayerError::corrupt(format!(
                "unsupported format version {} (expected {})",
                version, SNAPSHOT_VERSION
            )));
        }

        let body = &bytes[HEADER..bytes.len() - CHECKSUM];
        let checksum = &bytes[bytes.len() - CHECKSUM..];
        if verify_checksum && Sha256::digest(body).as_slice() != checksum {
            return Err(LayerError::corrupt("checksum mismatch"));
        }

        let mut layer = None;
        let mut snapshot = LayerSnapshot::empty(LayerDescriptor::initial(""));
        let mut outer = Decoder::new(body);

        while !outer.at_end() {
            let kind_byte = outer.u8()?;
            let kind = SegmentKind::from_byte(kind_byte)
                .ok_or_else(|| LayerError::corrupt(format!("unknown segment kind {}", kind_byte)))?;
            let len = outer.u32()? as usize;
            let mut d = Decoder::new(outer.take(len)?);

            match kind {
                SegmentKind::Layer => {
                    let id = LayerId(d.u32()?);
                    let role_byte = d.u8()?;
                    let role = LayerRole::from_byte(role_byte)
                        .ok_or_else(|| LayerError::corrupt(format!("unknown layer role {}", role_byte)))?;
                    let name = d.string()?;
                    layer = Some(LayerDescriptor { id, role, name });
                }
                SegmentKind::Singletons => {
                    for _ in 0..d.u32()? {
                        let type_name = d.string()?;
                        let flag_byte = d.u8()?;
                        let flag = PersistFlag::from_byte(flag_byte)
                            .ok_or_else(|| LayerError::corrupt(format!("unknown persist flag {}", flag_byte)))?;
                        snapshot.singletons.push(SingletonRecord {
                            type_name,
                            flag,
                            object_id: d.i32()?,
                            initial_layer_only: d.bool()?,
                            constant_key: d.opt_string()?,
                        });
                    }
                }
                SegmentKind::SingletonObjects => {
                    for _ in 0..d.u32()? {
                        snapshot.singleton_objects.push(SingletonObjectRecord {
                            id: d.i32()?,
                            class_name: d.string()?,
                            recreate_name: d.string()?,
                            store: d.store()?,
                        });
                    }
                }
                SegmentKind::HeapObjects => {
                    for _ in 0..d.u32()? {
                        let id = d.u32()?;
                        let type_name = d.string()?;
                        let fields = d.store()?;
                        snapshot.heap_objects.push(HeapObjectRecord {
                            id,
                            object: HeapObject::new(type_name, fields),
                        });
                    }
                }
                SegmentKind::Constants => {
                    for _ in 0..d.u32()? {
                        let key = d.string()?;
                        let state = match d.u8()? {
                            0 => ConstantState::Committed {
                                object_id: d.u32()?,
                                layer: LayerId(d.u32()?),
                            },
                            1 => ConstantState::FuturePending {
                                declared_type: d.string()?,
                                layer: LayerId(d.u32()?),
                            },
                            2 => ConstantState::FutureFinalized {
                                declared_type: d.string()?,
                                object_id: d.u32()?,
                                finalized_in: LayerId(d.u32()?),
                            },
                            other => {
                                return Err(LayerError::corrupt(format!("unknown constant state {}", other)))
                            }
                        };
                        snapshot.constants.push(ConstantRecord { key, state });
                    }
                }
                SegmentKind::Symbols => {
                    for _ in 0..d.u32()? {
                        snapshot.symbols.push(DefinedSymbol {
                            name: d.string()?,
                            layer: LayerId(d.u32()?),
                        });
                    }
                }
                SegmentKind::Behaviors => {
                    for _ in 0..d.u32()? {
                        let entity = d.string()?;
                        let byte = d.u8()?;
                        let behavior = CompilationBehavior::from_byte(byte)
                            .ok_or_else(|| LayerError::corrupt(format!("unknown compilation behavior {}", byte)))?;
                        snapshot.behaviors.push(BehaviorRecord { entity, behavior });
                    }
                }
            }

            if !d.at_end() {
                return Err(LayerError::corrupt(format!("trailing bytes in {:?} segment", kind)));
            }
        }

        snapshot.layer = layer.ok_or_else(|| LayerError::corrupt("missing layer segment"))?;
        snapshot.check_references()?;
        Ok(snapshot)
    }

    /// Every object id referenced by a record must exist.
    fn check_references(&self) -> LayerResult<()> {
        for record in &self.singletons {
            if record.flag == PersistFlag::Create && self.singleton_object(record.object_id).is_none() {
                return Err(LayerError::corrupt(format!(
                    "singleton '{}' references missing object {}",
                    record.type_name, record.object_id
                )));
            }
        }
        for record in &self.constants {
            let object_id = match &record.state {
                ConstantState::Committed { object_id, .. } => Some(*object_id),
                ConstantState::FutureFinalized { object_id, .. } => Some(*object_id),
                ConstantState::FuturePending { .. } => None,
            };
            if let Some(id) = object_id {
                if self.heap_object(id).is_none() {
                    return Err(LayerError::corrupt(format!(
                        "constant '{}' references missing heap object {}",
                        record.key, id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

// ============================================================================
// Encoding primitives
// ============================================================================

#[derive(Default)]
struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn segment(&mut self, kind: SegmentKind, f: impl FnOnce(&mut Encoder)) {
        let mut inner = Encoder::default();
        f(&mut inner);
        self.u8(kind as u8);
        self.u32(inner.buf.len() as u32);
        self.buf.extend_from_slice(&inner.buf);
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn bool(&mut self, v: bool) {
        self.u8(v as u8);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn opt_str(&mut self, s: Option<&str>) {
        match s {
            Some(s) => {
                self.u8(1);
                self.str(s);
            }
            None => self.u8(0),
        }
    }

    fn store(&mut self, store: &KeyValueStore) {
        self.u32(store.len() as u32);
        for (key, value) in store.iter() {
            self.str(key);
            self.u8(value.tag());
            match value {
                KvValue::I32(v) => self.i32(*v),
                KvValue::I64(v) => self.i64(*v),
                KvValue::Str(v) => self.str(v),
                KvValue::I32List(list) => {
                    self.u32(list.len() as u32);
                    list.iter().for_each(|v| self.i32(*v));
                }
                KvValue::BoolList(list) => {
                    self.u32(list.len() as u32);
                    list.iter().for_each(|v| self.bool(*v));
                }
                KvValue::StrList(list) => {
                    self.u32(list.len() as u32);
                    list.iter().for_each(|v| self.str(v));
                }
            }
        }
    }
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos == self.data.len()
    }

    fn take(&mut self, n: usize) -> LayerResult<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(LayerError::corrupt("unexpected end of segment"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> LayerResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> LayerResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> LayerResult<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(LayerError::corrupt(format!("invalid boolean byte {}", other))),
        }
    }

    fn u32(&mut self) -> LayerResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> LayerResult<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> LayerResult<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> LayerResult<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| LayerError::corrupt("string is not valid UTF-8"))
    }

    fn opt_string(&mut self) -> LayerResult<Option<String>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.string()?)),
            other => Err(LayerError::corrupt(format!("invalid option tag {}", other))),
        }
    }

    fn store(&mut self) -> LayerResult<KeyValueStore> {
        let mut store = KeyValueStore::new();
        for _ in 0..self.u32()? {
            let key = self.string()?;
            let value = match self.u8()? {
                1 => KvValue::I32(self.i32()?),
                2 => KvValue::I64(self.i64()?),
                3 => KvValue::Str(self.string()?),
                4 => {
                    let n = self.u32()?;
                    KvValue::I32List((0..n).map(|_| self.i32()).collect::<LayerResult<_>>()?)
                }
                5 => {
                    let n = self.u32()?;
                    KvValue::BoolList((0..n).map(|_| self.bool()).collect::<LayerResult<_>>()?)
                }
                6 => {
                    let n = self.u32()?;
                    KvValue::StrList((0..n).map(|_| self.string()).collect::<LayerResult<_>>()?)
                }
                other => return Err(LayerError::corrupt(format!("unknown value tag {}", other))),
            };
            if !store.insert_decoded(key.clone(), value) {
                return Err(LayerError::corrupt(format!("duplicate store key '{}'", key)));
            }
        }
        Ok(store)
    }
}
