// This module implements the typed key-value store that carries persisted singleton
// state and serialized heap objects from one layer to the next. The value model is
// closed: signed 32-bit and 64-bit integers, strings, and lists of 32-bit integers,
// booleans and strings. KeyValueWriter fills a fresh store during the persist phase and
// refuses to write a key twice; KeyValueReader reads it back in the next layer and treats
// a missing key or a value of the wrong shape as a fatal deserialization error. Entries
// are kept in a BTreeMap so that the encoded snapshot is byte-for-byte deterministic.

//! Typed key-value store used as the persisted payload format.

use std::collections::BTreeMap;

use crate::core::error::{LayerError, LayerResult};

/// One value of the closed persisted value model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvValue {
    I32(i32),
    I64(i64),
    Str(String),
    I32List(Vec<i32>),
    BoolList(Vec<bool>),
    StrList(Vec<String>),
}

impl KvValue {
    /// Short name of the value shape, used in error messages.
    pub fn shape(&self) -> &'static str {
        match self {
            KvValue::I32(_) => "i32",
            KvValue::I64(_) => "i64",
            KvValue::Str(_) => "string",
            KvValue::I32List(_) => "i32 list",
            KvValue::BoolList(_) => "bool list",
            KvValue::StrList(_) => "string list",
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            KvValue::I32(_) => 1,
            KvValue::I64(_) => 2,
            KvValue::Str(_) => 3,
            KvValue::I32List(_) => 4,
            KvValue::BoolList(_) => 5,
            KvValue::StrList(_) => 6,
        }
    }
}

/// Immutable mapping from field name to [`KvValue`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyValueStore {
    entries: BTreeMap<String, KvValue>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&KvValue> {
        self.entries.get(key)
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &KvValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn reader(&self) -> KeyValueReader<'_> {
        KeyValueReader { store: self }
    }

    /// Used by the snapshot decoder, which rejects duplicates itself.
    pub(crate) fn insert_decoded(&mut self, key: String, value: KvValue) -> bool {
        self.entries.insert(key, value).is_none()
    }
}

/// Write side of the store, handed to `prepare_persist`.
#[derive(Debug, Default)]
pub struct KeyValueWriter {
    store: KeyValueStore,
}

impl KeyValueWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn put(&mut self, key: &str, value: KvValue) -> LayerResult<()> {
        if self.store.entries.contains_key(key) {
            return Err(LayerError::ProtocolViolation {
                key: key.to_string(),
                reason: "key written twice to the same store".into(),
            });
        }
        self.store.entries.insert(key.to_string(), value);
        Ok(())
    }

    pub fn write_int(&mut self, key: &str, value: i32) -> LayerResult<()> {
        self.put(key, KvValue::I32(value))
    }

    pub fn write_long(&mut self, key: &str, value: i64) -> LayerResult<()> {
        self.put(key, KvValue::I64(value))
    }

    pub fn write_string(&mut self, key: &str, value: impl Into<String>) -> LayerResult<()> {
        self.put(key, KvValue::Str(value.into()))
    }

    pub fn write_int_list(&mut self, key: &str, value: &[i32]) -> LayerResult<()> {
        self.put(key, KvValue::I32List(value.to_vec()))
    }

    pub fn write_bool_list(&mut self, key: &str, value: &[bool]) -> LayerResult<()> {
        self.put(key, KvValue::BoolList(value.to_vec()))
    }

    pub fn write_string_list<S: AsRef<str>>(&mut self, key: &str, value: &[S]) -> LayerResult<()> {
        self.put(
            key,
            KvValue::StrList(value.iter().map(|s| s.as_ref().to_string()).collect()),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Freeze the written entries.
    pub fn finish(self) -> KeyValueStore {
        self.store
    }
}

/// Read side of the store, handed to recreate functions.
#[derive(Debug, Clone, Copy)]
pub struct KeyValueReader<'a> {
    store: &'a KeyValueStore,
}

impl<'a> KeyValueReader<'a> {
    fn get(&self, key: &str) -> LayerResult<&'a KvValue> {
        self.store.entries.get(key).ok_or_else(|| LayerError::Deserialization {
            key: key.to_string(),
            reason: "key not present".into(),
        })
    }

    fn shape_error(key: &str, expected: &str, found: &KvValue) -> LayerError {
        LayerError::Deserialization {
            key: key.to_string(),
            reason: format!("expected {}, found {}", expected, found.shape()),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.entries.contains_key(key)
    }

    pub fn read_int(&self, key: &str) -> LayerResult<i32> {
        match self.get(key)? {
            KvValue::I32(v) => Ok(*v),
            other => Err(Self::shape_error(key, "i32", other)),
        }
    }

    pub fn read_long(&self, key: &str) -> LayerResult<i64> {
        match self.get(key)? {
            KvValue::I64(v) => Ok(*v),
            other => Err(Self::shape_error(key, "i64", other)),
        }
    }

    pub fn read_string(&self, key: &str) -> LayerResult<&'a str> {
        match self.get(key)? {
            KvValue::Str(v) => Ok(v.as_str()),
            other => Err(Self::shape_error(key, "string", other)),
        }
    }

    pub fn read_int_list(&self, key: &str) -> LayerResult<&'a [i32]> {
        match self.get(key)? {
            KvValue::I32List(v) => Ok(v.as_slice()),
            other => Err(Self::shape_error(key, "i32 list", other)),
        }
    }

    pub fn read_bool_list(&self, key: &str) -> LayerResult<&'a [bool]> {
        match self.get(key)? {
            KvValue::BoolList(v) => Ok(v.as_slice()),
            other => Err(Self::shape_error(key, "bool list", other)),
        }
    }

    pub fn read_string_list(&self, key: &str) -> LayerResult<&'a [String]> {
        match self.get(key)? {
            KvValue::StrList(v) => Ok(v.as_slice()),
            other => Err(Self::shape_error(key, "string list", other)),
        }
    }
}
