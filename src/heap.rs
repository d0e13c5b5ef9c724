//! Image heap constants as seen by the layer registries.
//!
//! The analysis engine that decides what ends up in the image heap lives
//! outside this crate. The registries only need a handle with identity
//! ([`HeapConstant`]), a serializable form ([`HeapObject`]) and a way to ask
//! whether a constant was materialized ([`HeapLayout`]).

use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::persist::key_value::KeyValueStore;

/// Serializable form of a heap object: its type and its field values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapObject {
    pub type_name: String,
    pub fields: KeyValueStore,
}

impl HeapObject {
    pub fn new(type_name: impl Into<String>, fields: KeyValueStore) -> Self {
        Self {
            type_name: type_name.into(),
            fields,
        }
    }
}

/// Shared handle to a heap object.
///
/// Two handles are the same constant only if they point at the same object;
/// structurally equal objects allocated separately are distinct constants.
#[derive(Clone)]
pub struct HeapConstant(Arc<HeapObject>);

impl HeapConstant {
    pub fn new(object: HeapObject) -> Self {
        Self(Arc::new(object))
    }

    pub fn object(&self) -> &HeapObject {
        &self.0
    }

    pub fn type_name(&self) -> &str {
        &self.0.type_name
    }

    /// Identity of the constant within this process.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn same_identity(&self, other: &HeapConstant) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for HeapConstant {
    fn eq(&self, other: &Self) -> bool {
        self.same_identity(other)
    }
}

impl Eq for HeapConstant {}

impl std::hash::Hash for HeapConstant {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Debug for HeapConstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapConstant({}@{:#x})", self.0.type_name, self.identity())
    }
}

/// Answers whether a constant made it into the image heap.
pub trait HeapLayout {
    fn is_materialized(&self, constant: &HeapConstant) -> bool;
}

/// Heap layout that tracks materialized constants by identity and assigns
/// each one a heap offset.
#[derive(Debug, Default)]
pub struct ImageHeap {
    offsets: HashMap<usize, u64>,
    objects: Vec<HeapConstant>,
    next_offset: u64,
    object_size: u64,
}

impl ImageHeap {
    /// A heap placing every object `object_size` bytes apart.
    pub fn new(object_size: u64) -> Self {
        Self {
            object_size,
            ..Self::default()
        }
    }

    /// Materialize `constant`, returning its heap offset.
    pub fn materialize(&mut self, constant: &HeapConstant) -> u64 {
        if let Some(&offset) = self.offsets.get(&constant.identity()) {
            return offset;
        }
        let offset = self.next_offset;
        self.next_offset += self.object_size.max(1);
        self.offsets.insert(constant.identity(), offset);
        self.objects.push(constant.clone());
        offset
    }

    pub fn offset_of(&self, constant: &HeapConstant) -> Option<u64> {
        self.offsets.get(&constant.identity()).copied()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl HeapLayout for ImageHeap {
    fn is_materialized(&self, constant: &HeapConstant) -> bool {
        self.offsets.contains_key(&constant.identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::key_value::KeyValueWriter;

    fn string_constant(value: &str) -> HeapConstant {
        let mut w = KeyValueWriter::new();
        w.write_string("value", value).unwrap();
        HeapConstant::new(HeapObject::new("java.lang.String", w.finish()))
    }

    #[test]
    fn test_identity_not_structure() {
        let a = string_constant("hello");
        let b = string_constant("hello");
        assert_eq!(a.object(), b.object());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_image_heap_offsets() {
        let mut heap = ImageHeap::new(16);
        let a = string_constant("a");
        let b = string_constant("b");

        assert_eq!(heap.materialize(&a), 0);
        assert_eq!(heap.materialize(&b), 16);
        assert_eq!(heap.materialize(&a), 0);
        assert_eq!(heap.len(), 2);

        assert!(heap.is_materialized(&b));
        assert!(!heap.is_materialized(&string_constant("c")));
        assert_eq!(heap.offset_of(&b), Some(16));
    }
}
