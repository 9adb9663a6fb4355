//! The string intern pool (§4.5).
//!
//! Keyed directly by the Rust `String` content rather than a separate UTF-16
//! hash-and-chain scheme: the teacher's target allocator doesn't exist here, and
//! an `AHashMap<String, _>` gives the same "same content -> same instance"
//! guarantee `ldc` and `String.intern()` need without reimplementing a custom
//! hash table.

use ahash::AHashMap;

use crate::class::{FieldNameAndType, RuntimeClass};
use crate::heap::{GcPtr, Heap};
use crate::value::{JavaClassInstance, JvmArray, JvmArrayReference, JvmArrayType, JvmValue};

#[derive(Default)]
pub struct StringPool {
    interned: AHashMap<String, GcPtr<JavaClassInstance>>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Field name/descriptor of a `java.lang.String`'s backing `char[]`
    /// (§3's data model, §4.5's "allocate `char[]`, allocate `String` with
    /// value field set"). Matches the real JDK field shape, unlike the rest
    /// of this VM's simplified natives.
    fn value_field() -> FieldNameAndType {
        FieldNameAndType {
            name: rex_class_file::item::ids::UnqualifiedName::new("value").unwrap(),
            descriptor: rex_class_file::item::ids::field::FieldDescriptor::parse_str("[C").unwrap(),
        }
    }

    /// Interns `s`: returns the existing instance if this content has already
    /// been interned, otherwise allocates a `char[]` of its UTF-16 code units
    /// plus a `String` instance whose `value` field points at it.
    pub fn intern(
        &mut self,
        heap: &mut Heap,
        string_class: GcPtr<RuntimeClass>,
        s: &str,
    ) -> GcPtr<JavaClassInstance> {
        if let Some(ptr) = self.interned.get(s) {
            return *ptr;
        }
        let ptr = Self::alloc_string(heap, string_class, s);
        self.interned.insert(s.to_string(), ptr);
        ptr
    }

    /// Allocates a `char[]`-backed `String` instance without interning it.
    fn alloc_string(heap: &mut Heap, string_class: GcPtr<RuntimeClass>, s: &str) -> GcPtr<JavaClassInstance> {
        let elements: Vec<JvmValue> = s.encode_utf16().map(JvmValue::Char).collect();
        let char_array = heap.alloc(JvmArray { elements });
        let mut fields = AHashMap::new();
        fields.insert(
            Self::value_field(),
            JvmValue::Reference(crate::value::JvmRefObjectType::Array(JvmArrayReference {
                array_type: JvmArrayType::Char,
                array_ptr: char_array,
            })),
        );
        heap.alloc(JavaClassInstance {
            class: string_class,
            fields,
        })
    }

    /// Recovers the UTF-16 content of any `java.lang.String` instance by
    /// decoding its `value` field's `char[]` directly, rather than reverse
    /// scanning the intern table — works for interned and freshly-allocated
    /// strings alike, since both carry the same real `char[]` oop.
    pub fn content_of(&self, heap: &Heap, ptr: GcPtr<JavaClassInstance>) -> Option<String> {
        let instance = heap.get(ptr);
        let JvmValue::Reference(crate::value::JvmRefObjectType::Array(array_ref)) =
            instance.fields.get(&Self::value_field())?
        else {
            return None;
        };
        let units: Vec<u16> = heap
            .get(array_ref.array_ptr)
            .elements
            .iter()
            .map(|v| match v {
                JvmValue::Char(c) => *c,
                _ => 0,
            })
            .collect();
        Some(String::from_utf16_lossy(&units))
    }

    /// Drops intern-table entries whose backing oop did not survive the last
    /// `Heap::sweep` (§4.6 invariant 6: interned strings are reclaimed like
    /// any other unreachable object). Must run after `sweep`, not be fed into
    /// its root set — an interned string is a cache entry, not a GC root, so
    /// an interned string with nothing else referencing it should still die.
    pub fn prune_collected(&mut self, heap: &Heap) {
        self.interned.retain(|_, ptr| heap.is_live(Heap::raw_index(*ptr)));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.interned.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::RuntimeConstantPool;

    fn string_class(heap: &mut Heap) -> GcPtr<RuntimeClass> {
        heap.alloc(RuntimeClass {
            name: rex_class_file::item::ids::class::ClassName::parse_str("java/lang/String").unwrap(),
            access_flags: rex_class_file::item::file::ClassAccessFlags::empty(),
            superclass: None,
            interfaces: vec![],
            fields: vec![],
            static_field_values: AHashMap::new(),
            methods: AHashMap::new(),
            constant_pool: RuntimeConstantPool::default(),
            bootstrap_methods: vec![],
            initialized: true,
        })
    }

    #[test]
    fn interning_the_same_content_twice_returns_the_same_instance() {
        let mut heap = Heap::new(4096);
        let class = string_class(&mut heap);
        let mut pool = StringPool::new();

        let a = pool.intern(&mut heap, class, "hello");
        let b = pool.intern(&mut heap, class, "hello");
        assert_eq!(Heap::raw_index(a), Heap::raw_index(b));
    }

    #[test]
    fn content_of_decodes_the_backing_char_array() {
        let mut heap = Heap::new(4096);
        let class = string_class(&mut heap);
        let mut pool = StringPool::new();

        let ptr = pool.intern(&mut heap, class, "hi");
        assert_eq!(pool.content_of(&heap, ptr).as_deref(), Some("hi"));
    }

    #[test]
    fn content_of_works_for_a_string_that_was_never_interned() {
        let mut heap = Heap::new(4096);
        let class = string_class(&mut heap);

        let ptr = StringPool::alloc_string(&mut heap, class, "fresh");
        let pool = StringPool::new();
        assert_eq!(pool.content_of(&heap, ptr).as_deref(), Some("fresh"));
    }

    #[test]
    fn prune_collected_drops_entries_whose_oop_did_not_survive_sweep() {
        let mut heap = Heap::new(4096);
        let class = string_class(&mut heap);
        let mut pool = StringPool::new();
        pool.intern(&mut heap, class, "garbage");

        // Nothing roots the interned string or its class; sweeping with an
        // empty root set collects both.
        heap.sweep(&[]);
        pool.prune_collected(&heap);
        assert_eq!(pool.len(), 0);
    }
}
