//! The runtime value and object model.
//!
//! Grounded on the teacher's `vm/object.rs`: a tagged-enum `JvmValue` rather than
//! trait objects, because the interpreter's operand stack needs a `Copy`-able value
//! type it can push/pop without indirection for every integer and `Reference`.

use ahash::AHashMap;

use crate::class::{FieldNameAndType, RuntimeClass};
use crate::heap::{impl_trace_any, GcPtr, Trace};

/// A value that can sit on the operand stack, in a local variable slot, or in a
/// field. JVMS distinguishes many more primitive categories; this collapses the
/// ones that share a representation (`byte`/`short`/`int`/`boolean` all as `Int`,
/// `char` separately since it's unsigned 16-bit) per the teacher's `object.rs`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JvmValue {
    Reference(JvmRefObjectType),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(u16),
}

impl JvmValue {
    pub const NULL: JvmValue = JvmValue::Reference(JvmRefObjectType::Null);

    pub fn is_null(&self) -> bool {
        matches!(self, JvmValue::Reference(JvmRefObjectType::Null))
    }

    /// How many operand stack / local variable slots this value occupies.
    /// `long` and `double` take two, per JVMS 2.6.1.
    pub fn slot_width(&self) -> usize {
        match self {
            JvmValue::Long(_) | JvmValue::Double(_) => 2,
            _ => 1,
        }
    }
}

unsafe impl Send for JvmValue {}
unsafe impl Sync for JvmValue {}

/// A reference value: either null, or a pointer at a class instance or array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JvmRefObjectType {
    Class(JvmClassInstanceTypes),
    Array(JvmArrayReference),
    Null,
}

impl JvmRefObjectType {
    pub fn trace_into(&self, worklist: &mut Vec<usize>) {
        match self {
            JvmRefObjectType::Class(c) => c.trace_into(worklist),
            JvmRefObjectType::Array(a) => worklist.push(crate::heap::Heap::raw_index(a.array_ptr)),
            JvmRefObjectType::Null => {}
        }
    }
}

/// Distinguishes an ordinary heap instance from the `java.lang.Class` object
/// representing a loaded class, since both flow through the same reference slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JvmClassInstanceTypes {
    Instance(GcPtr<JavaClassInstance>),
    Class(GcPtr<RuntimeClass>),
}

impl JvmClassInstanceTypes {
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Instance(a), Self::Instance(b)) => {
                crate::heap::Heap::raw_index(*a) == crate::heap::Heap::raw_index(*b)
            }
            (Self::Class(a), Self::Class(b)) => {
                crate::heap::Heap::raw_index(*a) == crate::heap::Heap::raw_index(*b)
            }
            _ => false,
        }
    }

    fn trace_into(&self, worklist: &mut Vec<usize>) {
        match self {
            Self::Instance(p) => worklist.push(crate::heap::Heap::raw_index(*p)),
            Self::Class(p) => worklist.push(crate::heap::Heap::raw_index(*p)),
        }
    }
}

/// The element type of an array, carrying the component class for reference
/// arrays so `checkcast`/`instanceof` on arrays can resolve a component supertype.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JvmArrayType {
    Object(GcPtr<RuntimeClass>),
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Char,
    Boolean,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JvmArrayReference {
    pub array_type: JvmArrayType,
    pub array_ptr: GcPtr<JvmArray>,
}

/// The actual backing storage for an array object, heap-allocated so a `GcPtr`
/// can address it uniformly with class instances.
#[derive(Debug)]
pub struct JvmArray {
    pub elements: Vec<JvmValue>,
}

impl Trace for JvmArray {
    fn trace(&self, worklist: &mut Vec<usize>) {
        for element in &self.elements {
            if let JvmValue::Reference(r) = element {
                r.trace_into(worklist);
            }
        }
    }
    impl_trace_any!();
}

/// A single instance of a Java class: the class it was instantiated from plus its
/// field values, keyed by declaring name+descriptor so shadowed fields in a
/// superclass and subclass don't collide.
#[derive(Debug)]
pub struct JavaClassInstance {
    pub class: GcPtr<RuntimeClass>,
    pub fields: AHashMap<FieldNameAndType, JvmValue>,
}

impl Trace for JavaClassInstance {
    fn trace(&self, worklist: &mut Vec<usize>) {
        worklist.push(crate::heap::Heap::raw_index(self.class));
        for value in self.fields.values() {
            if let JvmValue::Reference(r) = value {
                r.trace_into(worklist);
            }
        }
    }
    impl_trace_any!();
}
