//! The runtime class model: a loaded class, its fields, and its methods.
//!
//! Grounded on the teacher's `vm/class/mod.rs` (`FieldNameAndType`, `MethodNameAndType`,
//! `MethodImplementation`, `JavaMethodCode`, `JavaExceptionTableEntry`) and `JVMRawClass`
//! from `vm/class/bootstrap.rs`. `JVMRawClass` is renamed `RuntimeClass` since "raw" only
//! made sense relative to the teacher's separate (never-finished) high-level class wrapper.

use ahash::AHashMap;
use rex_class_file::item::constant_pool::RefKind;
use rex_class_file::item::ids::class::ClassName;
use rex_class_file::item::ids::field::FieldDescriptor;
use rex_class_file::item::ids::method::{MethodDescriptor, MethodName};
use rex_class_file::item::fields::FieldAccessFlags;
use rex_class_file::item::methods::MethodAccessFlags;
use rex_class_file::item::file::ClassAccessFlags;
use rex_class_file::item::opcodes::InstructionList;

use crate::error::RexResult;
use crate::heap::{impl_trace_any, GcPtr, Trace};
use crate::value::JvmValue;

/// A field's identity within a class: name plus descriptor, since a subclass may
/// declare a field that shadows one of the same name but different type.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct FieldNameAndType {
    pub name: rex_class_file::item::ids::UnqualifiedName,
    pub descriptor: FieldDescriptor,
}

/// A method's identity within a class: name plus descriptor, distinguishing
/// overloads.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct MethodNameAndType {
    pub name: MethodName,
    pub descriptor: MethodDescriptor,
}

/// One entry of a `Code` attribute's exception table (JVMS 4.7.3).
#[derive(Debug, Clone)]
pub struct ExceptionTableEntry {
    /// Inclusive start / exclusive end of the range of bytecode indices this
    /// handler guards, as indices into `JavaMethodCode::code.opcodes`.
    pub pc_range: (usize, usize),
    pub handler_pc: usize,
    /// `None` means a `finally` handler: catches everything. Resolved lazily
    /// against the owning class's constant pool at throw time, per §4.4,
    /// rather than eagerly at load time (a handler's catch class may not be
    /// loaded yet, and may never need to be if the handler never fires).
    pub catch_type: Option<ClassName>,
}

/// The bytecode body of a non-native method.
#[derive(Debug, Clone)]
pub struct JavaMethodCode {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: InstructionList,
    pub exception_table: Vec<ExceptionTableEntry>,
}

/// A native method's implementation. Takes the already-resolved argument list
/// (`this` first for instance methods) and returns the method's result, if any.
pub type NativeFn = fn(&mut crate::vm::Vm, &[JvmValue]) -> RexResult<Option<JvmValue>>;

pub enum MethodImplementationType {
    Native(NativeFn),
    Java(JavaMethodCode),
    /// A method backed directly by a resolved `MethodHandle` rather than a
    /// `Code` attribute, used for the single abstract method of a lambda
    /// synthesized by `invokedynamic` (§4.9). Dispatching it forwards the
    /// receiver's captured arguments plus the call's own arguments to
    /// `method` on `owner`, per `kind`'s calling convention.
    BoundHandle {
        kind: RefKind,
        owner: GcPtr<RuntimeClass>,
        method: MethodNameAndType,
    },
}

impl std::fmt::Debug for MethodImplementationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native(_) => write!(f, "Native(..)"),
            Self::Java(code) => f.debug_tuple("Java").field(code).finish(),
            Self::BoundHandle { kind, owner, method } => f
                .debug_struct("BoundHandle")
                .field("kind", kind)
                .field("owner", owner)
                .field("method", method)
                .finish(),
        }
    }
}

#[derive(Debug)]
pub struct MethodImplementation {
    pub descriptor: MethodDescriptor,
    pub access: MethodAccessFlags,
    pub declaring_class: ClassName,
    pub imp: MethodImplementationType,
}

impl MethodImplementation {
    pub fn is_static(&self) -> bool {
        self.access.contains(MethodAccessFlags::ACC_STATIC)
    }
}

/// One entry of a class's `BootstrapMethods` attribute (JVMS 4.7.23):
/// a method handle constant-pool index plus the indices of its static
/// arguments, left unresolved until an `invokedynamic` call site actually
/// needs them.
#[derive(Debug, Clone)]
pub struct BootstrapMethodSpec {
    pub method_handle_index: u16,
    pub arguments: Vec<u16>,
}

/// A loaded, linked class or interface.
///
/// Unlike the teacher's `JVMRawClass`, field values for instances live on the
/// instance itself (`JavaClassInstance::fields`); only *static* field values live
/// here, since they belong to the class, not any one instance.
#[derive(Debug)]
pub struct RuntimeClass {
    pub name: ClassName,
    pub access_flags: ClassAccessFlags,
    pub superclass: Option<GcPtr<RuntimeClass>>,
    pub interfaces: Vec<GcPtr<RuntimeClass>>,
    pub fields: Vec<(FieldNameAndType, FieldAccessFlags)>,
    pub static_field_values: AHashMap<FieldNameAndType, JvmValue>,
    pub methods: AHashMap<MethodNameAndType, MethodImplementation>,
    pub constant_pool: RuntimeConstantPool,
    pub bootstrap_methods: Vec<BootstrapMethodSpec>,
    pub initialized: bool,
}

impl RuntimeClass {
    /// Look up a method on this class, then its superclasses, per JVMS 5.4.3.3.
    pub fn resolve_method<'h>(
        heap: &'h crate::heap::Heap,
        class: GcPtr<RuntimeClass>,
        key: &MethodNameAndType,
    ) -> Option<GcPtr<RuntimeClass>> {
        let mut current = Some(class);
        while let Some(c) = current {
            let rc = heap.get(c);
            if rc.methods.contains_key(key) {
                return Some(c);
            }
            current = rc.superclass;
        }
        None
    }

    /// Look up which class in the hierarchy declares a field, per JVMS 5.4.3.2.
    pub fn resolve_field<'h>(
        heap: &'h crate::heap::Heap,
        class: GcPtr<RuntimeClass>,
        key: &FieldNameAndType,
    ) -> Option<GcPtr<RuntimeClass>> {
        let mut current = Some(class);
        while let Some(c) = current {
            let rc = heap.get(c);
            if rc.fields.iter().any(|(f, _)| f == key) {
                return Some(c);
            }
            current = rc.superclass;
        }
        None
    }

    pub fn is_subclass_of(heap: &crate::heap::Heap, class: GcPtr<RuntimeClass>, of: GcPtr<RuntimeClass>) -> bool {
        let mut current = Some(class);
        while let Some(c) = current {
            if crate::heap::Heap::raw_index(c) == crate::heap::Heap::raw_index(of) {
                return true;
            }
            let rc = heap.get(c);
            if rc.interfaces.iter().any(|i| crate::heap::Heap::raw_index(*i) == crate::heap::Heap::raw_index(of)) {
                return true;
            }
            current = rc.superclass;
        }
        false
    }
}

impl Trace for RuntimeClass {
    fn trace(&self, worklist: &mut Vec<usize>) {
        if let Some(sup) = self.superclass {
            worklist.push(crate::heap::Heap::raw_index(sup));
        }
        for iface in &self.interfaces {
            worklist.push(crate::heap::Heap::raw_index(*iface));
        }
        for value in self.static_field_values.values() {
            if let JvmValue::Reference(r) = value {
                r.trace_into(worklist);
            }
        }
        for constant in &self.constant_pool.resolved {
            if let RuntimeConstant::Resolved(JvmValue::Reference(r)) = constant {
                r.trace_into(worklist);
            }
        }
    }
    impl_trace_any!();
}

/// A constant pool entry resolved against the runtime class table, lazily:
/// `String`/`Class` entries resolve to heap objects on first use and are cached
/// here afterward. Grounded on the teacher's `RuntimeConstant`/`RuntimeConstantPool`
/// (`vm/class/bootstrap.rs`); the teacher's source for these types could not be
/// located in the retrieved pack, so the shape below follows what `bootstrap.rs`'s
/// call sites require rather than a file read.
#[derive(Debug, Clone)]
pub enum RuntimeConstant {
    Unresolved,
    ClassRef(ClassName),
    StringRef(String),
    FieldRef {
        class: ClassName,
        field: FieldNameAndType,
    },
    MethodRef {
        class: ClassName,
        method: MethodNameAndType,
        is_interface: bool,
    },
    /// A `CONSTANT_MethodHandle_info` resolved to the concrete method it
    /// refers to. Field-kind handles (`REF_getField`/`REF_putStatic`/...)
    /// aren't needed by this VM's scoped `invokedynamic` support (§4.9 covers
    /// `LambdaMetafactory`, whose bootstrap and `implMethod` arguments are
    /// always invoke-kind handles) and resolve to `Unresolved` instead.
    MethodHandle {
        kind: RefKind,
        class: ClassName,
        method: MethodNameAndType,
    },
    MethodType(MethodDescriptor),
    /// A `CONSTANT_InvokeDynamic_info`: the owning class's `bootstrap_methods`
    /// index (not a constant pool index — JVMS 4.4.10 indexes a separate
    /// table) plus the call site's own name and descriptor.
    Dynamic {
        bootstrap_method_attr_index: u16,
        name_and_type: MethodNameAndType,
    },
    Resolved(JvmValue),
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeConstantPool {
    pub resolved: Vec<RuntimeConstant>,
}

impl RuntimeConstantPool {
    pub fn get(&self, index: usize) -> &RuntimeConstant {
        &self.resolved[index - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn bare_class(name: &str, superclass: Option<GcPtr<RuntimeClass>>) -> RuntimeClass {
        RuntimeClass {
            name: ClassName::parse_str(name).unwrap(),
            access_flags: ClassAccessFlags::empty(),
            superclass,
            interfaces: vec![],
            fields: vec![],
            static_field_values: AHashMap::new(),
            methods: AHashMap::new(),
            constant_pool: RuntimeConstantPool::default(),
            bootstrap_methods: vec![],
            initialized: true,
        }
    }

    fn method_key(name: &str) -> MethodNameAndType {
        MethodNameAndType {
            name: MethodName::Generic(rex_class_file::item::ids::UnqualifiedName::new(name).unwrap()),
            descriptor: MethodDescriptor::parse_str("()V").unwrap(),
        }
    }

    fn native_method(declaring_class: &str) -> MethodImplementation {
        MethodImplementation {
            descriptor: MethodDescriptor::parse_str("()V").unwrap(),
            access: MethodAccessFlags::empty(),
            declaring_class: ClassName::parse_str(declaring_class).unwrap(),
            imp: MethodImplementationType::Native(|_, _| Ok(None)),
        }
    }

    #[test]
    fn resolve_method_walks_up_the_superclass_chain() {
        let mut heap = Heap::new(1024);
        let object = heap.alloc(bare_class("java/lang/Object", None));
        let mut parent = bare_class("com/example/Parent", Some(object));
        parent.methods.insert(method_key("greet"), native_method("com/example/Parent"));
        let parent = heap.alloc(parent);
        let child = heap.alloc(bare_class("com/example/Child", Some(parent)));

        let found = RuntimeClass::resolve_method(&heap, child, &method_key("greet"));
        assert_eq!(found.map(Heap::raw_index), Some(Heap::raw_index(parent)));
    }

    #[test]
    fn resolve_method_returns_none_when_absent_from_the_hierarchy() {
        let mut heap = Heap::new(1024);
        let object = heap.alloc(bare_class("java/lang/Object", None));
        let child = heap.alloc(bare_class("com/example/Child", Some(object)));

        assert!(RuntimeClass::resolve_method(&heap, child, &method_key("missing")).is_none());
    }

    #[test]
    fn resolve_field_finds_shadowed_declaration_on_the_nearest_class() {
        let mut heap = Heap::new(1024);
        let field = FieldNameAndType {
            name: rex_class_file::item::ids::UnqualifiedName::new("count").unwrap(),
            descriptor: FieldDescriptor::parse_str("I").unwrap(),
        };
        let mut parent = bare_class("com/example/Parent", None);
        parent.fields.push((field.clone(), FieldAccessFlags::empty()));
        let parent = heap.alloc(parent);
        let mut child = bare_class("com/example/Child", Some(parent));
        child.fields.push((field.clone(), FieldAccessFlags::empty()));
        let child = heap.alloc(child);

        let found = RuntimeClass::resolve_field(&heap, child, &field);
        assert_eq!(found.map(Heap::raw_index), Some(Heap::raw_index(child)));
    }

    #[test]
    fn is_subclass_of_is_true_for_self_and_every_ancestor() {
        let mut heap = Heap::new(1024);
        let object = heap.alloc(bare_class("java/lang/Object", None));
        let parent = heap.alloc(bare_class("com/example/Parent", Some(object)));
        let child = heap.alloc(bare_class("com/example/Child", Some(parent)));

        assert!(RuntimeClass::is_subclass_of(&heap, child, child));
        assert!(RuntimeClass::is_subclass_of(&heap, child, parent));
        assert!(RuntimeClass::is_subclass_of(&heap, child, object));
    }

    #[test]
    fn is_subclass_of_is_false_for_unrelated_classes() {
        let mut heap = Heap::new(1024);
        let object = heap.alloc(bare_class("java/lang/Object", None));
        let a = heap.alloc(bare_class("com/example/A", Some(object)));
        let b = heap.alloc(bare_class("com/example/B", Some(object)));

        assert!(!RuntimeClass::is_subclass_of(&heap, a, b));
    }
}
