//! The native-method registry (§4.8).
//!
//! Grounded on the teacher's native dispatch in `vm/native/mod.rs`: a
//! process-wide table from `(class, method, descriptor)` to a host function,
//! consulted once at class-load time (`load_methods` caches the resolved
//! `NativeFn` on the `MethodImplementation` rather than re-looking it up on
//! every call). Every other native stays unregistered and fatal on first use,
//! per §4.8's explicit scoping: this VM does not attempt the hundreds of
//! individual native-method bodies the real JDK ships.

use rex_class_file::item::ids::class::ClassName;
use rex_class_file::item::ids::method::{MethodDescriptor, MethodName};

use crate::class::NativeFn;
use crate::error::{RexError, RexResult};
use crate::value::{JvmClassInstanceTypes, JvmRefObjectType, JvmValue};
use crate::vm::Vm;

pub fn lookup(class_name: &ClassName, method_name: &MethodName, _descriptor: &MethodDescriptor) -> Option<NativeFn> {
    let MethodName::Generic(name) = method_name else {
        // `<init>` is the only special name with a native body we register
        // (`Object.<init>`); everything else special-named is bytecode.
        return if class_name.binary_name() == "java/lang/Object" && *method_name == MethodName::Init {
            Some(object_init)
        } else {
            None
        };
    };

    match (class_name.binary_name().as_str(), name.0.as_str()) {
        ("java/lang/Object", "hashCode") => Some(object_hash_code),
        ("java/lang/Object", "getClass") => Some(object_get_class),
        ("java/lang/Object", "toString") => Some(object_to_string),
        ("java/lang/Object", "clone") => Some(object_clone),
        ("java/lang/Object", "wait") => Some(object_wait),
        ("java/lang/Object", "notify") => Some(object_notify),
        ("java/lang/Object", "notifyAll") => Some(object_notify_all),

        ("java/lang/Class", "getName") => Some(class_get_name),
        ("java/lang/Class", "isArray") => Some(class_is_array),
        ("java/lang/Class", "isInterface") => Some(class_is_interface),
        ("java/lang/Class", "isPrimitive") => Some(class_is_primitive),

        ("java/lang/System", "arraycopy") => Some(system_arraycopy),
        ("java/lang/System", "currentTimeMillis") => Some(system_current_time_millis),
        ("java/lang/System", "identityHashCode") => Some(system_identity_hash_code),
        ("java/lang/System", "setOut0") => Some(system_set_out0),
        ("java/lang/System", "setErr0") => Some(system_set_err0),
        ("java/lang/System", "initProperties") => Some(system_init_properties),

        ("java/lang/Throwable", "fillInStackTrace") => Some(throwable_fill_in_stack_trace),
        ("java/lang/Throwable", "getStackTraceElement") => Some(throwable_get_stack_trace_element),
        ("java/lang/Throwable", "getStackTraceDepth") => Some(throwable_get_stack_trace_depth),

        ("java/lang/Thread", "currentThread") => Some(thread_current_thread),
        ("java/lang/Thread", "start0") => Some(thread_start0),
        ("java/lang/Thread", "isAlive") => Some(thread_is_alive),
        ("java/lang/Thread", "sleep") => Some(thread_sleep),

        ("java/lang/StringUTF16", "getChar") => Some(string_utf16_get_char),
        ("java/lang/StringUTF16", "length") => Some(string_utf16_length),
        ("java/lang/StringLatin1", "getChar") => Some(string_utf16_get_char),
        ("java/lang/StringLatin1", "length") => Some(string_utf16_length),

        ("java/io/FileOutputStream", "writeBytes") => Some(file_output_stream_write_bytes),
        ("java/io/PrintStream", "print") | ("java/io/PrintStream", "println") => Some(print_stream_print),

        _ => None,
    }
}

fn object_init(_vm: &mut Vm, _args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    Ok(None)
}

fn object_hash_code(vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    let this = args.first().copied().unwrap_or(JvmValue::NULL);
    let hash = match this {
        JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Instance(p))) => {
            crate::heap::Heap::raw_index(p) as i32
        }
        JvmValue::Reference(JvmRefObjectType::Array(a)) => crate::heap::Heap::raw_index(a.array_ptr) as i32,
        _ => 0,
    };
    let _ = vm;
    Ok(Some(JvmValue::Int(hash)))
}

fn object_get_class(vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    let class = match args.first() {
        Some(JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Instance(p)))) => {
            vm.heap.get(*p).class
        }
        _ => return Err(RexError::Fatal("getClass on non-instance".into())),
    };
    Ok(Some(JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Class(class)))))
}

fn object_to_string(vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    let name = match args.first() {
        Some(JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Instance(p)))) => {
            vm.heap.get(vm.heap.get(*p).class).name.binary_name()
        }
        _ => "java.lang.Object".to_string(),
    };
    let string_class = vm.get_class(&ClassName::parse_str("java/lang/String")?)?;
    let ptr = vm.strings.intern(&mut vm.heap, string_class, &name);
    Ok(Some(JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Instance(ptr)))))
}

fn object_clone(vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    match args.first() {
        Some(JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Instance(p)))) => {
            let instance = vm.heap.get(*p);
            let cloned = crate::value::JavaClassInstance {
                class: instance.class,
                fields: instance.fields.clone(),
            };
            let ptr = vm.alloc(cloned);
            Ok(Some(JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Instance(ptr)))))
        }
        Some(JvmValue::Reference(JvmRefObjectType::Array(a))) => {
            let elements = vm.heap.get(a.array_ptr).elements.clone();
            let array_ptr = vm.alloc(crate::value::JvmArray { elements });
            Ok(Some(JvmValue::Reference(JvmRefObjectType::Array(crate::value::JvmArrayReference {
                array_type: a.array_type,
                array_ptr,
            }))))
        }
        _ => Err(RexError::Fatal("clone on non-cloneable value".into())),
    }
}

/// `Object.wait` is reduced to an immediate return (§4.7 notes the cooperative
/// scheduler never blocks the sole running thread on its own monitor).
fn object_wait(_vm: &mut Vm, _args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    Ok(None)
}

fn object_notify(vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    if let Some(JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Instance(p)))) = args.first() {
        vm.monitors.notify_one(crate::heap::Heap::raw_index(*p));
    }
    Ok(None)
}

fn object_notify_all(vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    if let Some(JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Instance(p)))) = args.first() {
        vm.monitors.notify_all(crate::heap::Heap::raw_index(*p));
    }
    Ok(None)
}

fn class_get_name(vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    let name = match args.first() {
        Some(JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Class(p)))) => {
            vm.heap.get(*p).name.binary_name().replace('/', ".")
        }
        _ => return Err(RexError::Fatal("getName on non-Class".into())),
    };
    let string_class = vm.get_class(&ClassName::parse_str("java/lang/String")?)?;
    let ptr = vm.strings.intern(&mut vm.heap, string_class, &name);
    Ok(Some(JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Instance(ptr)))))
}

fn class_is_array(vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    let is_array = match args.first() {
        Some(JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Class(p)))) => {
            vm.heap.get(*p).name.class_name == "array"
        }
        _ => false,
    };
    Ok(Some(JvmValue::Int(is_array as i32)))
}

fn class_is_interface(vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    let is_interface = match args.first() {
        Some(JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Class(p)))) => vm
            .heap
            .get(*p)
            .access_flags
            .contains(rex_class_file::item::file::ClassAccessFlags::ACC_INTERFACE),
        _ => false,
    };
    Ok(Some(JvmValue::Int(is_interface as i32)))
}

fn class_is_primitive(_vm: &mut Vm, _args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    // Primitive types never flow through this native in practice (there is no
    // instance to call it on without a boxed mirror), so false is always correct here.
    Ok(Some(JvmValue::Int(0)))
}

fn system_arraycopy(vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    let [src, src_pos, dest, dest_pos, length] = args else {
        return Err(RexError::Fatal("arraycopy expects 5 arguments".into()));
    };
    let (JvmValue::Reference(JvmRefObjectType::Array(src)), JvmValue::Int(src_pos)) = (src, src_pos) else {
        return Err(RexError::Fatal("arraycopy source is not an array".into()));
    };
    let (JvmValue::Reference(JvmRefObjectType::Array(dest)), JvmValue::Int(dest_pos)) = (dest, dest_pos) else {
        return Err(RexError::Fatal("arraycopy destination is not an array".into()));
    };
    let JvmValue::Int(length) = length else {
        return Err(RexError::Fatal("arraycopy length is not an int".into()));
    };
    let chunk: Vec<JvmValue> = vm.heap.get(src.array_ptr).elements
        [*src_pos as usize..*src_pos as usize + *length as usize]
        .to_vec();
    vm.heap.get_mut(dest.array_ptr).elements[*dest_pos as usize..*dest_pos as usize + *length as usize]
        .copy_from_slice(&chunk);
    Ok(None)
}

fn system_current_time_millis(_vm: &mut Vm, _args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(Some(JvmValue::Long(millis)))
}

fn system_identity_hash_code(vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    object_hash_code(vm, args)
}

fn system_set_out0(_vm: &mut Vm, _args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    Ok(None)
}

fn system_set_err0(_vm: &mut Vm, _args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    Ok(None)
}

fn system_init_properties(_vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    // Real `initProperties` populates a `Properties` instance in place and
    // returns it; this VM has no bootstrap properties to contribute, so the
    // argument (already constructed by Java bootstrap code) passes through.
    Ok(args.first().copied())
}

fn throwable_fill_in_stack_trace(_vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    Ok(args.first().copied())
}

fn throwable_get_stack_trace_element(_vm: &mut Vm, _args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    Ok(Some(JvmValue::NULL))
}

fn throwable_get_stack_trace_depth(_vm: &mut Vm, _args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    Ok(Some(JvmValue::Int(0)))
}

fn thread_current_thread(vm: &mut Vm, _args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    // This VM has no dedicated `Thread` mirror object per `VmThread`; natives
    // that only need the calling thread's identity (rather than its fields)
    // get null rather than a fabricated placeholder object.
    let _ = vm;
    Ok(Some(JvmValue::NULL))
}

/// Runs the target to completion synchronously rather than spawning an OS
/// thread, per the cooperative scheduling model (§4.4, `vm::thread`).
fn thread_start0(vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    let Some(JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Instance(p)))) = args.first() else {
        return Err(RexError::Fatal("start0 on non-Thread".into()));
    };
    let class = vm.heap.get(*p).class;
    let key = crate::class::MethodNameAndType {
        name: MethodName::Generic(rex_class_file::item::ids::UnqualifiedName::new("run").unwrap()),
        descriptor: MethodDescriptor::parse_str("()V")?,
    };
    vm.invoke_virtual(class, &key, &[*args.first().unwrap()])?;
    Ok(None)
}

fn thread_is_alive(_vm: &mut Vm, _args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    // `start0` already ran the thread to completion by the time Java code can
    // observe it, so it is never alive when asked.
    Ok(Some(JvmValue::Int(0)))
}

fn thread_sleep(_vm: &mut Vm, _args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    Ok(None)
}

fn string_utf16_get_char(vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    let (Some(JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Instance(p)))), Some(JvmValue::Int(index))) =
        (args.first(), args.get(1))
    else {
        return Err(RexError::Fatal("StringUTF16.charAt expects (String, int)".into()));
    };
    let content = vm.strings.content_of(&vm.heap, *p).unwrap_or_default();
    let ch = content.encode_utf16().nth(*index as usize).unwrap_or(0);
    Ok(Some(JvmValue::Char(ch)))
}

fn string_utf16_length(vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    let Some(JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Instance(p)))) = args.first() else {
        return Err(RexError::Fatal("StringUTF16.length expects a String".into()));
    };
    let len = vm.strings.content_of(&vm.heap, *p).unwrap_or_default().encode_utf16().count();
    Ok(Some(JvmValue::Int(len as i32)))
}

fn file_output_stream_write_bytes(vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    let Some(JvmValue::Reference(JvmRefObjectType::Array(arr))) = args.get(1) else {
        return Err(RexError::Fatal("writeBytes expects a byte[]".into()));
    };
    let bytes: Vec<u8> = vm
        .heap
        .get(arr.array_ptr)
        .elements
        .iter()
        .map(|v| if let JvmValue::Int(b) = v { *b as u8 } else { 0 })
        .collect();
    use std::io::Write;
    let _ = std::io::stdout().write_all(&bytes);
    Ok(None)
}

fn print_stream_print(vm: &mut Vm, args: &[JvmValue]) -> RexResult<Option<JvmValue>> {
    if let Some(JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Instance(p)))) = args.get(1) {
        if let Some(s) = vm.strings.content_of(&vm.heap, *p) {
            println!("{s}");
            return Ok(None);
        }
    }
    if let Some(v) = args.get(1) {
        println!("{v:?}");
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::RuntimeClass;
    use crate::classpath::EmptyClasspath;
    use crate::config::VmConfig;
    use crate::value::{JvmArray, JvmArrayReference, JvmArrayType};

    fn test_vm() -> Vm {
        Vm::new(Box::new(EmptyClasspath), VmConfig::default())
    }

    fn object_class(vm: &mut Vm) -> crate::heap::GcPtr<RuntimeClass> {
        let class = RuntimeClass {
            name: ClassName::parse_str("java/lang/Object").unwrap(),
            access_flags: rex_class_file::item::file::ClassAccessFlags::empty(),
            superclass: None,
            interfaces: vec![],
            fields: vec![],
            static_field_values: ahash::AHashMap::new(),
            methods: ahash::AHashMap::new(),
            constant_pool: crate::class::RuntimeConstantPool::default(),
            bootstrap_methods: vec![],
            initialized: true,
        };
        let ptr = vm.alloc(class);
        vm.classes.insert(ClassName::parse_str("java/lang/Object").unwrap(), ptr);
        ptr
    }

    #[test]
    fn lookup_finds_object_hash_code_but_not_an_unregistered_native() {
        let hash_code = MethodName::Generic(rex_class_file::item::ids::UnqualifiedName::new("hashCode").unwrap());
        let found = lookup(
            &ClassName::parse_str("java/lang/Object").unwrap(),
            &hash_code,
            &MethodDescriptor::parse_str("()I").unwrap(),
        );
        assert!(found.is_some());

        let finalize = MethodName::Generic(rex_class_file::item::ids::UnqualifiedName::new("finalize").unwrap());
        let missing = lookup(
            &ClassName::parse_str("java/lang/Object").unwrap(),
            &finalize,
            &MethodDescriptor::parse_str("()V").unwrap(),
        );
        assert!(missing.is_none());
    }

    #[test]
    fn object_hash_code_is_the_instance_heap_index() {
        let mut vm = test_vm();
        let class = object_class(&mut vm);
        let instance = vm.alloc(crate::value::JavaClassInstance {
            class,
            fields: ahash::AHashMap::new(),
        });
        let receiver = JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Instance(instance)));

        let hash = object_hash_code(&mut vm, &[receiver]).unwrap();
        assert_eq!(hash, Some(JvmValue::Int(crate::heap::Heap::raw_index(instance) as i32)));
    }

    #[test]
    fn string_utf16_length_and_char_match_the_interned_content() {
        let mut vm = test_vm();
        let string_class = object_class(&mut vm);
        let ptr = vm.strings.intern(&mut vm.heap, string_class, "hi");
        let receiver = JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Instance(ptr)));

        let len = string_utf16_length(&mut vm, &[receiver]).unwrap();
        assert_eq!(len, Some(JvmValue::Int(2)));

        let ch = string_utf16_get_char(&mut vm, &[receiver, JvmValue::Int(1)]).unwrap();
        assert_eq!(ch, Some(JvmValue::Char('i' as u16)));
    }

    #[test]
    fn system_arraycopy_copies_the_requested_slice() {
        let mut vm = test_vm();
        let src = vm.alloc(JvmArray {
            elements: vec![JvmValue::Int(1), JvmValue::Int(2), JvmValue::Int(3)],
        });
        let dest = vm.alloc(JvmArray {
            elements: vec![JvmValue::Int(0), JvmValue::Int(0), JvmValue::Int(0)],
        });
        let src_ref = JvmValue::Reference(JvmRefObjectType::Array(JvmArrayReference {
            array_type: JvmArrayType::Int,
            array_ptr: src,
        }));
        let dest_ref = JvmValue::Reference(JvmRefObjectType::Array(JvmArrayReference {
            array_type: JvmArrayType::Int,
            array_ptr: dest,
        }));

        system_arraycopy(
            &mut vm,
            &[src_ref, JvmValue::Int(1), dest_ref, JvmValue::Int(0), JvmValue::Int(2)],
        )
        .unwrap();

        assert_eq!(
            vm.heap.get(dest).elements,
            vec![JvmValue::Int(2), JvmValue::Int(3), JvmValue::Int(0)]
        );
    }
}
