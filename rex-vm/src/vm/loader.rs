//! The bootstrap class loader.
//!
//! Grounded on the teacher's `vm/class/bootstrap.rs` (`BootstrapClassLoader`,
//! `load_class`, `load_class_fields`, `load_class_methods`,
//! `load_runtime_constant_pool`, `define_class_raw`), adapted to: call the new
//! `parse_str` associated functions directly instead of the teacher's
//! Lexer-based macros, propagate `RexResult` instead of `.expect(...)`/`panic!`
//! placeholders, and resolve constant-pool refs lazily into `RuntimeConstant`
//! instead of eagerly loading every referenced class up front.

use std::io::Cursor as IoCursor;

use ahash::AHashMap;
use rex_class_file::item::constant_pool::ConstantPoolEntry;
use rex_class_file::item::file::ClassFile;
use rex_class_file::item::fields::FieldAccessFlags;
use rex_class_file::item::ids::class::ClassName;
use rex_class_file::item::ids::field::FieldDescriptor;
use rex_class_file::item::ids::method::{MethodDescriptor, MethodName};
use rex_class_file::item::ids::UnqualifiedName;
use rex_class_file::item::methods::MethodAccessFlags;
use rex_class_file::item::opcodes::CodeVerificationError;
use rex_class_file::item::ClassFileItem;
use rex_class_file::stream::ClassFileStream;

use crate::class::{
    BootstrapMethodSpec, ExceptionTableEntry, FieldNameAndType, JavaMethodCode,
    MethodImplementation, MethodImplementationType, MethodNameAndType, RuntimeClass,
    RuntimeConstant, RuntimeConstantPool,
};
use crate::error::{RexError, RexResult};
use crate::heap::{GcPtr, Heap};
use crate::value::JvmValue;
use crate::vm::Vm;

impl Vm {
    /// `get_class` from §4.2: idempotent, dispatches on the name's shape.
    #[tracing::instrument(skip(self), fields(class = %name))]
    pub fn get_class(&mut self, name: &ClassName) -> RexResult<GcPtr<RuntimeClass>> {
        if let Some(ptr) = self.classes.get(name) {
            return Ok(*ptr);
        }
        let bytes = self
            .classpath
            .find_class(name)?
            .ok_or_else(|| RexError::ClassNotFound(name.binary_name()))?;
        let mut cursor = IoCursor::new(bytes);
        let class_file =
            ClassFile::read_from_stream(&mut ClassFileStream::new(&mut cursor), None)?;
        self.define_class(name.clone(), class_file)
    }

    /// Synthesize an array class (`[I`, `[Ljava/lang/String;`, ...). Grounded
    /// on `load_array_class`; array classes have no fields/methods of their
    /// own and extend `Object` directly per JLS 10.8.
    pub fn get_array_class(&mut self, descriptor: &FieldDescriptor) -> RexResult<GcPtr<RuntimeClass>> {
        let object_class = self.get_class(&ClassName::parse_str("java/lang/Object")?)?;
        let synthetic = RuntimeClass {
            name: ClassName::parse_str("array")
                .unwrap_or_else(|_| ClassName { package: vec![], class_name: format!("{descriptor}"), inner_class: None }),
            access_flags: rex_class_file::item::file::ClassAccessFlags::empty(),
            superclass: Some(object_class),
            interfaces: vec![],
            fields: vec![],
            static_field_values: AHashMap::new(),
            methods: AHashMap::new(),
            constant_pool: RuntimeConstantPool::default(),
            bootstrap_methods: Vec::new(),
            initialized: true,
        };
        Ok(self.alloc(synthetic))
    }

    /// Defines a class from an already-parsed `ClassFile`, for both
    /// classpath-backed loads and dynamically-defined classes
    /// (`load_instance_class` in §4.2).
    pub fn define_class(&mut self, name: ClassName, class_file: ClassFile) -> RexResult<GcPtr<RuntimeClass>> {
        let cp = &class_file.constant_pool;

        let superclass = if class_file.super_class == 0 {
            None
        } else {
            let super_name = Self::class_name_at(cp, class_file.super_class)?;
            Some(self.get_class(&super_name)?)
        };

        let mut interfaces = Vec::with_capacity(class_file.interfaces.len());
        for &index in &class_file.interfaces {
            let iface_name = Self::class_name_at(cp, index)?;
            interfaces.push(self.get_class(&iface_name)?);
        }

        let fields = Self::load_fields(cp, &class_file.fields)?;
        let mut static_field_values = AHashMap::new();
        for (field, access) in &fields {
            if access.contains(FieldAccessFlags::ACC_STATIC) {
                static_field_values.insert(field.clone(), Self::default_value(&field.descriptor));
            }
        }

        let methods = Self::load_methods(&name, cp, &class_file.methods)?;
        let constant_pool = Self::load_runtime_constant_pool(cp)?;
        let bootstrap_methods = Self::load_bootstrap_methods(&class_file);

        let class = RuntimeClass {
            name: name.clone(),
            access_flags: class_file.access_flags,
            superclass,
            interfaces,
            fields,
            static_field_values,
            methods,
            constant_pool,
            bootstrap_methods,
            initialized: false,
        };
        let ptr = self.alloc(class);
        self.classes.insert(name, ptr);

        self.apply_constant_values(ptr, &class_file)?;
        self.run_clinit(ptr)?;
        Ok(ptr)
    }

    pub fn define_class_raw(&mut self, class: RuntimeClass) -> GcPtr<RuntimeClass> {
        let name = class.name.clone();
        let ptr = self.alloc(class);
        self.classes.insert(name, ptr);
        ptr
    }

    fn class_name_at(cp: &rex_class_file::item::ConstantPool, index: u16) -> RexResult<ClassName> {
        match cp.get_constant(index as usize) {
            ConstantPoolEntry::Class { name_index } => {
                let name = cp.get_utf8_constant(*name_index as usize)?;
                Ok(ClassName::parse_str(name)?)
            }
            _ => Err(RexError::Fatal(format!(
                "constant pool index {index} is not a CONSTANT_Class_info"
            ))),
        }
    }

    fn load_fields(
        cp: &rex_class_file::item::ConstantPool,
        fields: &[rex_class_file::item::fields::FieldInfo],
    ) -> RexResult<Vec<(FieldNameAndType, FieldAccessFlags)>> {
        let mut out = Vec::with_capacity(fields.len());
        for field in fields {
            let name = UnqualifiedName::new(cp.get_utf8_constant(field.name_index as usize)?)
                .ok_or_else(|| RexError::Fatal("bad field name".into()))?;
            let descriptor =
                FieldDescriptor::parse_str(cp.get_utf8_constant(field.descriptor_index as usize)?)?;
            out.push((FieldNameAndType { name, descriptor }, field.access_flags));
        }
        Ok(out)
    }

    fn load_methods(
        class_name: &ClassName,
        cp: &rex_class_file::item::ConstantPool,
        methods: &[rex_class_file::item::methods::MethodInfo],
    ) -> RexResult<AHashMap<MethodNameAndType, MethodImplementation>> {
        let mut out = AHashMap::new();
        for method in methods {
            let name = MethodName::parse_str(cp.get_utf8_constant(method.name_index as usize)?)?;
            let descriptor =
                MethodDescriptor::parse_str(cp.get_utf8_constant(method.descriptor_index as usize)?)?;

            let imp = if method.access_flags.contains(MethodAccessFlags::ACC_NATIVE) {
                let handler = crate::vm::natives::lookup(class_name, &name, &descriptor)
                    .ok_or_else(|| RexError::UnsatisfiedLink(format!("{class_name}.{name}")))?;
                MethodImplementationType::Native(handler)
            } else {
                let code_attrs = method.attributes.get("Code");
                let code_attr = code_attrs.first().ok_or_else(|| {
                    RexError::Fatal(format!("{class_name}.{name} has no Code attribute"))
                })?;
                MethodImplementationType::Java(Self::load_code(cp, code_attr)?)
            };

            out.insert(
                MethodNameAndType {
                    name,
                    descriptor: descriptor.clone(),
                },
                MethodImplementation {
                    descriptor,
                    access: method.access_flags,
                    declaring_class: class_name.clone(),
                    imp,
                },
            );
        }
        Ok(out)
    }

    fn load_code(
        cp: &rex_class_file::item::ConstantPool,
        attr: &rex_class_file::item::attribute_info::Attributes,
    ) -> RexResult<JavaMethodCode> {
        let rex_class_file::item::attribute_info::Attributes::Code {
            max_stack,
            max_locals,
            code,
            exception_table,
            ..
        } = attr
        else {
            return Err(RexError::Fatal("expected Code attribute".into()));
        };

        let mut table = Vec::with_capacity(exception_table.len());
        for entry in exception_table {
            let start = *code
                .byte_to_code
                .get(&(*entry.pc_range.start() as usize))
                .ok_or_else(|| RexError::Fatal("exception table start_pc not an instruction boundary".into()))?;
            let end = if (*entry.pc_range.end() as usize) == code.opcodes.len() {
                code.opcodes.len()
            } else {
                *code
                    .byte_to_code
                    .get(&(*entry.pc_range.end() as usize))
                    .ok_or_else(|| RexError::Fatal("exception table end_pc not an instruction boundary".into()))?
            };
            let handler_pc = *code
                .byte_to_code
                .get(&(entry.handler_pc as usize))
                .ok_or_else(|| RexError::Fatal("exception table handler_pc not an instruction boundary".into()))?;
            table.push(ExceptionTableEntry {
                pc_range: (start, end),
                handler_pc,
                catch_type: if entry.catch_type == 0 {
                    None
                } else {
                    Some(Self::class_name_at(cp, entry.catch_type)?)
                },
            });
        }

        Ok(JavaMethodCode {
            max_stack: *max_stack,
            max_locals: *max_locals,
            code: code.clone(),
            exception_table: table,
        })
    }

    /// Extract a class's `BootstrapMethods` attribute (JVMS 4.7.23), present
    /// whenever the class's bytecode contains at least one `invokedynamic`.
    /// Absent otherwise; not every class carries one.
    fn load_bootstrap_methods(class_file: &ClassFile) -> Vec<BootstrapMethodSpec> {
        let attrs = class_file.attributes.get("BootstrapMethods");
        let Some(rex_class_file::item::attribute_info::Attributes::BootstrapMethods { bootstrap_methods }) =
            attrs.first()
        else {
            return Vec::new();
        };
        bootstrap_methods
            .iter()
            .map(|entry| BootstrapMethodSpec {
                method_handle_index: entry.bootstrap_method_ref,
                arguments: entry.bootstrap_arguments.clone(),
            })
            .collect()
    }

    /// Resolve (and cache, if not already loaded) every runtime constant of a
    /// class's constant pool. Grounded on `load_runtime_constant_pool`.
    fn load_runtime_constant_pool(
        cp: &rex_class_file::item::ConstantPool,
    ) -> RexResult<RuntimeConstantPool> {
        let mut resolved = Vec::with_capacity(cp.entries.len());
        for entry in &cp.entries {
            let constant = match entry {
                ConstantPoolEntry::Class { name_index } => {
                    let name = cp.get_utf8_constant(*name_index as usize)?;
                    RuntimeConstant::ClassRef(ClassName::parse_str(name).unwrap_or_else(|_| {
                        ClassName { package: vec![], class_name: name.to_string(), inner_class: None }
                    }))
                }
                ConstantPoolEntry::String { string_index } => {
                    RuntimeConstant::StringRef(cp.get_utf8_constant(*string_index as usize)?.to_string())
                }
                ConstantPoolEntry::Integer { bytes } => RuntimeConstant::Resolved(JvmValue::Int(*bytes)),
                ConstantPoolEntry::Float { float } => {
                    RuntimeConstant::Resolved(JvmValue::Float(f32::from_bits(*float)))
                }
                ConstantPoolEntry::Long { bytes } => RuntimeConstant::Resolved(JvmValue::Long(*bytes)),
                ConstantPoolEntry::Double { bytes } => {
                    RuntimeConstant::Resolved(JvmValue::Double(f64::from_bits(*bytes)))
                }
                ConstantPoolEntry::Fieldref { class_index, name_and_type_index } => {
                    let class = Self::class_name_at(cp, *class_index)?;
                    let (name, descriptor) = Self::name_and_type_at(cp, *name_and_type_index)?;
                    RuntimeConstant::FieldRef {
                        class,
                        field: FieldNameAndType {
                            name: UnqualifiedName::new(name)
                                .ok_or_else(|| RexError::Fatal("bad field name".into()))?,
                            descriptor: FieldDescriptor::parse_str(descriptor)?,
                        },
                    }
                }
                ConstantPoolEntry::Methodref { class_index, name_and_type_index }
                | ConstantPoolEntry::InterfaceMethodref { class_index, name_and_type_index } => {
                    let class = Self::class_name_at(cp, *class_index)?;
                    let (name, descriptor) = Self::name_and_type_at(cp, *name_and_type_index)?;
                    RuntimeConstant::MethodRef {
                        class,
                        method: MethodNameAndType {
                            name: MethodName::parse_str(name)?,
                            descriptor: MethodDescriptor::parse_str(descriptor)?,
                        },
                        is_interface: matches!(entry, ConstantPoolEntry::InterfaceMethodref { .. }),
                    }
                }
                ConstantPoolEntry::MethodHandle { reference_kind, reference_index } => {
                    match cp.get_constant(*reference_index as usize) {
                        ConstantPoolEntry::Methodref { class_index, name_and_type_index }
                        | ConstantPoolEntry::InterfaceMethodref { class_index, name_and_type_index } => {
                            let class = Self::class_name_at(cp, *class_index)?;
                            let (name, descriptor) = Self::name_and_type_at(cp, *name_and_type_index)?;
                            RuntimeConstant::MethodHandle {
                                kind: *reference_kind,
                                class,
                                method: MethodNameAndType {
                                    name: MethodName::parse_str(name)?,
                                    descriptor: MethodDescriptor::parse_str(descriptor)?,
                                },
                            }
                        }
                        // Field-kind handles (getField/putStatic/...) aren't needed
                        // by the LambdaMetafactory-scoped invokedynamic support.
                        _ => RuntimeConstant::Unresolved,
                    }
                }
                ConstantPoolEntry::MethodType { descriptor_index } => {
                    let descriptor = cp.get_utf8_constant(*descriptor_index as usize)?;
                    RuntimeConstant::MethodType(MethodDescriptor::parse_str(descriptor)?)
                }
                ConstantPoolEntry::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => {
                    let (name, descriptor) = Self::name_and_type_at(cp, *name_and_type_index)?;
                    RuntimeConstant::Dynamic {
                        bootstrap_method_attr_index: *bootstrap_method_attr_index,
                        name_and_type: MethodNameAndType {
                            name: MethodName::parse_str(name)?,
                            descriptor: MethodDescriptor::parse_str(descriptor)?,
                        },
                    }
                }
                _ => RuntimeConstant::Unresolved,
            };
            resolved.push(constant);
            if matches!(entry, ConstantPoolEntry::Long { .. } | ConstantPoolEntry::Double { .. }) {
                resolved.push(RuntimeConstant::Unresolved);
            }
        }
        Ok(RuntimeConstantPool { resolved })
    }

    fn name_and_type_at<'a>(
        cp: &'a rex_class_file::item::ConstantPool,
        index: u16,
    ) -> RexResult<(&'a str, &'a str)> {
        match cp.get_constant(index as usize) {
            ConstantPoolEntry::NameAndType { name_index, descriptor_index } => Ok((
                cp.get_utf8_constant(*name_index as usize)?,
                cp.get_utf8_constant(*descriptor_index as usize)?,
            )),
            _ => Err(RexError::Fatal(format!(
                "constant pool index {index} is not a CONSTANT_NameAndType_info"
            ))),
        }
    }

    /// Pre-populate static final fields carrying a `ConstantValue` attribute,
    /// per JLS: this happens before `<clinit>` runs.
    fn apply_constant_values(&mut self, class: GcPtr<RuntimeClass>, class_file: &ClassFile) -> RexResult<()> {
        for field_info in &class_file.fields {
            let Some(rex_class_file::item::attribute_info::Attributes::ConstantValue {
                constantvalue_index,
            }) = field_info.attributes.get("ConstantValue").first()
            else {
                continue;
            };
            let name = UnqualifiedName::new(
                class_file.constant_pool.get_utf8_constant(field_info.name_index as usize)?,
            )
            .ok_or_else(|| RexError::Fatal("bad field name".into()))?;
            let descriptor = FieldDescriptor::parse_str(
                class_file
                    .constant_pool
                    .get_utf8_constant(field_info.descriptor_index as usize)?,
            )?;
            let value = match class_file.constant_pool.get_constant(*constantvalue_index as usize) {
                ConstantPoolEntry::Integer { bytes } => JvmValue::Int(*bytes),
                ConstantPoolEntry::Float { float } => JvmValue::Float(f32::from_bits(*float)),
                ConstantPoolEntry::Long { bytes } => JvmValue::Long(*bytes),
                ConstantPoolEntry::Double { bytes } => JvmValue::Double(f64::from_bits(*bytes)),
                ConstantPoolEntry::String { string_index } => {
                    let s = class_file.constant_pool.get_utf8_constant(*string_index as usize)?;
                    let string_class = self.get_class(&ClassName::parse_str("java/lang/String")?)?;
                    JvmValue::Reference(crate::value::JvmRefObjectType::Class(
                        crate::value::JvmClassInstanceTypes::Instance(
                            self.strings.intern(&mut self.heap, string_class, s),
                        ),
                    ))
                }
                _ => continue,
            };
            self.heap
                .get_mut(class)
                .static_field_values
                .insert(FieldNameAndType { name, descriptor }, value);
        }
        Ok(())
    }

    fn default_value(descriptor: &FieldDescriptor) -> JvmValue {
        use rex_class_file::item::ids::field::{BaseType, FieldType};
        match descriptor {
            FieldType::BaseType(BaseType::Double) => JvmValue::Double(0.0),
            FieldType::BaseType(BaseType::Float) => JvmValue::Float(0.0),
            FieldType::BaseType(BaseType::Long) => JvmValue::Long(0),
            FieldType::BaseType(BaseType::Char) => JvmValue::Char(0),
            FieldType::ObjectType(_) | FieldType::ArrayType(_) => JvmValue::NULL,
            _ => JvmValue::Int(0),
        }
    }

    /// Run `<clinit>` if present, preceded by the superclass's, per JLS 12.4.2.
    /// §4.3 asks for an `INITIALIZING` state guarding concurrent callers; this
    /// VM only ever has one thread stepping at a time (§4.4), so a plain
    /// `initialized` flag is sufficient and there is nothing to block on.
    pub(crate) fn run_clinit(&mut self, class: GcPtr<RuntimeClass>) -> RexResult<()> {
        if self.heap.get(class).initialized {
            return Ok(());
        }
        self.heap.get_mut(class).initialized = true;

        if let Some(sup) = self.heap.get(class).superclass {
            self.run_clinit(sup)?;
        }

        let key = MethodNameAndType {
            name: MethodName::Clinit,
            descriptor: MethodDescriptor::parse_str("()V")?,
        };
        if self.heap.get(class).methods.contains_key(&key) {
            self.invoke(class, &key, &[])?;
        }
        Ok(())
    }
}
