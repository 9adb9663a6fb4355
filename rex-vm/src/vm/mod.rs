//! The virtual machine: owns the heap, the loaded-class table, and the set of
//! live threads. Grounded on the teacher's `vm/mod.rs` `VM` struct, rebuilt from
//! scratch since the teacher's own version was unfinished scaffolding (see
//! `DESIGN.md`).

pub mod interpreter;
mod loader;
pub mod natives;
pub mod thread;

use ahash::AHashMap;
use rex_class_file::item::ids::class::ClassName;

use crate::classpath::Classpath;
use crate::config::VmConfig;
use crate::heap::{GcPtr, Heap};
use crate::class::RuntimeClass;
use crate::error::RexResult;
use crate::monitor::MonitorTable;
use crate::strings::StringPool;
use crate::vm::thread::VmThread;

/// The virtual machine instance. One per process invocation; `rex-bin` owns
/// exactly one and drives it to completion of `main`.
pub struct Vm {
    pub heap: Heap,
    pub classes: AHashMap<ClassName, GcPtr<RuntimeClass>>,
    pub classpath: Box<dyn Classpath>,
    pub config: VmConfig,
    pub threads: Vec<VmThread>,
    pub strings: StringPool,
    pub monitors: MonitorTable,
    /// Index into `threads` of the thread currently executing. The interpreter
    /// is cooperative (§4.4): only one thread steps at a time.
    pub current_thread: usize,
}

impl Vm {
    pub fn new(classpath: Box<dyn Classpath>, config: VmConfig) -> Self {
        let heap_size = config.heap_size;
        Self {
            heap: Heap::new(heap_size),
            classes: AHashMap::new(),
            classpath,
            config,
            threads: vec![VmThread::main()],
            strings: StringPool::new(),
            monitors: MonitorTable::new(),
            current_thread: 0,
        }
    }

    pub fn current_thread(&mut self) -> &mut VmThread {
        &mut self.threads[self.current_thread]
    }

    /// Run a full mark-sweep cycle (§4.6). Roots are every loaded class and
    /// every frame's locals and operand stack across every thread. The intern
    /// table is deliberately NOT rooted: an interned string with nothing else
    /// referencing it is garbage like anything else, so it's pruned from the
    /// table after the sweep instead of kept alive by it.
    #[tracing::instrument(skip(self))]
    pub fn collect(&mut self) {
        let mut roots = Vec::new();
        for class in self.classes.values() {
            roots.push(Heap::raw_index(*class));
        }
        for thread in &self.threads {
            for frame in &thread.call_stack.stack {
                for value in &frame.operand_stack {
                    if let crate::value::JvmValue::Reference(r) = value {
                        r.trace_into(&mut roots);
                    }
                }
                for value in &frame.local_variables {
                    if let crate::value::JvmValue::Reference(r) = value {
                        r.trace_into(&mut roots);
                    }
                }
            }
        }
        self.heap.sweep(&roots);
        self.strings.prune_collected(&self.heap);
    }

    fn collect_if_needed(&mut self) {
        if self.heap.should_collect() {
            self.collect();
        }
    }

    pub fn alloc<T: crate::heap::Trace>(&mut self, value: T) -> GcPtr<T> {
        self.collect_if_needed();
        self.heap.alloc(value)
    }

    /// Run `main(String[])` on `main_class` to completion, per §4.7's bootstrap
    /// ordering: load the class (which triggers `<clinit>` per §4.3), then
    /// invoke `main`.
    pub fn run_main(&mut self, main_class: &ClassName, args: &[String]) -> RexResult<()> {
        let class = self.get_class(main_class)?;
        let args_array = self.alloc_string_array(args)?;
        let key = crate::class::MethodNameAndType {
            name: rex_class_file::item::ids::method::MethodName::Generic(
                rex_class_file::item::ids::UnqualifiedName::new("main").unwrap(),
            ),
            descriptor: rex_class_file::item::ids::method::MethodDescriptor::parse_str(
                "([Ljava/lang/String;)V",
            )?,
        };
        self.invoke(class, &key, &[crate::value::JvmValue::Reference(
            crate::value::JvmRefObjectType::Array(args_array),
        )])?;
        Ok(())
    }

    fn alloc_string_array(
        &mut self,
        args: &[String],
    ) -> RexResult<crate::value::JvmArrayReference> {
        let string_class = self.get_class(&ClassName::parse_str("java/lang/String")?)?;
        let mut elements = Vec::with_capacity(args.len());
        for arg in args {
            elements.push(crate::value::JvmValue::Reference(
                crate::value::JvmRefObjectType::Class(crate::value::JvmClassInstanceTypes::Instance(
                    self.strings.intern(&mut self.heap, string_class, arg),
                )),
            ));
        }
        let array_ptr = self.alloc(crate::value::JvmArray { elements });
        Ok(crate::value::JvmArrayReference {
            array_type: crate::value::JvmArrayType::Object(string_class),
            array_ptr,
        })
    }
}
