//! The interpreter's call stack.
//!
//! Grounded on the teacher's `old/vm/thread/call_stack.rs` (`CallStack`,
//! `StackFrame`).

use rex_class_file::item::opcodes::InstructionList;

use crate::class::{ExceptionTableEntry, MethodNameAndType, RuntimeClass};
use crate::heap::GcPtr;
use crate::value::JvmValue;

/// One activation of a Java method.
#[derive(Debug)]
pub struct StackFrame {
    pub operand_stack: Vec<JvmValue>,
    pub local_variables: Vec<JvmValue>,
    pub current_class: GcPtr<RuntimeClass>,
    pub current_method: MethodNameAndType,
    pub exception_handlers: Vec<ExceptionTableEntry>,
    /// `None` for a frame whose method is native; natives run to completion
    /// inside `setup_method` without ever being stepped by the main loop.
    pub code: Option<InstructionList>,
    pub pc: usize,
}

impl StackFrame {
    pub fn push(&mut self, value: JvmValue) {
        self.operand_stack.push(value);
    }

    pub fn pop(&mut self) -> JvmValue {
        self.operand_stack
            .pop()
            .expect("operand stack underflow: verifier should have rejected this class")
    }
}

/// A thread's Java call stack.
#[derive(Debug, Default)]
pub struct CallStack {
    pub stack: Vec<StackFrame>,
}

impl CallStack {
    pub fn new() -> Self {
        Self { stack: Vec::new() }
    }

    pub fn push_frame(&mut self, frame: StackFrame) {
        self.stack.push(frame);
    }

    pub fn pop_frame(&mut self) -> Option<StackFrame> {
        self.stack.pop()
    }

    pub fn top(&mut self) -> Option<&mut StackFrame> {
        self.stack.last_mut()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}
