//! `rex-vm`: a class loader, object model, and bytecode interpreter.
//!
//! Grounded on the teacher's `vm/` crate layout — `error`, `config`, `class`,
//! `object` (here `value`), `heap`, and `vm` itself, each a top-level module
//! rather than nested behind a single monolithic `vm.rs`.

pub mod class;
pub mod classpath;
pub mod config;
pub mod error;
pub mod frame;
pub mod heap;
pub mod monitor;
pub mod strings;
pub mod value;
pub mod vm;

pub use error::{RexError, RexResult};
pub use vm::Vm;
