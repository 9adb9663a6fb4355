use thiserror::Error;

use crate::value::JvmValue;

/// Errors that can occur while running the virtual machine.
///
/// A `Thrown` carries the `java.lang.Throwable` instance itself, mirroring how
/// the interpreter's main loop propagates exceptions up through `JvmResult`
/// until a handler catches them or the thread dies.
#[derive(Debug, Error)]
pub enum RexError {
    /// A Java exception is propagating and found no handler in the current frame.
    #[error("uncaught Java exception")]
    Thrown(JvmValue),

    /// A malformed class file was rejected by the parser.
    #[error("class file error: {0}")]
    ClassFile(#[from] rex_class_file::error::ClassFileError),

    /// The requested class could not be located on the classpath.
    #[error("class not found: {0}")]
    ClassNotFound(String),

    /// A method or field lookup failed against a class and its supertypes.
    #[error("no such member: {0}")]
    NoSuchMember(String),

    /// A native method has no registered implementation.
    #[error("unlinked native method: {0}")]
    UnsatisfiedLink(String),

    /// An I/O error while reading a class file or classpath entry.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A fatal, unrecoverable VM condition (corrupt heap state, verifier bug, etc).
    #[error("fatal VM error: {0}")]
    Fatal(String),
}

pub type RexResult<T> = std::result::Result<T, RexError>;
