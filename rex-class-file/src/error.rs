use thiserror::Error;

/// An error which can occur on deserialization of a class file.
#[derive(Debug, Error)]
pub enum ClassFileError {
    /// A generic I/O error.
    #[error("i/o error: {0}")]
    IoError(#[from] std::io::Error),

    /// Returned when a class file has a bad magic number.
    #[error("bad magic number: {0:#x}")]
    BadMagicNumber(u32),

    /// Returned when an unknown constant pool tag is found.
    #[error("unknown constant pool tag: {0}")]
    UnknownConstantPoolTag(u8),

    /// Returned when malformed modified UTF-8 is found in a `CONSTANT_Utf8` entry.
    #[error("malformed modified utf-8 in constant pool entry")]
    InvalidModifiedUtf8,

    /// Returned when an unknown reference kind is found.
    #[error("unknown method handle reference kind: {0}")]
    UnknownReferenceKind(u8),

    /// Returned when bad class access flags are found.
    #[error("bad class access flags")]
    BadClassAccessFlags,

    /// Returned when an unknown verification type info tag is found.
    #[error("unknown verification type info tag")]
    UnknownVerificationTypeInfo,

    /// Returned when an unknown stack map frame tag is found.
    #[error("unknown stack map frame tag: {0}")]
    UnknownStackMapFrameTag(u8),

    /// Returned when an unknown element value type is found.
    #[error("unknown annotation element value type: {0:?}")]
    UnknownElementValueType(char),

    /// Returned when an unknown target type value is found.
    #[error("unknown type annotation target type: {0}")]
    UnknownTargetTypeValue(u8),

    /// Returned when an unknown type path kind value is found.
    #[error("unknown type annotation type path kind: {0}")]
    UnknownTypePathKind(u8),

    /// Returned when bad formal parameter access flags are found.
    #[error("bad formal parameter access flags")]
    BadFormalParameterAccessFlags,

    /// Returned when a string constant was expected.
    #[error("expected a CONSTANT_Utf8 entry")]
    ExpectedString,

    /// Returned when a class constant pool index does not point at the expected entry kind.
    #[error("constant pool index {0} did not resolve to the expected entry kind")]
    BadConstantPoolIndex(usize),

    /// Returned when an unknown attribute is found.
    #[error("unknown attribute: {0}")]
    UnknownAttribute(String),

    /// Returned when bad field access flags are found.
    #[error("bad field access flags")]
    BadFieldAccessFlags,

    /// Returned when bad method access flags are found.
    #[error("bad method access flags")]
    BadMethodAccessFlags,

    /// Returned when an unknown opcode is found.
    #[error("unknown opcode: {0:#x}")]
    UnknownOpcodeError(u8),

    /// Returned when an unknown enum variant is found.
    #[error("unknown variant {1} for enum {0}")]
    UnknownEnumVariant(&'static str, i32),

    /// Returned when a field or method descriptor does not match the JVMS grammar.
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    /// Returned when a binary/qualified class name does not match the JVMS grammar.
    #[error("malformed class name: {0}")]
    MalformedClassName(String),

    /// Returned on overflow/underflow while computing lengths derived from class file data.
    #[error("arithmetic overflow while processing class file data")]
    ArithmeticError,
}

pub type Result<T> = std::result::Result<T, ClassFileError>;
