use crate::error::{self, ClassFileError};

use super::{field::FieldType, Cursor, UnqualifiedName};

/// Marker type for a `void` return descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VoidDescriptor;

pub type ParameterDescriptor = FieldType;

/// Return descriptor: either a field type or `void`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReturnDescriptor {
    Field(FieldType),
    Void(VoidDescriptor),
}

impl ReturnDescriptor {
    fn parse(cur: &mut Cursor) -> error::Result<Self> {
        if cur.eat('V') {
            Ok(Self::Void(VoidDescriptor))
        } else {
            Ok(Self::Field(FieldType::parse_from(cur)?))
        }
    }
}

/// A method descriptor contains zero or more parameter descriptors, representing the types
/// of parameters that the method takes, and a return descriptor, representing the type of
/// the value (if any) that the method returns.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodDescriptor {
    pub parameters: Vec<ParameterDescriptor>,
    pub return_desc: ReturnDescriptor,
}

impl MethodDescriptor {
    pub fn parse_str(s: &str) -> error::Result<Self> {
        let mut cur = Cursor::new(s);
        cur.expect('(')?;
        let mut parameters = vec![];
        while cur.peek() != Some(')') {
            if cur.peek().is_none() {
                return Err(ClassFileError::MalformedDescriptor(s.to_string()));
            }
            parameters.push(ParameterDescriptor::parse_from(&mut cur)?);
        }
        cur.expect(')')?;
        let return_desc = ReturnDescriptor::parse(&mut cur)?;
        if !cur.is_empty() {
            return Err(ClassFileError::MalformedDescriptor(s.to_string()));
        }
        Ok(Self {
            parameters,
            return_desc,
        })
    }
}

/// Method name: the two reserved special names `<clinit>`/`<init>`, or an ordinary
/// unqualified name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MethodName {
    Clinit,
    Init,
    Generic(UnqualifiedName),
}

impl MethodName {
    pub fn parse_str(s: &str) -> error::Result<Self> {
        if let Some(inner) = s.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
            match inner {
                "clinit" => Ok(Self::Clinit),
                "init" => Ok(Self::Init),
                _ => Err(ClassFileError::MalformedDescriptor(format!(
                    "bad special method name: {s}"
                ))),
            }
        } else {
            UnqualifiedName::new(s)
                .map(Self::Generic)
                .ok_or_else(|| ClassFileError::MalformedDescriptor(format!("bad method name: {s}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ids::field::BaseType;

    #[test]
    fn parses_empty_void_descriptor() {
        let d = MethodDescriptor::parse_str("()V").unwrap();
        assert!(d.parameters.is_empty());
        assert_eq!(d.return_desc, ReturnDescriptor::Void(VoidDescriptor));
    }

    #[test]
    fn parses_multi_param_descriptor() {
        let d = MethodDescriptor::parse_str("(IDLjava/lang/Thread;)Ljava/lang/Object;").unwrap();
        assert_eq!(d.parameters.len(), 3);
        assert_eq!(d.parameters[0], FieldType::BaseType(BaseType::Int));
        match &d.return_desc {
            ReturnDescriptor::Field(FieldType::ObjectType(o)) => {
                assert_eq!(o.class_name.class_name, "Object")
            }
            _ => panic!("expected object return type"),
        }
    }

    #[test]
    fn parses_special_names() {
        assert_eq!(MethodName::parse_str("<init>").unwrap(), MethodName::Init);
        assert_eq!(MethodName::parse_str("<clinit>").unwrap(), MethodName::Clinit);
        assert!(matches!(
            MethodName::parse_str("doStuff").unwrap(),
            MethodName::Generic(_)
        ));
    }
}
