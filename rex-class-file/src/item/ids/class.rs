use crate::error::{self, ClassFileError};

use super::{field::FieldDescriptor, Cursor, BANNED_IDENT_CHARS};

/// A binary class or interface name (JVMS §4.2.1), e.g. `com/exopteron/Exo$Inner`.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct ClassName {
    /// The package of this class.
    pub package: Vec<String>,

    /// This class's name.
    pub class_name: String,

    /// Inner class, if any (the part of the name after a `$`).
    pub inner_class: Option<Box<ClassName>>,
}

impl ClassName {
    pub fn parse_str(s: &str) -> error::Result<Self> {
        let mut cur = Cursor::new(s);
        let v = Self::parse(&mut cur)?;
        if !cur.is_empty() {
            return Err(ClassFileError::MalformedClassName(s.to_string()));
        }
        Ok(v)
    }

    fn parse_section(cur: &mut Cursor) -> String {
        let mut s = String::new();
        while let Some(c) = cur.peek() {
            if BANNED_IDENT_CHARS.contains(&c) || c == '$' {
                break;
            }
            s.push(c);
            cur.bump();
        }
        s
    }

    fn parse(cur: &mut Cursor) -> error::Result<Self> {
        let mut sections = vec![Self::parse_section(cur)];
        while cur.peek() == Some('/') {
            cur.bump();
            sections.push(Self::parse_section(cur));
        }
        let inner_class = if cur.eat('$') {
            Some(Box::new(Self::parse(cur)?))
        } else {
            None
        };
        let class_name = sections.pop().filter(|s| !s.is_empty()).ok_or_else(|| {
            ClassFileError::MalformedClassName("missing class name segment".to_string())
        })?;
        Ok(Self { class_name, package: sections, inner_class })
    }

    /// The fully-qualified, slash-separated name, as it appears in the constant pool.
    pub fn binary_name(&self) -> String {
        let mut s = self.package.join("/");
        if !s.is_empty() {
            s.push('/');
        }
        s.push_str(&self.class_name);
        let mut cur = &self.inner_class;
        while let Some(inner) = cur {
            s.push('$');
            s.push_str(&inner.class_name);
            cur = &inner.inner_class;
        }
        s
    }
}

impl std::fmt::Display for ClassName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.binary_name())
    }
}

/// Either a plain class/interface reference, or an array class referenced by its field
/// descriptor (as seen in `CONSTANT_Class_info` entries for array types).
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClassRefName {
    Class(ClassName),
    Array(FieldDescriptor),
}

impl ClassRefName {
    pub fn parse_str(s: &str) -> error::Result<Self> {
        if s.starts_with('[') {
            Ok(Self::Array(FieldDescriptor::parse_str(s)?))
        } else {
            Ok(Self::Class(ClassName::parse_str(s)?))
        }
    }
}

impl std::fmt::Display for ClassRefName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Class(c) => write!(f, "{c}"),
            Self::Array(a) => write!(f, "{a}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ClassName;

    #[test]
    fn parses_simple_name() {
        let n = ClassName::parse_str("java/lang/Object").unwrap();
        assert_eq!(n.package, vec!["java", "lang"]);
        assert_eq!(n.class_name, "Object");
        assert!(n.inner_class.is_none());
    }

    #[test]
    fn parses_inner_class() {
        let n = ClassName::parse_str("com/exopteron/Exo$Inner").unwrap();
        assert_eq!(n.class_name, "Exo");
        assert_eq!(n.inner_class.as_ref().unwrap().class_name, "Inner");
        assert_eq!(n.binary_name(), "com/exopteron/Exo$Inner");
    }
}
