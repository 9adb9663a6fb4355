//! The classpath abstraction.
//!
//! The loader only needs to turn a binary class name into class file bytes; how
//! those bytes are found (a directory tree, a jar, a chain of both) is left to
//! `rex-bin`, which implements this trait over `zip` archives and plain
//! directories per the `-cp` flag.

use rex_class_file::item::ids::class::ClassName;

use crate::error::RexResult;

pub trait Classpath: Send + Sync {
    /// Find and read the class file bytes for `name`, if present anywhere on
    /// this classpath. `Ok(None)` means "not found here", not an error.
    fn find_class(&self, name: &ClassName) -> RexResult<Option<Vec<u8>>>;
}

/// A classpath with no entries, useful for tests that only load synthetic
/// classes via [`crate::loader::BootstrapClassLoader::define_class_raw`].
pub struct EmptyClasspath;

impl Classpath for EmptyClasspath {
    fn find_class(&self, _name: &ClassName) -> RexResult<Option<Vec<u8>>> {
        Ok(None)
    }
}
