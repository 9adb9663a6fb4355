use std::path::PathBuf;

/// Runtime configuration for a VM instance, gathered from CLI flags by `rex-bin`
/// and passed down rather than read from the environment directly.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Directories and jar files searched for classes, in order.
    pub classpath: Vec<PathBuf>,

    /// Initial heap size, in bytes, for the mark-sweep collector.
    pub heap_size: usize,

    /// `-D` system properties supplied on the command line.
    pub properties: Vec<(String, String)>,

    /// Verbosity passed through to `tracing`'s `EnvFilter` when not overridden
    /// by `RUST_LOG`.
    pub verbosity: Verbosity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            classpath: vec![],
            heap_size: 64 * 1024 * 1024,
            properties: vec![],
            verbosity: Verbosity::Normal,
        }
    }
}
