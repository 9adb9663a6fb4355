//! `rex`: the command-line entry point. Parses `-cp`/`--heap-size`/`-D` flags,
//! builds a [`Classpath`] over the given directories and `.jar`/`.zip` archives,
//! and hands a [`Vm`] the main class to run.
//!
//! Grounded on the teacher's (unwritten) `exo-java-bin`, which only ever got as
//! far as a `Cargo.toml` pointing at `exo-jvm` — the CLI surface itself follows
//! §4.10/§6.

use std::fs::File;
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use rex_class_file::item::ids::class::ClassName;
use rex_vm::classpath::Classpath;
use rex_vm::config::{VmConfig, Verbosity};
use rex_vm::value::{JvmClassInstanceTypes, JvmRefObjectType, JvmValue};
use rex_vm::{RexError, RexResult, Vm};

#[derive(Parser, Debug)]
#[command(name = "rex", about = "A from-scratch JVM bytecode interpreter")]
struct Args {
    /// Colon-separated list of directories and `.jar`/`.zip` files.
    #[arg(short = 'c', long = "cp", value_name = "CLASSPATH")]
    classpath: Option<String>,

    /// Initial heap size in bytes.
    #[arg(long = "heap-size", default_value_t = 64 * 1024 * 1024)]
    heap_size: usize,

    /// `-Dkey=value` system property, may be repeated.
    #[arg(short = 'D', value_name = "KEY=VALUE", action = clap::ArgAction::Append)]
    properties: Vec<String>,

    /// Print `tracing` spans at debug verbosity.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Binary name of the class carrying `public static void main(String[])`.
    main_class: String,

    /// Arguments passed to `main`.
    program_args: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let properties = match parse_properties(&args.properties) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("rex: {e}");
            return ExitCode::FAILURE;
        }
    };

    let classpath_entries = args
        .classpath
        .as_deref()
        .map(split_classpath)
        .unwrap_or_default();

    let config = VmConfig {
        classpath: classpath_entries.clone(),
        heap_size: args.heap_size,
        properties,
        verbosity: if args.verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        },
    };

    let classpath = Box::new(FileClasspath::new(classpath_entries));
    let mut vm = Vm::new(classpath, config);

    let main_class = match ClassName::parse_str(&args.main_class.replace('.', "/")) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("rex: invalid main class name {}: {e}", args.main_class);
            return ExitCode::FAILURE;
        }
    };

    match vm.run_main(&main_class, &args.program_args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RexError::Thrown(exception)) => {
            eprintln!("Exception in thread \"main\" {}", describe_exception(&vm, exception));
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("rex: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_properties(raw: &[String]) -> Result<Vec<(String, String)>, String> {
    raw.iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| format!("malformed -D property {entry:?}, expected key=value"))
        })
        .collect()
}

fn split_classpath(raw: &str) -> Vec<PathBuf> {
    raw.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect()
}

/// Prints the thrown exception's `detailMessage` field, matching how `throw_new`
/// (§4.4) populates it. Falls back to the class name alone if the field is absent
/// or the exception isn't an instance (it always should be).
fn describe_exception(vm: &Vm, exception: JvmValue) -> String {
    let JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Instance(ptr))) = exception
    else {
        return "<non-instance throwable>".to_string();
    };
    let instance = vm.heap.get(ptr);
    let class_name = vm.heap.get(instance.class).name.binary_name();
    let message = instance
        .fields
        .iter()
        .find(|(k, _)| k.name.0 == "detailMessage")
        .and_then(|(_, v)| match v {
            JvmValue::Reference(JvmRefObjectType::Class(JvmClassInstanceTypes::Instance(p))) => {
                vm.strings.content_of(&vm.heap, *p)
            }
            _ => None,
        });
    match message {
        Some(m) => format!("{class_name}: {m}"),
        None => class_name,
    }
}

/// Walks a classpath of directories and `.jar`/`.zip` archives looking for
/// `<binary-name>.class`. Directories are searched as a tree rooted at the
/// entry; archives via `zip`'s `by_name`. Archive handles are reopened per
/// lookup rather than kept mmapped, since class loads are infrequent relative
/// to bytecode execution.
struct FileClasspath {
    entries: Vec<PathBuf>,
    /// Cache of already-loaded bytes, keyed by binary name, guarded for `Sync`
    /// since `Classpath` requires it but lookups are read-mostly.
    cache: Mutex<ahash::AHashMap<String, Option<Vec<u8>>>>,
}

impl FileClasspath {
    fn new(entries: Vec<PathBuf>) -> Self {
        Self {
            entries,
            cache: Mutex::new(ahash::AHashMap::new()),
        }
    }

    fn search(&self, relative: &str) -> RexResult<Option<Vec<u8>>> {
        for entry in &self.entries {
            if entry.is_dir() {
                let candidate = entry.join(relative);
                if candidate.is_file() {
                    return Ok(Some(std::fs::read(candidate)?));
                }
            } else if is_archive(entry) {
                if let Some(bytes) = read_from_archive(entry, relative)? {
                    return Ok(Some(bytes));
                }
            }
        }
        Ok(None)
    }
}

impl Classpath for FileClasspath {
    fn find_class(&self, name: &ClassName) -> RexResult<Option<Vec<u8>>> {
        let relative = format!("{}.class", name.binary_name());
        if let Some(cached) = self.cache.lock().unwrap().get(&relative) {
            return Ok(cached.clone());
        }
        let found = self.search(&relative)?;
        self.cache.lock().unwrap().insert(relative, found.clone());
        Ok(found)
    }
}

fn is_archive(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("jar") | Some("zip")
    )
}

fn read_from_archive(path: &Path, relative: &str) -> RexResult<Option<Vec<u8>>> {
    let file = File::open(path)?;
    let mut archive = match zip::ZipArchive::new(file) {
        Ok(a) => a,
        Err(_) => return Ok(None),
    };
    let mut entry = match archive.by_name(relative) {
        Ok(e) => e,
        Err(_) => return Ok(None),
    };
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(Some(bytes))
}
