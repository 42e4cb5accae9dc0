//! Host runtime interface
//!
//! The recorder never walks stacks itself. An instrumented host runtime
//! describes every call boundary with a fixed-shape [`CallBoundary`] and
//! delivers it through [`Recorder::on_call_event`]. The [`Host`] trait is the
//! registration seam: the recorder installs and removes itself through it and
//! asks it for heap censuses.

use crate::recorder::Recorder;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// Opaque identity of one activation record (one invocation instance)
pub type ActivationId = u64;

/// Source location of an activation: a file-like identifier and the defining line
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub file: String,
    pub line: u32,
}

impl Location {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

/// Which side of an activation a notification describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Entered,
    Left,
}

/// Everything the recorder needs to know about one call boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallBoundary {
    /// The activation being entered or left
    pub activation: ActivationId,
    /// Location of the callee
    pub callee: Location,
    /// Location of the caller; `None` for pre-initialization (bootstrap) frames
    pub caller: Option<Location>,
    /// Name of the called code unit, used to label slow calls
    pub callee_label: String,
}

impl CallBoundary {
    pub fn new(
        activation: ActivationId,
        callee: Location,
        caller: Option<Location>,
        callee_label: impl Into<String>,
    ) -> Self {
        Self {
            activation,
            callee,
            caller,
            callee_label: callee_label.into(),
        }
    }

    /// The caller has no resolvable location
    pub fn is_bootstrap(&self) -> bool {
        self.caller.is_none()
    }
}

/// Live objects of one type at census time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapEntry {
    pub type_name: String,
    pub count: u64,
    pub size: u64,
}

impl HeapEntry {
    pub fn new(type_name: impl Into<String>, count: u64, size: u64) -> Self {
        Self {
            type_name: type_name.into(),
            count,
            size,
        }
    }
}

/// The instrumented runtime being traced
pub trait Host: Send + Sync {
    /// Register the call hook and the GC callback
    ///
    /// After this returns the host delivers call notifications to
    /// [`Recorder::on_call_event`] and collections to
    /// [`Recorder::gc_started`] / [`Recorder::gc_finished`].
    fn install(&self, recorder: &Recorder);

    /// Unregister everything `install` registered
    fn uninstall(&self);

    /// Count live objects grouped by type, if the runtime supports it
    fn heap_census(&self) -> Option<Vec<HeapEntry>> {
        None
    }
}

/// Host for embedders that call the recorder directly
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl Host for NullHost {
    fn install(&self, _recorder: &Recorder) {}

    fn uninstall(&self) {}
}

/// Maps a file-like identifier to a module label
pub trait ModuleResolver: Send + Sync {
    /// `None` when the identifier cannot be attributed to any module
    fn resolve(&self, file: &str) -> Option<String>;
}

/// Derives dotted module names from file paths and package marker files
///
/// `/src/proj/app/models.py` with a marker in `app/` resolves to
/// `proj.app.models`. Pseudo files such as `<string>` or `<frozen zipimport>`
/// resolve under the `host.` prefix.
#[derive(Debug, Clone)]
pub struct PathModuleResolver {
    /// A directory containing this file is a package
    pub package_marker: String,
    /// Stems that name the enclosing package rather than a module of their own
    pub init_stems: Vec<String>,
    /// Root directories that are not part of the module name
    pub transparent_roots: Vec<String>,
}

impl Default for PathModuleResolver {
    fn default() -> Self {
        Self {
            package_marker: "__init__.py".to_string(),
            init_stems: vec!["__init__".to_string()],
            transparent_roots: vec!["site-packages".to_string(), "dist-packages".to_string()],
        }
    }
}

impl PathModuleResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_package(&self, dir: &Path) -> bool {
        dir.join(&self.package_marker).exists()
    }

    fn root_name(dir: Option<&Path>) -> Option<String> {
        let named = dir
            .and_then(|d| d.file_name())
            .map(|n| n.to_string_lossy().into_owned());
        named.or_else(|| {
            std::env::current_dir()
                .ok()
                .as_deref()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
        })
    }
}

impl ModuleResolver for PathModuleResolver {
    fn resolve(&self, file: &str) -> Option<String> {
        if file.is_empty() {
            return None;
        }
        if let Some(pseudo) = file.strip_prefix('<') {
            let inner = pseudo.trim_end_matches('>');
            let inner = inner.strip_prefix("frozen ").unwrap_or(inner);
            return Some(format!("host.{}", inner));
        }

        let path = PathBuf::from(file);
        let mut parts: VecDeque<String> = VecDeque::new();
        let stem = path.file_stem()?.to_string_lossy().into_owned();
        if !self.init_stems.contains(&stem) {
            parts.push_front(stem);
        }

        let mut dir = path.parent();
        while let Some(current) = dir {
            if !self.is_package(current) {
                break;
            }
            if let Some(name) = current.file_name() {
                parts.push_front(name.to_string_lossy().into_owned());
            }
            dir = current.parent();
        }

        if let Some(root) = Self::root_name(dir) {
            if !self.transparent_roots.contains(&root) {
                parts.push_front(root);
            }
        }

        if parts.is_empty() {
            None
        } else {
            Some(Vec::from(parts).join("."))
        }
    }
}
