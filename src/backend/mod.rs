//! Code generation backends.
//!
//! Every backend lowers the same analyzed [`Script`] into a set of project
//! files for its target platform. The driver picks one via [`backend_for`]
//! and hands the result to the project emitter.
mod c;
mod dmason;
mod flame;
mod flame_model;
mod flamegpu;
mod mason;
mod printer;
mod xml;

pub use self::c::CBackend;
pub use self::dmason::DMasonBackend;
pub use self::flame::FlameBackend;
pub use self::flame_model::{FlameFunc, FlameMessage, FlameModel};
pub use self::flamegpu::FlameGPUBackend;
pub use self::mason::MasonBackend;
pub use self::printer::*;
pub use self::xml::{XmlElem, XmlWriter};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::{error::Error, fmt::Display, path::PathBuf};

use crate::parser::ast::Script;

/// Compile-time configuration collected from `-P key=value` flags.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: HashMap<String, String>,
}

impl Config {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key).map(String::as_str) {
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            _ => default,
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.values
            .get(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }
}

/// Everything a backend needs besides the script itself.
#[derive(Debug, Clone)]
pub struct BackendContext {
    pub config: Config,
    /// Directory holding target-platform dependencies (e.g. the MASON jar).
    pub deps_dir: PathBuf,
}

impl BackendContext {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            deps_dir: PathBuf::from("./deps"),
        }
    }
}

/// A feature of the script that the selected target cannot express.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotSupportedError(pub String);

impl Display for NotSupportedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for NotSupportedError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for BackendError {}

impl From<NotSupportedError> for BackendError {
    fn from(value: NotSupportedError) -> Self {
        BackendError { message: value.0 }
    }
}

/// The product of a backend: files to write, assets to copy, scripts to mark
/// executable, and directories to create. All paths are relative to the
/// output directory (copy sources relative to the asset directory). Ordered
/// collections keep project emission deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectFiles {
    files: BTreeMap<String, String>,
    copies: BTreeMap<String, String>,
    executables: BTreeSet<String>,
    dirs: BTreeSet<String>,
}

impl ProjectFiles {
    pub fn write(&mut self, path: &str, content: String) {
        self.files.insert(path.to_owned(), content);
    }

    pub fn copy(&mut self, asset_path: &str, output_path: &str) {
        self.copies
            .insert(output_path.to_owned(), asset_path.to_owned());
    }

    pub fn make_executable(&mut self, path: &str) {
        self.executables.insert(path.to_owned());
    }

    pub fn create_dir(&mut self, path: &str) {
        self.dirs.insert(path.to_owned());
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files
            .iter()
            .map(|(path, content)| (path.as_str(), content.as_str()))
    }

    /// `(output path, asset path)` pairs.
    pub fn copies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.copies
            .iter()
            .map(|(output, asset)| (output.as_str(), asset.as_str()))
    }

    pub fn executables(&self) -> impl Iterator<Item = &str> {
        self.executables.iter().map(String::as_str)
    }

    pub fn dirs(&self) -> impl Iterator<Item = &str> {
        self.dirs.iter().map(String::as_str)
    }

    pub fn file(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }
}

pub trait Backend {
    fn generate(&self, script: &Script, ctx: &BackendContext)
        -> Result<ProjectFiles, BackendError>;
}

/// Look up a backend by its CLI name.
pub fn backend_for(name: &str) -> Option<Box<dyn Backend>> {
    match name {
        "c" => Some(Box::new(CBackend)),
        "flame" => Some(Box::new(FlameBackend)),
        "flamegpu" => Some(Box::new(FlameGPUBackend)),
        "mason" => Some(Box::new(MasonBackend)),
        "dmason" => Some(Box::new(DMasonBackend)),
        _ => None,
    }
}
