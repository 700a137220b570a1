//! # Cli
//!
//! This module contains everything needed for parsing the CLI arguments for
//! ablc.

use clap::{Parser, ValueEnum};

/// Struct containing the CLI configuration for ablc.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Input file.
    #[arg(short, long)]
    pub input: Option<std::path::PathBuf>,

    /// Output directory.
    #[arg(short, long)]
    pub output_dir: Option<std::path::PathBuf>,

    /// Backend (c, flame, flamegpu, mason, dmason).
    #[arg(short, long, default_value = "c")]
    pub backend: String,

    /// Asset directory.
    #[arg(short = 'A', long, default_value = "./asset")]
    pub asset_dir: std::path::PathBuf,

    /// Compile-time parameter override (key=value). Repeatable.
    #[arg(short = 'P', long = "param")]
    pub params: Vec<String>,

    /// Parse and analyze only; do not generate code.
    #[arg(long)]
    pub lint_only: bool,

    /// Run ./build.sh in the output directory after generating.
    #[arg(short = 'B', long)]
    pub build: bool,

    /// Specify the log level of the compiler.
    #[arg(value_enum, short, long, default_value_t = LogLevel::default())]
    pub verbosity: LogLevel,
}

/// Enum for specifying the log level of ablc.
#[derive(ValueEnum, Clone, Default, Debug)]
pub enum LogLevel {
    /// The default log level. Only critical errors will be logged.
    #[default]
    #[value(alias("0"))]
    Error,

    /// Also log warnings.
    #[value(alias("1"))]
    Warn,

    /// Also log which files are generated.
    #[value(alias("2"))]
    Info,

    /// Log everything which happens internally in the compiler.
    #[value(alias("3"))]
    Debug,

    /// Log extra information.
    #[value(alias("4"))]
    Trace,
}

impl From<&LogLevel> for log::Level {
    fn from(value: &LogLevel) -> Self {
        match value {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}
