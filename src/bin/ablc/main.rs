//! # ablc
//!
//! This binary is the ABL compiler. It combines lexer, parser, analysis,
//! backend code generation, and project emission into a single application.
mod cli;

use std::{collections::HashMap, fs, process::Command, process::exit};

use clap::error::ErrorKind;
use clap::Parser;
use log::info;

use abl::analysis::{self, register_builtin_functions, BuiltinFunctions, ErrorStream};
use abl::backend::{backend_for, BackendContext, Config};
use abl::emitter::emit_project;
use abl::lexer::Lexer;
use abl::parser;

use cli::Cli;

fn main() {
    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(error)
            if matches!(
                error.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) =>
        {
            print!("{error}");
            exit(0);
        }
        Err(error) => {
            eprintln!("{error}");
            exit(1);
        }
    };

    simple_logger::init_with_level((&args.verbosity).into()).unwrap();

    let Some(input) = &args.input else {
        eprintln!("Missing input file (-i or --input)");
        exit(1);
    };

    let mut params: HashMap<String, String> = HashMap::new();
    for param in &args.params {
        let Some((key, value)) = param.split_once('=') else {
            eprintln!("Malformed parameter: Missing \"=\"");
            exit(1);
        };
        params.insert(key.to_owned(), value.to_owned());
    }

    let source = match fs::read_to_string(input) {
        Ok(source) => source,
        Err(_) => {
            eprintln!("File \"{}\" could not be opened.", input.display());
            exit(1);
        }
    };

    let tokens = match Lexer::new(&source).lex() {
        Ok(tokens) => tokens,
        Err(error) => {
            eprintln!("{error}");
            exit(1);
        }
    };

    let mut script = match parser::parse(tokens) {
        Ok(script) => script,
        Err(error) => {
            eprintln!("{error}");
            exit(1);
        }
    };

    let mut builtins = BuiltinFunctions::default();
    register_builtin_functions(&mut builtins);

    let mut errors = ErrorStream::default();
    analysis::analyze(&mut script, &builtins, &params, &mut errors);
    if !errors.is_empty() {
        for error in errors.iter() {
            eprintln!("{error}");
        }
        exit(1);
    }

    if args.lint_only {
        // Linting only, don't try to generate output.
        exit(0);
    }

    let Some(output_dir) = &args.output_dir else {
        eprintln!("Missing output directory (-o or --output-dir)");
        exit(1);
    };

    let Some(backend) = backend_for(&args.backend) else {
        eprintln!("Unknown backend \"{}\"", args.backend);
        exit(1);
    };

    if !args.asset_dir.is_dir() {
        eprintln!(
            "Asset directory \"{}\" does not exist (override with -A or --asset-dir)",
            args.asset_dir.display()
        );
        exit(1);
    }

    let ctx = BackendContext::new(Config::new(params));
    let files = match backend.generate(&script, &ctx) {
        Ok(files) => files,
        Err(error) => {
            eprintln!("{error}");
            exit(1);
        }
    };

    if let Err(error) = emit_project(&files, output_dir, &args.asset_dir) {
        eprintln!("{error}");
        exit(1);
    }
    info!("generated project in {}", output_dir.display());

    if args.build {
        if !output_dir.join("build.sh").is_file() {
            eprintln!("Build file for this backend not found");
            exit(1);
        }

        let status = Command::new("./build.sh").current_dir(output_dir).status();
        if !status.map(|status| status.success()).unwrap_or(false) {
            eprintln!("Build failed");
            exit(1);
        }
    }
}
