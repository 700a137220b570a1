//! End-to-end compilation scenarios, driving the same pipeline as the
//! `ablc` binary: lex, parse, analyze, generate, emit.
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use abl::analysis::{self, register_builtin_functions, BuiltinFunctions, ErrorStream, Params};
use abl::backend::{backend_for, BackendContext, Config, ProjectFiles};
use abl::emitter::emit_project;
use abl::lexer::Lexer;
use abl::parser;

const MINIMAL: &str = "environment { min: [0, 0], max: [10, 10], granularity: 1 }\n\
                       agent A { position vec2 p; }\n\
                       step f(A a in, A a out) {}\n\
                       simulate 0 { f }";

fn analyze_source(source: &str, params: Params) -> Result<abl::parser::ast::Script, Vec<String>> {
    let tokens = Lexer::new(source).lex().map_err(|e| vec![e.to_string()])?;
    let mut script = parser::parse(tokens).map_err(|e| vec![e.to_string()])?;

    let mut builtins = BuiltinFunctions::default();
    register_builtin_functions(&mut builtins);

    let mut errors = ErrorStream::default();
    analysis::analyze(&mut script, &builtins, &params, &mut errors);
    if !errors.is_empty() {
        return Err(errors.iter().map(|e| e.to_string()).collect());
    }
    Ok(script)
}

fn compile(
    source: &str,
    backend_name: &str,
    params: &[(&str, &str)],
) -> Result<ProjectFiles, Vec<String>> {
    let params: Params = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let script = analyze_source(source, params.clone())?;

    let backend = backend_for(backend_name).expect("known backend");
    let ctx = BackendContext::new(Config::new(HashMap::from_iter(params)));
    backend
        .generate(&script, &ctx)
        .map_err(|e| vec![e.to_string()])
}

#[test]
fn minimum_valid_script_on_c() {
    let files = compile(MINIMAL, "c", &[]).expect("should compile");
    let main_c = files.file("main.c").expect("main.c");
    assert!(main_c.contains("for (int _t = 0; _t < 0; _t++) {"));
    assert!(main_c.contains("run_step_f();"));
    assert!(files.file("build.sh").is_some());
    assert!(files.file("run.sh").is_some());
}

#[test]
fn const_folding_reaches_the_generated_loop() {
    let files = compile(
        "environment { min: [0, 0], max: [10, 10], granularity: 1 }\n\
         agent A { position vec2 p; }\n\
         const N = 2 * 3 + 4;\n\
         step f(A a in, A a out) {}\n\
         simulate N { f }",
        "c",
        &[],
    )
    .expect("should compile");
    assert!(files
        .file("main.c")
        .expect("main.c")
        .contains("for (int _t = 0; _t < 10; _t++) {"));
}

#[test]
fn float_constants_round_trip_in_flamegpu_xml() {
    let files = compile(
        "environment { min: [0, 0], max: [10, 10], granularity: 0.1 }\n\
         agent A { position vec2 p; float h; }\n\
         step f(A a in, A b out) {\n\
           float s = 0.0;\n\
           for (A n : near(a, 0.1)) { s += n.h; }\n\
           b.h = s;\n\
         }\n\
         simulate 1 { f }",
        "flamegpu",
        &[],
    )
    .expect("should compile");
    let xml = files.file("model/XMLModelFile.xml").expect("model file");
    // Precision 6 already round-trips 0.1.
    assert!(xml.contains("<gpu:radius>0.1</gpu:radius>"));
}

#[test]
fn mason_rejects_floats() {
    let errors = compile(MINIMAL, "mason", &[("use_float", "true")]).unwrap_err();
    assert!(errors
        .iter()
        .any(|error| error.contains("Floats are not supported")));
}

#[test]
fn near_outside_parfor_is_reported_with_its_line() {
    let errors = analyze_source(
        "environment { min: [0, 0], max: [10, 10], granularity: 1 }\n\
         agent A { position vec2 p; }\n\
         step f(A a in, A a out) {}\n\
         function main() {\n\
           A self = A { p: [1.0, 1.0] };\n\
           for (A n : near(self, 1.0)) {}\n\
           simulate 1 { f }\n\
         }",
        Params::default(),
    )
    .unwrap_err();
    assert!(errors
        .iter()
        .any(|error| error.contains("near()") && error.contains("on line 6")));
}

#[test]
fn overload_selection_picks_the_matching_vector_width() {
    let source = "environment { min: [0, 0], max: [10, 10], granularity: 1 }\n\
                  agent A { position vec2 p; }\n\
                  function helper() : float {\n\
                    vec2 a = [1.0, 2.0];\n\
                    vec3 b = [1.0, 2.0, 3.0];\n\
                    return dot(a, a) + dot(b, b);\n\
                  }\n\
                  step f(A a in, A a out) {}\n\
                  simulate 1 { f }";
    let files = compile(source, "c", &[]).expect("should compile");
    let main_c = files.file("main.c").expect("main.c");
    assert!(main_c.contains("dot_float2(a, a)"));
    assert!(main_c.contains("dot_float3(b, b)"));
}

#[test]
fn mixed_overload_fails_with_no_matching_overload() {
    let errors = analyze_source(
        "environment { min: [0, 0], max: [10, 10], granularity: 1 }\n\
         agent A { position vec2 p; }\n\
         function helper() : float {\n\
           vec2 a = [1.0, 2.0];\n\
           vec3 b = [1.0, 2.0, 3.0];\n\
           return dot(a, b);\n\
         }\n\
         step f(A a in, A a out) {}\n\
         simulate 1 { f }",
        Params::default(),
    )
    .unwrap_err();
    assert!(errors
        .iter()
        .any(|error| error.contains("no matching overload")));
}

#[test]
fn lint_only_pipeline_accepts_minimal_script() {
    analyze_source(MINIMAL, Params::default()).expect("should analyze cleanly");
}

#[test]
fn emitted_project_is_byte_identical_across_runs() {
    let stamp = std::process::id();
    let assets = PathBuf::from(std::env::temp_dir()).join(format!("abl-e2e-assets-{stamp}"));
    let out = PathBuf::from(std::env::temp_dir()).join(format!("abl-e2e-out-{stamp}"));
    let _ = fs::remove_dir_all(&assets);
    let _ = fs::remove_dir_all(&out);
    fs::create_dir_all(assets.join("c")).unwrap();
    fs::write(assets.join("c/libabl.h"), "/* libabl */\n").unwrap();
    fs::write(assets.join("c/libabl.c"), "/* libabl impl */\n").unwrap();

    let files = compile(MINIMAL, "c", &[]).expect("should compile");
    emit_project(&files, &out, &assets).expect("should emit");
    let first = fs::read(out.join("main.c")).unwrap();

    let files_again = compile(MINIMAL, "c", &[]).expect("should compile again");
    assert_eq!(files, files_again);
    emit_project(&files_again, &out, &assets).expect("should emit again");
    let second = fs::read(out.join("main.c")).unwrap();
    assert_eq!(first, second);

    assert!(out.join("iterations").is_dir());
    assert!(out.join("libabl.h").is_file());

    let _ = fs::remove_dir_all(&assets);
    let _ = fs::remove_dir_all(&out);
}

#[test]
fn param_override_changes_step_count() {
    let files = compile(
        "environment { min: [0, 0], max: [10, 10], granularity: 1 }\n\
         agent A { position vec2 p; }\n\
         const N = 5;\n\
         step f(A a in, A a out) {}\n\
         simulate N { f }",
        "c",
        &[("N", "42")],
    )
    .expect("should compile");
    assert!(files
        .file("main.c")
        .expect("main.c")
        .contains("for (int _t = 0; _t < 42; _t++) {"));
}
