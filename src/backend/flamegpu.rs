//! FLAME GPU backend.
//!
//! Shares the model derivation with the CPU FLAME target and emits the
//! XMMLGPU model file: spatially partitioned message lists whose bounds are
//! snapped up to a multiple of the partitioning radius, per-agent default
//! states (unique across agents), and one layer per agent function.
//! Floating point constants are serialized with the minimum precision that
//! round-trips to the exact double.
use crate::parser::ast::{EnvironmentBounds, Script};

use super::c::CPrinter;
use super::flame::{build_runner_script, FlameDialect, FlameFuncPrinter};
use super::flame_model::{unpack_agent_members, unpack_members, FlameModel};
use super::{
    Backend, BackendContext, BackendError, ProjectFiles, XmlElem, XmlWriter,
};

pub struct FlameGPUBackend;

impl Backend for FlameGPUBackend {
    fn generate(
        &self,
        script: &Script,
        ctx: &BackendContext,
    ) -> Result<ProjectFiles, BackendError> {
        let use_float = ctx.config.get_bool("use_float", false);
        let buffer_size = ctx.config.get_int("flamegpu.buffer_size", 1024);

        let model = FlameModel::from_script(script);

        let mut files = ProjectFiles::default();
        files.create_dir("model");
        files.create_dir("dynamic");
        files.create_dir("iterations");

        files.write(
            "model/XMLModelFile.xml",
            create_xml_model(script, &model, use_float, buffer_size)?,
        );

        let mut printer = FlameFuncPrinter::new(script, &model, FlameDialect::Gpu, use_float);
        printer.print_functions_file();
        files.write("model/functions.c", printer.extract());

        let mut runner = CPrinter::new_runner(script);
        runner.print_script();
        files.write("runner.c", runner.extract());
        files.write("build_runner.sh", build_runner_script(use_float));

        files.copy("flamegpu/libabl_flamegpu.h", "model/libabl_flamegpu.h");
        files.copy("flamegpu/Makefile", "Makefile");
        files.copy("flamegpu/build.sh", "build.sh");
        files.copy("flamegpu/run.sh", "run.sh");
        files.copy("c/libabl.h", "libabl.h");
        files.copy("c/libabl.c", "libabl.c");

        files.make_executable("build.sh");
        files.make_executable("build_runner.sh");
        files.make_executable("run.sh");
        Ok(files)
    }
}

/// Serialize a double with the minimum precision that parses back to the
/// exact same value.
pub fn double_to_string(value: f64) -> String {
    for precision in 6..=17 {
        let text = format_precision(value, precision);
        if text.parse::<f64>() == Ok(value) {
            return text;
        }
    }
    format!("{value}")
}

/// `%g`-style formatting with the given number of significant digits.
fn format_precision(value: f64, precision: usize) -> String {
    if value == 0.0 {
        return "0".to_owned();
    }

    let exp = value.abs().log10().floor() as i32;
    if exp >= -4 && exp < precision as i32 {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        trim_trailing_zeros(format!("{value:.decimals$}"))
    } else {
        let decimals = precision - 1;
        let text = format!("{value:.decimals$e}");
        match text.split_once('e') {
            Some((mantissa, exponent)) => {
                format!("{}e{exponent}", trim_trailing_zeros(mantissa.to_owned()))
            }
            None => text,
        }
    }
}

fn trim_trailing_zeros(text: String) -> String {
    if !text.contains('.') {
        return text;
    }
    let text = text.trim_end_matches('0');
    text.trim_end_matches('.').to_owned()
}

fn round_to_multiple(size: f64, radius: f64) -> f64 {
    (size / radius).ceil() * radius
}

/// Environment bounds adjusted to FLAME GPU requirements: every extent a
/// multiple of the radius, and a z extent of at least one radius even for
/// 2D simulations.
fn snapped_bounds(bounds: &EnvironmentBounds) -> ([f64; 3], [f64; 3], f64) {
    let radius = bounds.granularity;
    let min = bounds.min;
    let size = bounds.size;
    let max = [
        round_to_multiple(size[0], radius) + min[0],
        round_to_multiple(size[1], radius) + min[1],
        if size[2] != 0.0 {
            round_to_multiple(size[2], radius) + min[2]
        } else {
            radius
        },
    ];
    (min, max, radius)
}

fn create_xml_agents(
    script: &Script,
    model: &FlameModel,
    use_float: bool,
    buffer_size: i64,
) -> XmlElem {
    let mut xagents = XmlElem::new("xagents", vec![]);
    for agent in script.agents() {
        let mut memory = XmlElem::new("memory", vec![]);
        for (name, ty) in unpack_agent_members(agent, use_float) {
            memory.push(XmlElem::new(
                "gpu:variable",
                vec![XmlElem::text("type", ty), XmlElem::text("name", name)],
            ));
        }

        // FLAME GPU requires state names to be unique across agents.
        let default_state = format!("{}_default", agent.name);

        let mut functions = XmlElem::new("functions", vec![]);
        for func in &model.funcs {
            if func.agent != agent.name {
                continue;
            }

            let mut elems = vec![
                XmlElem::text("name", func.name.clone()),
                XmlElem::text("currentState", default_state.clone()),
                XmlElem::text("nextState", default_state.clone()),
            ];

            // FLAME GPU does not allow <inputs> and <outputs> to be empty.
            if let Some(msg) = &func.in_msg {
                elems.push(XmlElem::new(
                    "inputs",
                    vec![XmlElem::new(
                        "gpu:input",
                        vec![XmlElem::text("messageName", msg.clone())],
                    )],
                ));
            }
            if let Some(msg) = &func.out_msg {
                elems.push(XmlElem::new(
                    "outputs",
                    vec![XmlElem::new(
                        "gpu:output",
                        vec![
                            XmlElem::text("messageName", msg.clone()),
                            XmlElem::text("gpu:type", "single_message"),
                        ],
                    )],
                ));
            }

            if let Some(added) = &func.added_agent {
                elems.push(XmlElem::new(
                    "xagentOutputs",
                    vec![XmlElem::new(
                        "gpu:xagentOutput",
                        vec![
                            XmlElem::text("xagentName", added.clone()),
                            XmlElem::text("state", format!("{added}_default")),
                        ],
                    )],
                ));
            }

            // Order matters to FLAME GPU: these must come after inputs and
            // outputs.
            elems.push(XmlElem::text("gpu:reallocate", "false"));
            elems.push(XmlElem::text(
                "gpu:RNG",
                if func.uses_rng { "true" } else { "false" },
            ));

            functions.push(XmlElem::new("gpu:function", elems));
        }

        xagents.push(XmlElem::new(
            "gpu:xagent",
            vec![
                XmlElem::text("name", agent.name.clone()),
                memory,
                functions,
                XmlElem::new(
                    "states",
                    vec![
                        XmlElem::new(
                            "gpu:state",
                            vec![XmlElem::text("name", default_state.clone())],
                        ),
                        XmlElem::text("initialState", default_state),
                    ],
                ),
                XmlElem::text("gpu:type", "continuous"),
                XmlElem::text("gpu:bufferSize", buffer_size.to_string()),
            ],
        ));
    }
    xagents
}

fn create_xml_messages(
    script: &Script,
    model: &FlameModel,
    use_float: bool,
    buffer_size: i64,
) -> Result<XmlElem, BackendError> {
    let mut messages = XmlElem::new("messages", vec![]);

    let bounds = script
        .environment()
        .and_then(|env| env.bounds)
        .ok_or_else(|| BackendError::new("environment bounds are not resolved"))?;
    let (min, max, radius) = snapped_bounds(&bounds);

    for msg in &model.messages {
        let mut variables = XmlElem::new("variables", vec![]);
        for (name, ty) in unpack_members(&msg.members, use_float) {
            variables.push(XmlElem::new(
                "gpu:variable",
                vec![XmlElem::text("type", ty), XmlElem::text("name", name)],
            ));
        }

        let partitioning = XmlElem::new(
            "gpu:partitioningSpatial",
            vec![
                XmlElem::text("gpu:radius", double_to_string(radius)),
                XmlElem::text("gpu:xmin", double_to_string(min[0])),
                XmlElem::text("gpu:xmax", double_to_string(max[0])),
                XmlElem::text("gpu:ymin", double_to_string(min[1])),
                XmlElem::text("gpu:ymax", double_to_string(max[1])),
                XmlElem::text("gpu:zmin", double_to_string(min[2])),
                XmlElem::text("gpu:zmax", double_to_string(max[2])),
            ],
        );

        messages.push(XmlElem::new(
            "gpu:message",
            vec![
                XmlElem::text("name", msg.name.clone()),
                variables,
                partitioning,
                XmlElem::text("gpu:bufferSize", buffer_size.to_string()),
            ],
        ));
    }
    Ok(messages)
}

fn create_xml_layers(model: &FlameModel) -> XmlElem {
    let mut layers = XmlElem::new("layers", vec![]);
    for func in &model.funcs {
        layers.push(XmlElem::new(
            "layer",
            vec![XmlElem::new(
                "gpu:layerFunction",
                vec![XmlElem::text("name", func.name.clone())],
            )],
        ));
    }
    layers
}

fn create_xml_model(
    script: &Script,
    model: &FlameModel,
    use_float: bool,
    buffer_size: i64,
) -> Result<String, BackendError> {
    let mut root = XmlElem::new(
        "gpu:xmodel",
        vec![
            XmlElem::text("name", "model"),
            XmlElem::new(
                "gpu:environment",
                vec![XmlElem::new(
                    "gpu:functionFiles",
                    vec![XmlElem::text("file", "functions.c")],
                )],
            ),
            create_xml_agents(script, model, use_float, buffer_size),
            create_xml_messages(script, model, use_float, buffer_size)?,
            create_xml_layers(model),
        ],
    );
    root.set_attr("xmlns:gpu", "http://www.dcs.shef.ac.uk/~paul/XMMLGPU");
    root.set_attr("xmlns", "http://www.dcs.shef.ac.uk/~paul/XMML");
    Ok(XmlWriter::new().serialize(&root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{
        analyze, register_builtin_functions, BuiltinFunctions, ErrorStream, Params,
    };
    use crate::backend::Config;
    use crate::lexer::Lexer;
    use crate::parser;
    use std::collections::HashMap;

    fn generate_with(source: &str, params: &[(&str, &str)]) -> ProjectFiles {
        let tokens = Lexer::new(source).lex().expect("should lex");
        let mut script = parser::parse(tokens).expect("should parse");

        let mut builtins = BuiltinFunctions::default();
        register_builtin_functions(&mut builtins);
        let mut errors = ErrorStream::default();
        analyze(&mut script, &builtins, &Params::default(), &mut errors);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);

        let values: HashMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let ctx = BackendContext::new(Config::new(values));
        FlameGPUBackend
            .generate(&script, &ctx)
            .expect("should generate")
    }

    fn generate(source: &str) -> ProjectFiles {
        generate_with(source, &[])
    }

    const SOURCE: &str = "environment { max: [10, 10], granularity: 3 }\n\
        agent Bird { position vec2 pos; float heat; }\n\
        step warm(Bird b in, Bird b2 out) {\n\
          float sum = random(0.0, 0.1);\n\
          for (Bird other : near(b, 2.0)) {\n\
            sum += other.heat;\n\
          }\n\
          b2.heat = sum;\n\
        }\n\
        simulate 10 { warm }";

    #[test]
    fn test_round_trip_float_formatting() {
        assert_eq!(double_to_string(0.1), "0.1");
        assert_eq!(double_to_string(0.0), "0");
        assert_eq!(double_to_string(12.0), "12");
        assert_eq!(double_to_string(1e-7), "1e-7");

        for value in [
            0.1,
            1.0 / 3.0,
            2.0_f64.sqrt(),
            123456.789,
            1e-12,
            6.02214076e23,
            -0.25,
        ] {
            let text = double_to_string(value);
            assert_eq!(text.parse::<f64>(), Ok(value), "failed for {value}");
        }
    }

    #[test]
    fn test_namespaces() {
        let files = generate(SOURCE);
        let xml = files.file("model/XMLModelFile.xml").expect("model file");
        assert!(xml.contains("xmlns:gpu=\"http://www.dcs.shef.ac.uk/~paul/XMMLGPU\""));
        assert!(xml.contains("xmlns=\"http://www.dcs.shef.ac.uk/~paul/XMML\""));
    }

    #[test]
    fn test_bounds_snap_to_radius_multiple() {
        let files = generate(SOURCE);
        let xml = files.file("model/XMLModelFile.xml").expect("model file");
        // size 10 with radius 3 snaps up to 12; the 2D z extent becomes one
        // radius.
        assert!(xml.contains("<gpu:radius>3</gpu:radius>"));
        assert!(xml.contains("<gpu:xmax>12</gpu:xmax>"));
        assert!(xml.contains("<gpu:ymax>12</gpu:ymax>"));
        assert!(xml.contains("<gpu:zmin>0</gpu:zmin>"));
        assert!(xml.contains("<gpu:zmax>3</gpu:zmax>"));
    }

    #[test]
    fn test_unique_default_states() {
        let files = generate(SOURCE);
        let xml = files.file("model/XMLModelFile.xml").expect("model file");
        assert!(xml.contains("<name>Bird_default</name>"));
        assert!(xml.contains("<initialState>Bird_default</initialState>"));
        assert!(xml.contains("<currentState>Bird_default</currentState>"));
    }

    #[test]
    fn test_rng_flag_follows_recursive_usage() {
        let files = generate(SOURCE);
        let xml = files.file("model/XMLModelFile.xml").expect("model file");
        // The update half uses random; the publish half does not.
        assert!(xml.contains("<gpu:RNG>true</gpu:RNG>"));
        assert!(xml.contains("<gpu:RNG>false</gpu:RNG>"));
        assert!(xml.contains("<gpu:reallocate>false</gpu:reallocate>"));
    }

    #[test]
    fn test_buffer_size_is_configurable() {
        let files = generate(SOURCE);
        assert!(files
            .file("model/XMLModelFile.xml")
            .expect("model file")
            .contains("<gpu:bufferSize>1024</gpu:bufferSize>"));

        let files = generate_with(SOURCE, &[("flamegpu.buffer_size", "4096")]);
        assert!(files
            .file("model/XMLModelFile.xml")
            .expect("model file")
            .contains("<gpu:bufferSize>4096</gpu:bufferSize>"));
    }

    #[test]
    fn test_layers_wrap_each_function() {
        let files = generate(SOURCE);
        let xml = files.file("model/XMLModelFile.xml").expect("model file");
        let publish = xml.find("<gpu:layerFunction>").expect("layer");
        let rest = &xml[publish..];
        assert!(rest.contains("<name>warm_publish</name>"));
        assert!(rest.contains("<name>warm</name>"));
    }

    #[test]
    fn test_gpu_functions_file() {
        let files = generate(SOURCE);
        let functions = files.file("model/functions.c").expect("functions file");
        assert!(functions.contains(
            "__FLAME_GPU_FUNC__ int warm_publish(xmachine_memory_Bird* agent, xmachine_message_warm_message_list* warm_message_messages)"
        ));
        assert!(functions.contains("add_warm_message_message(warm_message_messages, agent->pos_x, agent->pos_y, agent->heat);"));
        assert!(functions.contains("RNG_rand48* rand48"));
        assert!(functions.contains("random_float(rand48, 0.0, 0.1)"));
        assert!(functions.contains("agent->heat = sum;"));
    }
}
