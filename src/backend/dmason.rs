//! D-MASON backend.
//!
//! A distributed variant of the MASON emission: the same per-agent classes,
//! a `Sim` built on the distributed field, and a run script that carries
//! the region topology. The topology itself must be supplied via
//! `-P dmason.rows=R -P dmason.cols=C`.
use crate::parser::ast::Script;

use super::mason::{emit_mason_project, MasonFlavor};
use super::{Backend, BackendContext, BackendError, NotSupportedError, ProjectFiles};

pub struct DMasonBackend;

impl Backend for DMasonBackend {
    fn generate(
        &self,
        script: &Script,
        ctx: &BackendContext,
    ) -> Result<ProjectFiles, BackendError> {
        if ctx.config.get_bool("use_float", false) {
            return Err(NotSupportedError(
                "Floats are not supported by the DMason backend".to_owned(),
            )
            .into());
        }

        let mut files = ProjectFiles::default();
        emit_mason_project(script, ctx, MasonFlavor::DMason, &mut files)?;
        Ok(files)
    }
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

    fn analyzed() -> Script {
        let tokens = Lexer::new(
            "environment { max: [10, 10], granularity: 1 }\n\
             agent Bird { position vec2 pos; }\n\
             step idle(Bird b in, Bird b2 out) {}\n\
             simulate 10 { idle }",
        )
        .lex()
        .expect("should lex");
        let mut script = parser::parse(tokens).expect("should parse");

        let mut builtins = BuiltinFunctions::default();
        register_builtin_functions(&mut builtins);
        let mut errors = ErrorStream::default();
        analyze(&mut script, &builtins, &Params::default(), &mut errors);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        script
    }

    #[test]
    fn test_requires_topology() {
        let script = analyzed();
        let ctx = BackendContext::new(Config::default());
        let err = DMasonBackend.generate(&script, &ctx).unwrap_err();
        assert!(err.message.contains("topology"));
    }

    #[test]
    fn test_emits_distributed_sim() {
        let script = analyzed();
        let mut values = HashMap::new();
        values.insert("dmason.rows".to_owned(), "2".to_owned());
        values.insert("dmason.cols".to_owned(), "3".to_owned());
        let ctx = BackendContext::new(Config::new(values));
        let files = DMasonBackend
            .generate(&script, &ctx)
            .expect("should generate");

        let sim = files.file("Sim.java").expect("sim class");
        assert!(sim.contains("public class Sim extends DistributedState {"));
        assert!(sim.contains("public static final int ROWS = 2;"));
        assert!(sim.contains("public static final int COLS = 3;"));
        assert!(sim.contains("DContinuous2D"));
        assert!(files.file("Bird.java").is_some());
    }
}
