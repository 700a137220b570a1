use std::{error::Error, fmt::Display};

use crate::lexer::Span;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisError {
    pub message: String,
    pub span: Span,
}

impl Display for AnalysisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} on line {}", self.message, self.span.line())
    }
}

impl Error for AnalysisError {}

/// Sink for analysis diagnostics. Analysis keeps going past recoverable
/// errors; the driver refuses code generation when any were reported.
#[derive(Debug, Clone, Default)]
pub struct ErrorStream {
    errors: Vec<AnalysisError>,
}

impl ErrorStream {
    pub fn report(&mut self, message: impl Into<String>, span: Span) {
        self.errors.push(AnalysisError {
            message: message.into(),
            span,
        });
    }

    pub fn push(&mut self, error: AnalysisError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnalysisError> {
        self.errors.iter()
    }
}
