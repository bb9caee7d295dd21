//! Structured diagnostics shared by every phase of a compilation run.
//!
//! Nothing here prints: the caller gets a `Vec<Diagnostic>` (or a
//! [`CompileError`] that flattens into one) and decides how to report it.
use std::fmt;

use serde::Serialize;

use crate::config::KeyPath;
use crate::resolve::CycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Missing key, wrong type, failed coercion, unknown key or component.
    SchemaViolation,
    /// `exactly_one_of` / `at_least_one_of` failed after every key passed.
    ConstraintViolation,
    IdentifierCollision,
    UnresolvedReference,
    DependencyCycle,
    SchedulingDeadlock,
    /// A generation job reported its own failure (I/O, bad fragment shape).
    GenerationFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::SchemaViolation => "schema violation",
            ErrorKind::ConstraintViolation => "constraint violation",
            ErrorKind::IdentifierCollision => "identifier collision",
            ErrorKind::UnresolvedReference => "unresolved reference",
            ErrorKind::DependencyCycle => "dependency cycle",
            ErrorKind::SchedulingDeadlock => "scheduling deadlock",
            ErrorKind::GenerationFailure => "generation failure",
        };
        f.write_str(s)
    }
}

/// One actionable problem: what went wrong, in which component instance, at which key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{kind}: {component}{path}: {message}")]
pub struct Diagnostic {
    pub kind: ErrorKind,
    /// Component instance path, e.g. `stepper[0]`.
    pub component: String,
    pub path: KeyPath,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(
        kind: ErrorKind,
        component: impl Into<String>,
        path: KeyPath,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            component: component.into(),
            path,
            identifier: None,
            message: message.into(),
        }
    }

    pub fn with_identifier(mut self, name: impl Into<String>) -> Self {
        self.identifier = Some(name.into());
        self
    }
}

/// A job that was still suspended when the scheduler ran out of runnable work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitingJob {
    pub job: String,
    pub awaiting: String,
}

fn fmt_waits(waits: &[WaitingJob]) -> String {
    waits
        .iter()
        .map(|w| format!("{} waits on `{}`", w.job, w.awaiting))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("invalid configuration: {} problem(s) found", .0.len())]
    Invalid(Vec<Diagnostic>),
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error("code generation made no progress: {}", fmt_waits(.0))]
    Deadlock(Vec<WaitingJob>),
    #[error("code generation failed: {} problem(s) found", .0.len())]
    Generation(Vec<Diagnostic>),
}

impl CompileError {
    /// Flatten into the structured list handed to a reporting layer.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        match self {
            CompileError::Invalid(xs) | CompileError::Generation(xs) => xs.clone(),
            CompileError::Cycle(cycle) => vec![Diagnostic::new(
                ErrorKind::DependencyCycle,
                cycle.path.first().cloned().unwrap_or_default(),
                KeyPath::root(),
                cycle.to_string(),
            )],
            CompileError::Deadlock(waits) => waits
                .iter()
                .map(|w| {
                    Diagnostic::new(
                        ErrorKind::SchedulingDeadlock,
                        w.job.clone(),
                        KeyPath::root(),
                        format!("waiting on `{}`, which no runnable job can produce", w.awaiting),
                    )
                    .with_identifier(w.awaiting.clone())
                })
                .collect(),
        }
    }

    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        self.diagnostics().iter().any(|d| d.kind == kind)
    }
}
