//! Configuration compiler core.
//!
//! Raw config tree → per-component schema validation (with identifier
//! allocation) → dependency resolution → priority-scheduled, suspendable
//! generation jobs → ordered emission sequence + build metadata.
pub mod config;
pub mod error;
pub mod ids;
pub mod schema;
pub mod resolve;
pub mod ir;
pub mod graph;
pub mod build;
pub mod component;
pub mod scheduler;
pub mod run;
pub mod catalog;
pub mod path_de;

pub use component::{Catalog, ComponentSpec, Fragment};
pub use config::{ConfigNode, KeyPath};
pub use error::{CompileError, Diagnostic, ErrorKind};
pub use ids::{IdRegistry, Identifier, TypeTable, TypeTag};
pub use ir::{Emission, Expr, Op};
pub use run::{CompilationRun, CompileOptions, Output};
pub use schema::{Schema, Validator};
pub use scheduler::{GenerationJob, JobContext, JobStatus, StagedJob};
