//! Priority-ordered, suspend/resume generation scheduler.
//!
//! Jobs are explicit task objects multiplexed on one thread. A job runs until
//! it needs an identifier that has no value in the [`ObjectGraph`] yet; it then
//! returns [`JobStatus::Waiting`] and is parked on that name. Every emission
//! that gives a name its value wakes the jobs parked on it, in the order they
//! suspended, and puts them back in the ready queue behind work of the same
//! priority that is already pending.
//!
//! Ready queue order: priority (higher first), then queue rank (lower first).
//! Ranks come from one monotonically increasing counter, so identical input
//! always yields an identical emission order.
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use indexmap::IndexMap;
use ordered_float::OrderedFloat;

use crate::build::{BuildInfo, Library};
use crate::config::KeyPath;
use crate::error::{CompileError, Diagnostic, ErrorKind, WaitingJob};
use crate::graph::{GraphError, ObjectGraph};
use crate::ids::{DeclSite, IdError, IdRegistry, Identifier, TypeTag};
use crate::ir::{Expr, Op};

/// Name of the imported application root.
pub const APP: &str = "App";

// ————————————————————————————————————————————————————————————————————————————
// JOBS
// ————————————————————————————————————————————————————————————————————————————

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Finished,
    /// Suspend until this identifier has a value.
    Waiting(String),
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Id(#[from] IdError),
    #[error("ID `{0}` was read before it had a value; await it first")]
    NotAwaited(String),
    #[error("ID `{0}` is not declared anywhere")]
    UnknownId(String),
    #[error("{key}: {message}")]
    Config { key: String, message: String },
    #[error("reading `{path}`: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("{0}")]
    Message(String),
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerationError::Id(IdError::Collision { .. }) => ErrorKind::IdentifierCollision,
            GenerationError::Id(_) | GenerationError::UnknownId(_) => ErrorKind::UnresolvedReference,
            _ => ErrorKind::GenerationFailure,
        }
    }

    fn identifier(&self) -> Option<&String> {
        match self {
            GenerationError::NotAwaited(n) | GenerationError::UnknownId(n) => Some(n),
            GenerationError::Graph(GraphError::Redeclared(n) | GraphError::NoValue(n)) => Some(n),
            GenerationError::Id(
                IdError::Collision { name, .. }
                | IdError::NotFound { name }
                | IdError::TypeMismatch { name, .. }
                | IdError::InvalidName { name, .. },
            ) => Some(name),
            _ => None,
        }
    }

    fn into_diagnostic(self, origin: &str) -> Diagnostic {
        let path = match &self {
            GenerationError::Config { key, .. } => KeyPath::root().key(key),
            _ => KeyPath::root(),
        };
        let ident = self.identifier().cloned();
        let d = Diagnostic::new(self.kind(), origin, path, self.to_string());
        match ident {
            Some(name) => d.with_identifier(name),
            None => d,
        }
    }
}

/// One suspendable unit of generation work.
pub trait GenerationJob {
    /// Shown in diagnostics, e.g. the component instance path.
    fn label(&self) -> &str;

    /// Run until finished or until an identifier without a value is needed.
    /// Progress made before suspending must be kept in `self`.
    fn resume(&mut self, cx: &mut JobContext<'_>) -> Result<JobStatus, GenerationError>;
}

type Stage<S> = Box<dyn FnMut(&mut S, &mut JobContext<'_>) -> Result<(), GenerationError>>;

/// A job written as a list of stages over some local state `S`.
///
/// Each stage names the identifiers it reads; the job suspends in front of
/// the first stage whose identifiers are not all materialized and picks up
/// at that same stage when resumed.
pub struct StagedJob<S> {
    label: String,
    state: S,
    stages: Vec<(Vec<String>, Stage<S>)>,
    cursor: usize,
}

impl<S> StagedJob<S> {
    pub fn new(label: impl Into<String>, state: S) -> Self {
        Self { label: label.into(), state, stages: Vec::new(), cursor: 0 }
    }

    pub fn then<F>(self, stage: F) -> Self
    where
        F: FnMut(&mut S, &mut JobContext<'_>) -> Result<(), GenerationError> + 'static,
    {
        self.after(Vec::<String>::new(), stage)
    }

    pub fn after<I, N, F>(mut self, awaits: I, stage: F) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
        F: FnMut(&mut S, &mut JobContext<'_>) -> Result<(), GenerationError> + 'static,
    {
        self.stages.push((awaits.into_iter().map(Into::into).collect(), Box::new(stage)));
        self
    }

    pub fn boxed(self) -> Box<dyn GenerationJob>
    where
        S: 'static,
    {
        Box::new(self)
    }
}

impl<S> GenerationJob for StagedJob<S> {
    fn label(&self) -> &str { &self.label }

    fn resume(&mut self, cx: &mut JobContext<'_>) -> Result<JobStatus, GenerationError> {
        while let Some((awaits, stage)) = self.stages.get_mut(self.cursor) {
            if let Some(missing) = awaits.iter().find(|n| !cx.has_value(n)) {
                return Ok(JobStatus::Waiting(missing.clone()));
            }
            stage(&mut self.state, cx)?;
            self.cursor += 1;
        }
        Ok(JobStatus::Finished)
    }
}

// ————————————————————————————————————————————————————————————————————————————
// JOB CONTEXT
// ————————————————————————————————————————————————————————————————————————————

/// What a running job may touch: the shared registry, the object graph, and
/// the build metadata, all borrowed from the run for one resume step.
pub struct JobContext<'a> {
    graph: &'a mut ObjectGraph,
    registry: &'a mut IdRegistry,
    build: &'a mut BuildInfo,
    owner: usize,
    origin: &'a str,
    spawned: Vec<Box<dyn GenerationJob>>,
}

impl<'a> JobContext<'a> {
    pub fn has_value(&self, name: &str) -> bool { self.graph.has_value(name) }

    /// Declared identifier by name, whether or not it has a value yet.
    pub fn identifier(&self, name: &str) -> Result<Identifier, GenerationError> {
        self.registry
            .lookup(name)
            .map(|d| d.id.clone())
            .ok_or_else(|| GenerationError::UnknownId(name.to_string()))
    }

    /// Identifier that already has a value. Jobs await it before reading it.
    pub fn get_variable(&self, name: &str) -> Result<Identifier, GenerationError> {
        let id = self.identifier(name)?;
        if !self.graph.has_value(name) {
            return Err(GenerationError::NotAwaited(name.to_string()));
        }
        Ok(id)
    }

    pub fn app(&self) -> Result<Identifier, GenerationError> { self.get_variable(APP) }

    /// Declare an identifier at generation time, e.g. for embedded assets.
    pub fn declare(&mut self, name: Option<&str>, ty: &TypeTag) -> Result<Identifier, GenerationError> {
        let site = DeclSite { owner: self.owner, position: self.origin.to_string() };
        Ok(self.registry.declare(name, ty, site)?)
    }

    /// `T *id = new T(args);` with `T` the identifier's declared type.
    pub fn new_pvariable(&mut self, id: &Identifier, args: Vec<Expr>) -> Result<Identifier, GenerationError> {
        let ty = id.ty.clone();
        self.new_pvariable_as(id, &ty, args)
    }

    /// Like [`JobContext::new_pvariable`] but constructing a concrete subtype.
    pub fn new_pvariable_as(
        &mut self,
        id: &Identifier,
        ty: &TypeTag,
        args: Vec<Expr>,
    ) -> Result<Identifier, GenerationError> {
        self.graph.append(id, Op::New { ty: ty.clone(), args }, self.origin)?;
        Ok(id.clone())
    }

    pub fn variable(&mut self, id: &Identifier, value: Expr) -> Result<Identifier, GenerationError> {
        self.graph.append(id, Op::Let { ty: id.ty.clone(), value }, self.origin)?;
        Ok(id.clone())
    }

    pub fn progmem_array(&mut self, id: &Identifier, data: Vec<u8>) -> Result<Identifier, GenerationError> {
        self.graph.append(id, Op::Progmem { data }, self.origin)?;
        Ok(id.clone())
    }

    /// Configuration call against an identifier that has a value.
    pub fn add(&mut self, target: &Identifier, method: &str, args: Vec<Expr>) -> Result<(), GenerationError> {
        self.graph.append(target, Op::Call { method: method.to_string(), args }, self.origin)?;
        Ok(())
    }

    pub fn add_library(&mut self, name: &str, version: Option<&str>) {
        self.build.add_library(&Library::new(name, version));
    }

    pub fn add_build_flag(&mut self, flag: &str) { self.build.add_flag(flag); }

    /// Queue a follow-up job at this job's priority, behind pending work.
    pub fn spawn(&mut self, job: Box<dyn GenerationJob>) { self.spawned.push(job); }
}

// ————————————————————————————————————————————————————————————————————————————
// SCHEDULER
// ————————————————————————————————————————————————————————————————————————————

struct Task {
    job: Box<dyn GenerationJob>,
    priority: OrderedFloat<f64>,
    owner: usize,
    origin: String,
    resumes: usize,
}

#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: OrderedFloat<f64>,
    rank: u64,
    slot: usize,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then_with(|| other.rank.cmp(&self.rank))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

pub struct Scheduler {
    tasks: Vec<Option<Task>>,
    ready: BinaryHeap<Queued>,
    /// Awaited name → slots, in suspension order.
    parked: IndexMap<String, VecDeque<usize>>,
    next_rank: u64,
    resume_budget: usize,
    failures: Vec<Diagnostic>,
}

impl Scheduler {
    pub fn new(resume_budget: usize) -> Self {
        Self {
            tasks: Vec::new(),
            ready: BinaryHeap::new(),
            parked: IndexMap::new(),
            next_rank: 0,
            resume_budget,
            failures: Vec::new(),
        }
    }

    /// Queue a job. Jobs pushed earlier run earlier within one priority.
    pub fn push(&mut self, job: Box<dyn GenerationJob>, priority: f64, owner: usize) {
        let origin = job.label().to_string();
        let slot = self.tasks.len();
        self.tasks.push(Some(Task { job, priority: OrderedFloat(priority), owner, origin, resumes: 0 }));
        self.enqueue(slot);
    }

    fn enqueue(&mut self, slot: usize) {
        let Some(task) = self.tasks[slot].as_ref() else { return };
        let rank = self.next_rank;
        self.next_rank += 1;
        self.ready.push(Queued { priority: task.priority, rank, slot });
    }

    fn wake(&mut self, names: Vec<String>) {
        for name in names {
            if let Some(waiters) = self.parked.shift_remove(&name) {
                for slot in waiters {
                    tracing::trace!(job = ?self.tasks[slot].as_ref().map(|t| &t.origin), id = %name, "waking job");
                    self.enqueue(slot);
                }
            }
        }
    }

    /// Drain every job. Emissions land in `graph`, metadata in `build`.
    pub fn run(
        mut self,
        graph: &mut ObjectGraph,
        registry: &mut IdRegistry,
        build: &mut BuildInfo,
    ) -> Result<(), CompileError> {
        while let Some(Queued { slot, .. }) = self.ready.pop() {
            let Some(mut task) = self.tasks[slot].take() else { continue };
            task.resumes += 1;
            if task.resumes > self.resume_budget {
                self.failures.push(
                    GenerationError::Message(format!("job did not finish within {} resumes", self.resume_budget))
                        .into_diagnostic(&task.origin),
                );
                continue;
            }

            tracing::trace!(job = %task.origin, priority = %task.priority, "resuming job");
            let mut cx = JobContext {
                graph: &mut *graph,
                registry: &mut *registry,
                build: &mut *build,
                owner: task.owner,
                origin: &task.origin,
                spawned: Vec::new(),
            };
            let status = task.job.resume(&mut cx);
            let spawned = std::mem::take(&mut cx.spawned);

            for job in spawned {
                let (priority, owner) = (task.priority.0, task.owner);
                self.push(job, priority, owner);
            }
            let fresh = graph.take_materialized();

            match status {
                Ok(JobStatus::Finished) => {
                    tracing::trace!(job = %task.origin, "job finished");
                }
                Ok(JobStatus::Waiting(name)) => {
                    if registry.lookup(&name).is_none() {
                        self.failures.push(GenerationError::UnknownId(name).into_diagnostic(&task.origin));
                    } else if graph.has_value(&name) {
                        self.tasks[slot] = Some(task);
                        self.enqueue(slot);
                    } else {
                        tracing::trace!(job = %task.origin, id = %name, "job suspended");
                        self.tasks[slot] = Some(task);
                        self.parked.entry(name).or_default().push_back(slot);
                    }
                }
                Err(err) => {
                    tracing::debug!(job = %task.origin, error = %err, "job failed");
                    self.failures.push(err.into_diagnostic(&task.origin));
                }
            }
            self.wake(fresh);
        }

        let waiting: Vec<WaitingJob> = self
            .parked
            .iter()
            .flat_map(|(name, slots)| slots.iter().map(move |s| (name, *s)))
            .filter_map(|(name, slot)| {
                self.tasks[slot].as_ref().map(|t| (slot, WaitingJob { job: t.origin.clone(), awaiting: name.clone() }))
            })
            .collect::<std::collections::BTreeMap<_, _>>()
            .into_values()
            .collect();

        if !self.failures.is_empty() {
            // whatever is still parked was waiting on something a failed job owed
            let mut diags = self.failures;
            diags.extend(waiting.into_iter().map(|w| {
                Diagnostic::new(
                    ErrorKind::UnresolvedReference,
                    w.job,
                    KeyPath::root(),
                    format!("`{}` never received a value because an earlier job failed", w.awaiting),
                )
                .with_identifier(w.awaiting)
            }));
            return Err(CompileError::Generation(diags));
        }
        if !waiting.is_empty() {
            tracing::debug!(jobs = waiting.len(), "scheduler deadlocked");
            return Err(CompileError::Deadlock(waiting));
        }
        Ok(())
    }
}
