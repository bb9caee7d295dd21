//! Dependency resolution over component metadata.
//!
//! 1. **Expansion** - requested components pull in their required and
//!    auto-loaded components, transitively, until nothing new appears.
//! 2. **Ordering** - Kahn's algorithm over required edges only; among ready
//!    components the one discovered first goes first.
//! 3. **Cycle detection** - required edges that cannot be ordered are traced
//!    into a concrete `a -> b -> c -> a` path. Auto-load edges never count.
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use indexmap::{IndexMap, IndexSet};

/// Static prerequisite metadata, as seen by the resolver.
pub trait Manifest {
    /// Components that must be set up before `component`. `None` if unknown.
    fn requires(&self, component: &str) -> Option<Vec<String>>;
    /// Components loaded alongside `component`, without ordering constraints.
    fn auto_loads(&self, component: &str) -> Vec<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("dependency cycle among required components: {}", .path.join(" -> "))]
pub struct CycleError {
    /// Closed path, first element repeated at the end.
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("component `{component}` not found")]
    Unknown { component: String, requested_by: Option<String> },
    #[error(transparent)]
    Cycle(#[from] CycleError),
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    order: Vec<String>,
    position: IndexMap<String, usize>,
    closure: IndexMap<String, IndexSet<String>>,
    pulled_by: IndexMap<String, String>,
}

impl Resolution {
    /// Components in setup order.
    pub fn order(&self) -> &[String] { &self.order }

    pub fn position(&self, component: &str) -> Option<usize> { self.position.get(component).copied() }

    pub fn contains(&self, component: &str) -> bool { self.position.contains_key(component) }

    /// The component whose requirement or auto-load brought `component` in.
    /// `None` for components that were requested directly.
    pub fn pulled_in_by(&self, component: &str) -> Option<&str> { self.pulled_by.get(component).map(String::as_str) }

    /// Whether `a` requires `b`, directly or through other required components.
    pub fn requires_transitively(&self, a: &str, b: &str) -> bool {
        self.closure.get(a).is_some_and(|deps| deps.contains(b))
    }
}

/// Expand and order `requested`. Unknown names are collected (all of them)
/// and returned instead of a resolution.
pub fn resolve<M: Manifest>(manifest: &M, requested: &[String]) -> Result<Resolution, Vec<ResolveError>> {
    // 1) expansion, recording discovery rank
    let mut rank: IndexMap<String, Vec<String>> = IndexMap::new();
    let mut queue: VecDeque<(String, Option<String>)> = requested.iter().map(|c| (c.clone(), None)).collect();
    let mut unknown = Vec::new();
    let mut seen: IndexSet<String> = IndexSet::new();
    let mut pulled_by = IndexMap::new();
    while let Some((name, by)) = queue.pop_front() {
        if !seen.insert(name.clone()) {
            continue;
        }
        let Some(requires) = manifest.requires(&name) else {
            unknown.push(ResolveError::Unknown { component: name, requested_by: by });
            continue;
        };
        for dep in requires.iter().cloned().chain(manifest.auto_loads(&name)) {
            if !seen.contains(&dep) {
                queue.push_back((dep, Some(name.clone())));
            }
        }
        if let Some(by) = by {
            pulled_by.insert(name.clone(), by);
        }
        rank.insert(name, requires);
    }
    if !unknown.is_empty() {
        return Err(unknown);
    }

    // 2) Kahn, min-rank first
    let mut in_degree: Vec<usize> = rank.values().map(|reqs| reqs.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); rank.len()];
    for (ix, reqs) in rank.values().enumerate() {
        for r in reqs {
            if let Some(dep_ix) = rank.get_index_of(r) {
                dependents[dep_ix].push(ix);
            }
        }
    }
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(rank.len());
    while let Some(Reverse(ix)) = ready.pop() {
        order.push(ix);
        for &d in &dependents[ix] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.push(Reverse(d));
            }
        }
    }

    // 3) cycles
    if order.len() != rank.len() {
        let stuck: Vec<usize> = (0..rank.len()).filter(|i| in_degree[*i] > 0).collect();
        return Err(vec![trace_cycle(&rank, &stuck).into()]);
    }

    let order: Vec<String> = order.into_iter().map(|i| rank.get_index(i).map(|(k, _)| k.clone()).unwrap_or_default()).collect();
    let position = order.iter().enumerate().map(|(i, c)| (c.clone(), i)).collect();
    let closure = rank.keys().map(|c| (c.clone(), transitive_requires(&rank, c))).collect();
    tracing::debug!(order = ?order, "resolved component order");
    Ok(Resolution { order, position, closure, pulled_by })
}

fn transitive_requires(edges: &IndexMap<String, Vec<String>>, start: &str) -> IndexSet<String> {
    let mut out = IndexSet::new();
    let mut stack: Vec<&str> = edges.get(start).map(|v| v.iter().map(String::as_str).collect()).unwrap_or_default();
    while let Some(c) = stack.pop() {
        if out.insert(c.to_string()) {
            if let Some(next) = edges.get(c) {
                stack.extend(next.iter().map(String::as_str));
            }
        }
    }
    out
}

/// Follow required edges inside the stuck set until a node repeats.
fn trace_cycle(edges: &IndexMap<String, Vec<String>>, stuck: &[usize]) -> CycleError {
    let stuck_names: IndexSet<&str> = stuck
        .iter()
        .filter_map(|i| edges.get_index(*i).map(|(k, _)| k.as_str()))
        .collect();
    let Some(&start) = stuck_names.first() else {
        return CycleError { path: Vec::new() };
    };
    let mut path: Vec<&str> = vec![start];
    let mut current = start;
    loop {
        let next = edges
            .get(current)
            .and_then(|reqs| reqs.iter().map(String::as_str).find(|r| stuck_names.contains(r)));
        let Some(next) = next else { break };
        if let Some(at) = path.iter().position(|p| *p == next) {
            // drop the lead-in so the path is exactly the cycle
            let mut cycle: Vec<String> = path[at..].iter().map(|s| s.to_string()).collect();
            cycle.push(next.to_string());
            return CycleError { path: cycle };
        }
        path.push(next);
        current = next;
    }
    CycleError { path: path.into_iter().map(str::to_string).collect() }
}
