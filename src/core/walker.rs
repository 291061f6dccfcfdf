//! Bounded-parallel graph walker.
//!
//! Dispatches a worker per vertex once every dependency has terminated
//! successfully. Vertices whose dependencies end badly are handed to the
//! worker as `DependencyFailed` without running; a tripped cancellation
//! token converts the not-yet-dispatched remainder to `Canceled`. At most
//! `concurrency` workers run at once, and with `concurrency == 1` the
//! dispatch order is exactly the topological order of the graph.

use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::mpsc;

use super::context::CancellationToken;
use super::graph::Graph;

/// Why the walker is invoking the worker for a vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Every dependency finished successfully; do the work.
    Run,
    /// A dependency terminated non-successfully; mark and return.
    DependencyFailed,
    /// The cancellation token tripped before dispatch.
    Canceled,
}

/// Terminal disposition of a vertex after the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    Ok,
    Failed,
    Canceled,
}

impl WalkOutcome {
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Walk `graph` with at most `concurrency` parallel workers.
///
/// The worker receives the vertex name and a [`Dispatch`]; it returns
/// whether the vertex terminated successfully. For `DependencyFailed` and
/// `Canceled` dispatches the worker is expected to record the terminal
/// status and return false; those calls are made inline on the walker
/// thread and must be cheap.
pub fn walk<F>(
    graph: &Graph,
    concurrency: usize,
    cancel: &CancellationToken,
    worker: F,
) -> IndexMap<String, WalkOutcome>
where
    F: Fn(&str, Dispatch) -> bool + Sync,
{
    let concurrency = concurrency.max(1);
    let mut remaining_deps: HashMap<String, usize> = graph
        .nodes()
        .map(|n| (n.to_string(), graph.deps_of(n).len()))
        .collect();

    // Ready list keeps graph insertion order for deterministic tie-breaking
    let mut ready: Vec<String> = graph
        .nodes()
        .filter(|n| remaining_deps[*n] == 0)
        .map(str::to_string)
        .collect();

    let mut outcomes: IndexMap<String, WalkOutcome> = IndexMap::new();
    // Vertices poisoned by an upstream failure, in discovery order
    let mut doomed: Vec<String> = Vec::new();

    std::thread::scope(|scope| {
        let (done_tx, done_rx) = mpsc::channel::<(String, bool)>();
        let mut in_flight = 0usize;

        loop {
            // Settle poisoned vertices first so their dependents cascade
            while let Some(name) = doomed.pop() {
                if outcomes.contains_key(&name) {
                    continue;
                }
                worker(&name, Dispatch::DependencyFailed);
                outcomes.insert(name.clone(), WalkOutcome::Canceled);
                for dependent in graph.dependents_of(&name) {
                    doomed.push(dependent.to_string());
                }
            }

            if cancel.is_canceled() {
                // Drain: no new dispatches; everything unstarted is canceled
                while let Some(name) = ready.pop() {
                    if !outcomes.contains_key(&name) {
                        worker(&name, Dispatch::Canceled);
                        outcomes.insert(name, WalkOutcome::Canceled);
                    }
                }
            } else {
                while in_flight < concurrency && !ready.is_empty() {
                    let name = ready.remove(0);
                    if outcomes.contains_key(&name) {
                        continue;
                    }
                    let tx = done_tx.clone();
                    let worker = &worker;
                    scope.spawn(move || {
                        let ok = worker(&name, Dispatch::Run);
                        // receiver lives until the scope ends
                        let _ = tx.send((name, ok));
                    });
                    in_flight += 1;
                }
            }

            if in_flight == 0 {
                if !doomed.is_empty() || (cancel.is_canceled() && !ready.is_empty()) {
                    continue;
                }
                break;
            }

            let (name, ok) = done_rx.recv().expect("walker channel open");
            in_flight -= 1;
            outcomes.insert(
                name.clone(),
                if ok { WalkOutcome::Ok } else { WalkOutcome::Failed },
            );

            for dependent in graph.dependents_of(&name) {
                if ok {
                    let count = remaining_deps
                        .get_mut(dependent)
                        .expect("dependent is a graph node");
                    *count -= 1;
                    if *count == 0 {
                        insert_in_graph_order(graph, &mut ready, dependent);
                    }
                } else {
                    doomed.push(dependent.to_string());
                }
            }
        }
    });

    // Anything never reached (e.g. canceled mid-drain with deps unresolved)
    for name in graph.nodes() {
        if !outcomes.contains_key(name) {
            worker(name, Dispatch::Canceled);
            outcomes.insert(name.to_string(), WalkOutcome::Canceled);
        }
    }

    outcomes
}

fn insert_in_graph_order(graph: &Graph, ready: &mut Vec<String>, name: &str) {
    let index_of = |n: &str| graph.nodes().position(|x| x == n);
    let target = index_of(name);
    let pos = ready
        .iter()
        .position(|r| index_of(r) > target)
        .unwrap_or(ready.len());
    ready.insert(pos, name.to_string());
}
