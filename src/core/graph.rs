//! Directed acyclic graph of step names.
//!
//! Edges point from a vertex to the vertices it depends on, so an edge
//! `b -> a` reads "b requires a" and `a` must complete before `b`.
//! Insertion order is preserved everywhere and used for deterministic
//! tie-breaking between otherwise-ready vertices.

use indexmap::{IndexMap, IndexSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("node '{0}' already exists")]
    DuplicateNode(String),

    #[error("node '{0}' does not exist")]
    UnknownNode(String),

    #[error("edge '{0}' -> '{1}' already exists")]
    DuplicateEdge(String, String),

    #[error("node '{0}' cannot depend on itself")]
    SelfEdge(String),

    #[error("dependency cycle detected: {}", format_cycles(.0))]
    Cycles(Vec<Vec<String>>),
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|c| c.join(" -> "))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Directed graph with forward (dependency) and reverse (dependent) indexes.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    deps: IndexMap<String, IndexSet<String>>,
    dependents: IndexMap<String, IndexSet<String>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a persisted adjacency map `{name: [deps...]}`.
    /// Unknown dependency targets are added as bare nodes.
    pub fn from_adjacency(adjacency: &IndexMap<String, Vec<String>>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for name in adjacency.keys() {
            graph.add_if_missing(name);
        }
        for (name, deps) in adjacency {
            for dep in deps {
                graph.add_if_missing(dep);
                if !graph.has_edge(name, dep) {
                    graph.connect(name, dep)?;
                }
            }
        }
        Ok(graph)
    }

    /// Export as an adjacency map, insertion-ordered.
    pub fn to_adjacency(&self) -> IndexMap<String, Vec<String>> {
        self.deps
            .iter()
            .map(|(name, deps)| (name.clone(), deps.iter().cloned().collect()))
            .collect()
    }

    pub fn add(&mut self, name: &str) -> Result<(), GraphError> {
        if self.deps.contains_key(name) {
            return Err(GraphError::DuplicateNode(name.to_string()));
        }
        self.deps.insert(name.to_string(), IndexSet::new());
        self.dependents.insert(name.to_string(), IndexSet::new());
        Ok(())
    }

    pub fn add_if_missing(&mut self, name: &str) {
        if !self.deps.contains_key(name) {
            self.deps.insert(name.to_string(), IndexSet::new());
            self.dependents.insert(name.to_string(), IndexSet::new());
        }
    }

    /// Record that `name` depends on `dep`.
    pub fn connect(&mut self, name: &str, dep: &str) -> Result<(), GraphError> {
        if name == dep {
            return Err(GraphError::SelfEdge(name.to_string()));
        }
        if !self.deps.contains_key(name) {
            return Err(GraphError::UnknownNode(name.to_string()));
        }
        if !self.deps.contains_key(dep) {
            return Err(GraphError::UnknownNode(dep.to_string()));
        }
        if self.deps[name].contains(dep) {
            return Err(GraphError::DuplicateEdge(
                name.to_string(),
                dep.to_string(),
            ));
        }
        self.deps[name].insert(dep.to_string());
        self.dependents[dep].insert(name.to_string());
        Ok(())
    }

    /// Remove a node and every edge touching it.
    pub fn remove(&mut self, name: &str) -> Result<(), GraphError> {
        if self.deps.shift_remove(name).is_none() {
            return Err(GraphError::UnknownNode(name.to_string()));
        }
        self.dependents.shift_remove(name);
        for deps in self.deps.values_mut() {
            deps.shift_remove(name);
        }
        for dependents in self.dependents.values_mut() {
            dependents.shift_remove(name);
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.deps.contains_key(name)
    }

    pub fn has_edge(&self, name: &str, dep: &str) -> bool {
        self.deps.get(name).is_some_and(|d| d.contains(dep))
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.deps.keys().map(String::as_str)
    }

    /// Direct dependencies of `name`.
    pub fn deps_of(&self, name: &str) -> Vec<&str> {
        self.deps
            .get(name)
            .map(|d| d.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Direct dependents of `name`.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.dependents
            .get(name)
            .map(|d| d.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Transitive closure of everything that must complete before `name`.
    pub fn ancestors(&self, name: &str) -> IndexSet<String> {
        self.closure(name, |g, n| g.deps_of(n))
    }

    /// Transitive closure of everything that depends on `name`.
    pub fn descendants(&self, name: &str) -> IndexSet<String> {
        self.closure(name, |g, n| g.dependents_of(n))
    }

    fn closure<'a, F>(&'a self, start: &str, next: F) -> IndexSet<String>
    where
        F: Fn(&'a Graph, &str) -> Vec<&'a str>,
    {
        let mut seen: IndexSet<String> = IndexSet::new();
        let mut queue: Vec<String> = next(self, start).iter().map(|s| s.to_string()).collect();
        while let Some(node) = queue.pop() {
            if seen.insert(node.clone()) {
                queue.extend(next(self, &node).iter().map(|s| s.to_string()));
            }
        }
        seen
    }

    /// A new graph with every edge reversed. Used to destroy dependents
    /// before their dependencies.
    pub fn transposed(&self) -> Self {
        let mut graph = Self::new();
        for name in self.deps.keys() {
            graph.add_if_missing(name);
        }
        for (name, deps) in &self.deps {
            for dep in deps {
                graph.deps[dep].insert(name.clone());
                graph.dependents[name].insert(dep.clone());
            }
        }
        graph
    }

    /// Induced subgraph on `keep`: only those vertices, plus the edges
    /// between them.
    pub fn filtered(&self, keep: &IndexSet<String>) -> Self {
        let mut graph = Self::new();
        for name in self.deps.keys() {
            if keep.contains(name) {
                graph.add_if_missing(name);
            }
        }
        for (name, deps) in &self.deps {
            if !keep.contains(name) {
                continue;
            }
            for dep in deps {
                if keep.contains(dep) {
                    graph.deps[name].insert(dep.clone());
                    graph.dependents[dep].insert(name.clone());
                }
            }
        }
        graph
    }

    /// Drop edges implied by longer paths (`a -> c` is redundant when
    /// `a -> b -> c` exists). For rendering only.
    pub fn transitive_reduction(&mut self) {
        let mut redundant: Vec<(String, String)> = Vec::new();
        for (name, deps) in &self.deps {
            for dep in deps {
                let via_another = deps
                    .iter()
                    .filter(|other| *other != dep)
                    .any(|other| self.ancestors(other).contains(dep));
                if via_another {
                    redundant.push((name.clone(), dep.clone()));
                }
            }
        }
        for (name, dep) in redundant {
            self.deps[&name].shift_remove(&dep);
            self.dependents[&dep].shift_remove(&name);
        }
    }

    /// Topological order: dependencies first, insertion-order tie-breaking.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let mut remaining: IndexMap<&str, usize> = self
            .deps
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.len()))
            .collect();

        let mut ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(self.deps.len());
        while !ready.is_empty() {
            // Stable insertion order: take the earliest-declared ready node
            let node = ready.remove(0);
            order.push(node.to_string());
            let mut unblocked: Vec<&str> = Vec::new();
            for dependent in self.dependents_of(node) {
                let count = remaining.get_mut(dependent).expect("indexed node");
                *count -= 1;
                if *count == 0 {
                    unblocked.push(dependent);
                }
            }
            unblocked.sort_by_key(|n| self.deps.get_index_of(*n));
            for node in unblocked {
                let pos = ready
                    .iter()
                    .position(|r| self.deps.get_index_of(*r) > self.deps.get_index_of(node))
                    .unwrap_or(ready.len());
                ready.insert(pos, node);
            }
        }

        if order.len() != self.deps.len() {
            return Err(GraphError::Cycles(self.find_cycles()));
        }
        Ok(order)
    }

    /// Validate acyclicity, reporting every cycle found.
    pub fn validate(&self) -> Result<(), GraphError> {
        let cycles = self.find_cycles();
        if cycles.is_empty() {
            Ok(())
        } else {
            Err(GraphError::Cycles(cycles))
        }
    }

    /// Enumerate cycles: one representative cycle per strongly connected
    /// component with more than one member, as `[a, b, ..., a]`.
    fn find_cycles(&self) -> Vec<Vec<String>> {
        let mut cycles = Vec::new();
        for component in self.strongly_connected() {
            if component.len() < 2 {
                continue;
            }
            let members: IndexSet<&str> = component.iter().map(String::as_str).collect();
            // Walk edges inside the component to present the cycle in order
            let mut path = vec![component[0].clone()];
            loop {
                let current = path.last().expect("non-empty path").clone();
                let next = self
                    .deps_of(&current)
                    .into_iter()
                    .find(|d| members.contains(d) && !path.iter().any(|p| p == d))
                    .map(str::to_string);
                match next {
                    Some(node) => path.push(node),
                    None => break,
                }
            }
            path.push(component[0].clone());
            cycles.push(path);
        }
        cycles
    }

    /// Tarjan's strongly connected components, iterative.
    fn strongly_connected(&self) -> Vec<Vec<String>> {
        struct State {
            index: usize,
            lowlink: usize,
            on_stack: bool,
        }

        let mut states: IndexMap<&str, State> = IndexMap::new();
        let mut stack: Vec<&str> = Vec::new();
        let mut next_index = 0usize;
        let mut components: Vec<Vec<String>> = Vec::new();

        for root in self.deps.keys() {
            if states.contains_key(root.as_str()) {
                continue;
            }
            // frame: (node, iterator position into deps)
            let mut frames: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
            states.insert(
                root.as_str(),
                State { index: next_index, lowlink: next_index, on_stack: true },
            );
            stack.push(root.as_str());
            next_index += 1;

            while let Some((node, pos)) = frames.last().copied() {
                let deps = self.deps_of(node);
                if pos < deps.len() {
                    frames.last_mut().expect("frame").1 += 1;
                    let dep = deps[pos];
                    match states.get(dep) {
                        None => {
                            states.insert(
                                dep,
                                State {
                                    index: next_index,
                                    lowlink: next_index,
                                    on_stack: true,
                                },
                            );
                            stack.push(dep);
                            next_index += 1;
                            frames.push((dep, 0));
                        }
                        Some(state) if state.on_stack => {
                            let dep_index = state.index;
                            let entry = states.get_mut(node).expect("visited node");
                            entry.lowlink = entry.lowlink.min(dep_index);
                        }
                        Some(_) => {}
                    }
                } else {
                    frames.pop();
                    let (index, lowlink) = {
                        let state = &states[node];
                        (state.index, state.lowlink)
                    };
                    if let Some((parent, _)) = frames.last() {
                        let parent_state = states.get_mut(*parent).expect("parent state");
                        parent_state.lowlink = parent_state.lowlink.min(lowlink);
                    }
                    if index == lowlink {
                        let mut component = Vec::new();
                        while let Some(member) = stack.pop() {
                            states.get_mut(member).expect("stacked node").on_stack = false;
                            component.push(member.to_string());
                            if member == node {
                                break;
                            }
                        }
                        component.reverse();
                        components.push(component);
                    }
                }
            }
        }
        components
    }

    /// Graphviz rendering, one line per edge.
    pub fn dot(&self) -> String {
        let mut out = String::from("digraph {\n");
        for (name, deps) in &self.deps {
            for dep in deps {
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", name, dep));
            }
        }
        out.push_str("}\n");
        out
    }

    /// Machine-readable rendering: `{"steps": {name: {"deps": [...]}}}`.
    pub fn json(&self) -> String {
        let steps: serde_json::Map<String, serde_json::Value> = self
            .deps
            .iter()
            .map(|(name, deps)| {
                let deps: Vec<serde_json::Value> = deps
                    .iter()
                    .map(|d| serde_json::Value::String(d.clone()))
                    .collect();
                (
                    name.clone(),
                    serde_json::json!({ "deps": deps }),
                )
            })
            .collect();
        serde_json::to_string_pretty(&serde_json::json!({ "steps": steps }))
            .expect("graph serializes")
    }
}
