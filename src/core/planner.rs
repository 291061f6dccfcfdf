//! Plan construction.
//!
//! Consumes a validated config plus the invocation's action and flags, and
//! produces a `Plan`: one step per stack action, wired into a DAG from
//! explicit `requires` plus implicit edges discovered through `output`
//! lookups. Build invocations with a persistent graph key also derive
//! destroy steps for stacks that vanished from the config.

use indexmap::{IndexMap, IndexSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::context::Context;
use super::graph::{Graph, GraphError};
use super::persist::{LockToken, ObjectStore, PersistedGraph, StoreError};
use super::stack::{Stack, StackError};
use super::types::{ActionKind, Config, StepAction, StepStatus};
use crate::blueprint::BlueprintRegistry;

/// TTL for the persistent-graph lock; long enough for one invocation,
/// short enough that a crashed holder expires.
pub const GRAPH_LOCK_TTL: Duration = Duration::from_secs(4 * 60 * 60);

#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Stack(#[from] StackError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("stack '{stack}' requires unknown stack '{dependency}'")]
    UnknownDependency { stack: String, dependency: String },

    #[error("duplicate fully-qualified name '{fqn}' (stacks '{a}' and '{b}')")]
    DuplicateFqn { fqn: String, a: String, b: String },

    #[error("action '{0}' requires an object store for the persistent graph")]
    StoreRequired(ActionKind),
}

/// A plan node: one stack paired with one action.
pub struct Step {
    pub name: String,
    pub action: StepAction,
    pub stack: Arc<Stack>,
    pub status: StepStatus,
}

impl Step {
    fn new(name: &str, action: StepAction, stack: Arc<Stack>) -> Self {
        Self {
            name: name.to_string(),
            action,
            stack,
            status: StepStatus::pending(),
        }
    }
}

/// A validated DAG of steps for one invocation.
pub struct Plan {
    pub description: String,
    pub action: ActionKind,
    pub graph: Graph,
    pub steps: IndexMap<String, Step>,
    /// Prior graph and held lock, when `persistent_graph_key` is in play
    pub persisted: Option<PersistedGraph>,
    pub lock: Option<LockToken>,
}

impl Plan {
    /// Step names in execution order.
    pub fn execution_order(&self) -> Vec<String> {
        self.graph
            .topological_order()
            .expect("plan graphs are validated at construction")
    }

    /// Human-readable outline of the steps to be taken.
    pub fn outline(&self) -> String {
        let mut out = format!("Plan \"{}\":\n", self.description);
        for (index, name) in self.execution_order().iter().enumerate() {
            let step = &self.steps[name];
            out.push_str(&format!(
                "  - step: {}: target: \"{}\", action: \"{}\"\n",
                index + 1,
                name,
                step.action
            ));
        }
        out
    }
}

/// Invocation parameters that shape the plan.
#[derive(Debug, Default, Clone)]
pub struct PlanRequest {
    pub action: ActionKind,
    /// `--stacks` selection; empty means everything
    pub targets: Vec<String>,
    /// With targets: skip the dependency closure
    pub only: bool,
    /// Locked stacks to force-update
    pub force: Vec<String>,
}

/// Build the plan for one invocation.
pub fn build_plan(
    config: &Config,
    ctx: &Context,
    blueprints: &BlueprintRegistry,
    request: &PlanRequest,
    store: Option<&dyn ObjectStore>,
) -> Result<Plan, PlanError> {
    let step_action = match request.action {
        ActionKind::Build => StepAction::CreateOrUpdate,
        ActionKind::Destroy => StepAction::Destroy,
        ActionKind::Dump => StepAction::Dump,
        // graph and info never execute their steps; diff semantics fit
        ActionKind::Diff | ActionKind::Graph | ActionKind::Info => StepAction::Diff,
    };

    // Load the prior graph before planning so destroy can keep disabled
    // stacks that still exist remotely.
    let (persisted, lock) = match (&config.persistent_graph_key, request.action) {
        (Some(key), ActionKind::Build | ActionKind::Destroy) => {
            let store = store.ok_or(PlanError::StoreRequired(request.action))?;
            let token = store.acquire(key, GRAPH_LOCK_TTL)?;
            match PersistedGraph::load(store, key) {
                Ok(graph) => (Some(graph), Some(token)),
                Err(error) => {
                    let _ = store.release(&token);
                    return Err(error.into());
                }
            }
        }
        _ => (None, None),
    };

    let release_on_error = |error: PlanError| -> PlanError {
        if let (Some(store), Some(token)) = (store, &lock) {
            let _ = store.release(token);
        }
        error
    };

    plan_inner(
        config,
        ctx,
        blueprints,
        request,
        step_action,
        persisted,
        lock.clone(),
    )
    .map_err(release_on_error)
}

fn plan_inner(
    config: &Config,
    ctx: &Context,
    blueprints: &BlueprintRegistry,
    request: &PlanRequest,
    step_action: StepAction,
    persisted: Option<PersistedGraph>,
    lock: Option<LockToken>,
) -> Result<Plan, PlanError> {
    let defined: IndexSet<&str> = config.stacks.iter().map(|s| s.name.as_str()).collect();

    let mut steps: IndexMap<String, Step> = IndexMap::new();
    let mut graph = Graph::new();
    let mut fqns: IndexMap<String, String> = IndexMap::new();

    for def in &config.stacks {
        let include = if request.action == ActionKind::Destroy {
            // disabled stacks are still destroyed if a prior invocation
            // actually built them
            def.enabled
                || persisted
                    .as_ref()
                    .is_some_and(|graph| graph.contains(&def.name))
        } else {
            def.enabled
        };
        if !include {
            continue;
        }

        let stack = Arc::new(Stack::from_def(def, config, ctx, blueprints, &request.force)?);
        if let Some(previous) = fqns.insert(stack.fqn.clone(), stack.name.clone()) {
            return Err(PlanError::DuplicateFqn {
                fqn: stack.fqn.clone(),
                a: previous,
                b: stack.name.clone(),
            });
        }
        graph.add(&stack.name)?;
        steps.insert(stack.name.clone(), Step::new(&def.name, step_action, stack));
    }

    // Explicit requires plus implicit output references
    for (name, step) in &steps {
        for dep in step.stack.dependencies()? {
            if !graph.contains(&dep) {
                if defined.contains(dep.as_str()) {
                    // declared but filtered out (disabled); no edge needed
                    continue;
                }
                return Err(PlanError::UnknownDependency {
                    stack: name.clone(),
                    dependency: dep,
                });
            }
            if !graph.has_edge(name, &dep) {
                graph.connect(name, &dep)?;
            }
        }
    }

    graph.validate()?;

    // Stacks removed since the prior build get destroy steps
    if request.action == ActionKind::Build {
        if let Some(prior) = &persisted {
            let removed: Vec<&String> = prior
                .nodes
                .keys()
                .filter(|name| !defined.contains(name.as_str()))
                .collect();
            for name in &removed {
                let requires = prior.nodes.get(*name).cloned().unwrap_or_default();
                let stack = Arc::new(Stack::placeholder(name, &requires, ctx));
                graph.add(name)?;
                steps.insert((*name).clone(), Step::new(name, StepAction::Destroy, stack));
            }
            // destroy dependents before their dependencies
            for name in &removed {
                for dep in prior.nodes.get(*name).cloned().unwrap_or_default() {
                    if graph.contains(&dep)
                        && steps
                            .get(&dep)
                            .is_some_and(|s| s.action == StepAction::Destroy)
                        && !graph.has_edge(&dep, name)
                    {
                        graph.connect(&dep, name)?;
                    }
                }
            }
        }
    }

    if request.action == ActionKind::Destroy {
        graph = graph.transposed();
    }

    // --stacks: the selection plus everything it transitively requires
    if !request.targets.is_empty() {
        let mut keep: IndexSet<String> = IndexSet::new();
        for target in &request.targets {
            if !graph.contains(target) {
                continue;
            }
            keep.insert(target.clone());
            if !request.only {
                keep.extend(graph.ancestors(target));
            }
        }
        graph = graph.filtered(&keep);
        steps.retain(|name, _| keep.contains(name));
    }

    Ok(Plan {
        description: format!("{} ({})", request.action, ctx.namespace),
        action: request.action,
        graph,
        steps,
        persisted,
        lock,
    })
}
