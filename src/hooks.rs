//! Pre/post action hooks.
//!
//! Hooks run around the executor in their own dependency sub-graph, serial
//! by default. A hook's result can be published into `context.hook_data`
//! for later hooks and `hook_data` lookups.

use indexmap::IndexMap;
use std::collections::HashMap;
use std::process::Command;
use std::sync::Mutex;
use thiserror::Error;

use crate::core::context::Context;
use crate::core::graph::{Graph, GraphError};
use crate::core::types::{HookDef, HookPhase};
use crate::core::walker::{self, Dispatch};
use crate::lookups::{LookupRegistry, ResolveError};
use crate::provider::{Provider, ProviderError};

#[derive(Debug, Error)]
pub enum HookError {
    #[error("no hook registered under path '{0}'")]
    UnknownHook(String),

    #[error("hook graph invalid: {0}")]
    Graph(#[from] GraphError),

    #[error("hook '{hook}' failed: {reason}")]
    Failed { hook: String, reason: String },

    #[error("required hook '{hook}' failed: {reason}")]
    RequiredFailed { hook: String, reason: String },
}

/// Everything a hook sees when it runs.
pub struct HookContext<'a> {
    pub context: &'a Context,
    pub provider: &'a dyn Provider,
    pub phase: HookPhase,
    /// Lookup-resolved hook arguments
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// A named pre/post action.
pub trait Hook: Send + Sync {
    fn run(&self, hook_ctx: &HookContext) -> Result<Option<serde_json::Value>, HookError>;
}

/// Hook implementations by registered path.
pub struct HookRegistry {
    hooks: HashMap<String, Box<dyn Hook>>,
}

impl HookRegistry {
    /// Registry with the built-in `command` hook installed.
    pub fn with_builtins() -> Self {
        let mut registry = Self { hooks: HashMap::new() };
        registry.register("command", Box::new(CommandHook));
        registry
    }

    pub fn register(&mut self, path: &str, hook: Box<dyn Hook>) {
        self.hooks.insert(path.to_string(), hook);
    }

    pub fn get(&self, path: &str) -> Option<&dyn Hook> {
        self.hooks.get(path).map(Box::as_ref)
    }
}

/// Outcome counts for one hook phase.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HookSummary {
    pub ran: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Run one phase's hooks in declaration order, honoring their sub-graph.
///
/// A required hook failure aborts with `RequiredFailed`; optional failures
/// are counted and execution continues. In `post_destroy`, hooks whose
/// lookups need outputs of already-destroyed stacks are skipped.
pub fn run_hooks(
    phase: HookPhase,
    hooks: &[HookDef],
    registry: &HookRegistry,
    lookups: &LookupRegistry,
    ctx: &Context,
    provider: &dyn Provider,
) -> Result<HookSummary, HookError> {
    if hooks.is_empty() {
        return Ok(HookSummary::default());
    }

    // Unique labels: explicit names win, unnamed hooks get an index suffix
    let mut labeled: IndexMap<String, &HookDef> = IndexMap::new();
    for (index, hook) in hooks.iter().enumerate() {
        let label = match &hook.name {
            Some(name) => name.clone(),
            None => format!("{}:{}", hook.path, index),
        };
        labeled.insert(label, hook);
    }

    let mut graph = Graph::new();
    for label in labeled.keys() {
        graph.add(label)?;
    }
    for (label, hook) in &labeled {
        for dep in &hook.requires {
            if !graph.has_edge(label, dep) {
                graph.connect(label, dep)?;
            }
        }
        for dependent in &hook.required_by {
            if !graph.has_edge(dependent, label) {
                graph.connect(dependent, label)?;
            }
        }
    }
    graph.validate()?;

    let summary = Mutex::new(HookSummary::default());
    let abort: Mutex<Option<HookError>> = Mutex::new(None);

    walker::walk(&graph, 1, &ctx.cancel, |label, dispatch| {
        if dispatch != Dispatch::Run {
            return false;
        }
        if abort.lock().expect("abort lock").is_some() {
            return false;
        }
        let hook = labeled[label];
        match run_one(phase, label, hook, registry, lookups, ctx, provider) {
            Ok(HookOutcome::Ran) => {
                summary.lock().expect("summary lock").ran += 1;
                true
            }
            Ok(HookOutcome::Skipped) => {
                summary.lock().expect("summary lock").skipped += 1;
                true
            }
            Err(error) => {
                summary.lock().expect("summary lock").failed += 1;
                if hook.required {
                    *abort.lock().expect("abort lock") = Some(error);
                    false
                } else {
                    eprintln!("warning: {}", error);
                    true
                }
            }
        }
    });

    if let Some(error) = abort.into_inner().expect("abort lock") {
        return Err(error);
    }
    Ok(summary.into_inner().expect("summary lock"))
}

enum HookOutcome {
    Ran,
    Skipped,
}

fn run_one(
    phase: HookPhase,
    label: &str,
    def: &HookDef,
    registry: &HookRegistry,
    lookups: &LookupRegistry,
    ctx: &Context,
    provider: &dyn Provider,
) -> Result<HookOutcome, HookError> {
    if !def.enabled {
        return Ok(HookOutcome::Skipped);
    }

    let hook = registry
        .get(&def.path)
        .ok_or_else(|| HookError::UnknownHook(def.path.clone()))?;

    let mut args = serde_json::Map::new();
    for (name, raw) in &def.args {
        let node = crate::lookups::parser::parse_value(raw).map_err(|e| HookError::Failed {
            hook: label.to_string(),
            reason: e.to_string(),
        })?;
        match lookups.resolve(&node, ctx, provider) {
            Ok(value) => {
                args.insert(name.clone(), value);
            }
            Err(error) => {
                if phase == HookPhase::PostDestroy && references_destroyed_stack(&error) {
                    return Ok(HookOutcome::Skipped);
                }
                return Err(HookError::Failed {
                    hook: label.to_string(),
                    reason: error.to_string(),
                });
            }
        }
    }

    let hook_ctx = HookContext { context: ctx, provider, phase, args };
    let result = hook.run(&hook_ctx).map_err(|e| match e {
        HookError::Failed { reason, .. } => HookError::Failed {
            hook: label.to_string(),
            reason,
        },
        other => other,
    })?;

    if let (Some(data_key), Some(value)) = (&def.data_key, result) {
        ctx.set_hook_data(data_key, value);
    }
    Ok(HookOutcome::Ran)
}

fn references_destroyed_stack(error: &ResolveError) -> bool {
    matches!(
        error,
        ResolveError::UnresolvedDependency { .. }
            | ResolveError::OutputDoesNotExist { .. }
            | ResolveError::Provider(ProviderError::StackDeleted(_))
    )
}

// ============================================================================
// Built-in command hook
// ============================================================================

/// Runs a shell command. `command` is a string (run through bash) or an
/// argv list; stdout/stderr/returncode land in the hook result.
pub struct CommandHook;

impl Hook for CommandHook {
    fn run(&self, hook_ctx: &HookContext) -> Result<Option<serde_json::Value>, HookError> {
        let fail = |reason: String| HookError::Failed {
            hook: "command".to_string(),
            reason,
        };

        let spec = hook_ctx
            .args
            .get("command")
            .ok_or_else(|| fail("missing 'command' argument".to_string()))?;

        let mut command = match spec {
            serde_json::Value::String(line) => {
                let mut c = Command::new("bash");
                c.arg("-c").arg(line);
                c
            }
            serde_json::Value::Array(argv) => {
                let mut parts = argv.iter().map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
                let program = parts
                    .next()
                    .ok_or_else(|| fail("empty argv".to_string()))?;
                let mut c = Command::new(program);
                c.args(parts);
                c
            }
            other => return Err(fail(format!("invalid 'command' argument: {}", other))),
        };

        if let Some(serde_json::Value::Object(env)) = hook_ctx.args.get("env") {
            for (key, value) in env {
                command.env(key, value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string()));
            }
        }

        let output = command
            .output()
            .map_err(|e| fail(format!("failed to spawn: {}", e)))?;

        let returncode = output.status.code().unwrap_or(-1);
        let result = serde_json::json!({
            "returncode": returncode,
            "stdout": String::from_utf8_lossy(&output.stdout).trim_end(),
            "stderr": String::from_utf8_lossy(&output.stderr).trim_end(),
        });

        if !output.status.success() {
            return Err(fail(format!(
                "exit code {}: {}",
                returncode,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryProvider;

    fn hook_yaml(yaml: &str) -> Vec<HookDef> {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn setup() -> (Context, MemoryProvider, HookRegistry, LookupRegistry) {
        (
            Context::for_namespace("test"),
            MemoryProvider::new("us-east-1"),
            HookRegistry::with_builtins(),
            LookupRegistry::with_builtins(),
        )
    }

    #[test]
    fn test_hooks_empty_phase() {
        let (ctx, provider, registry, lookups) = setup();
        let summary =
            run_hooks(HookPhase::PreBuild, &[], &registry, &lookups, &ctx, &provider).unwrap();
        assert_eq!(summary, HookSummary::default());
    }

    #[test]
    fn test_hooks_command_runs_and_publishes_data() {
        let (ctx, provider, registry, lookups) = setup();
        let hooks = hook_yaml(
            r#"
- path: command
  data_key: greeting
  args:
    command: "echo hello"
"#,
        );
        let summary = run_hooks(
            HookPhase::PreBuild,
            &hooks,
            &registry,
            &lookups,
            &ctx,
            &provider,
        )
        .unwrap();
        assert_eq!(summary.ran, 1);
        let data = ctx.hook_data("greeting").unwrap();
        assert_eq!(data["stdout"], "hello");
        assert_eq!(data["returncode"], 0);
    }

    #[test]
    fn test_hooks_disabled_is_skipped() {
        let (ctx, provider, registry, lookups) = setup();
        let hooks = hook_yaml(
            r#"
- path: command
  enabled: false
  args:
    command: "false"
"#,
        );
        let summary = run_hooks(
            HookPhase::PreBuild,
            &hooks,
            &registry,
            &lookups,
            &ctx,
            &provider,
        )
        .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.ran, 0);
    }

    #[test]
    fn test_hooks_required_failure_aborts() {
        let (ctx, provider, registry, lookups) = setup();
        let hooks = hook_yaml(
            r#"
- path: command
  args:
    command: "exit 3"
"#,
        );
        let result = run_hooks(
            HookPhase::PreBuild,
            &hooks,
            &registry,
            &lookups,
            &ctx,
            &provider,
        );
        assert!(matches!(result, Err(HookError::Failed { .. })));
    }

    #[test]
    fn test_hooks_optional_failure_continues() {
        let (ctx, provider, registry, lookups) = setup();
        let hooks = hook_yaml(
            r#"
- path: command
  required: false
  args:
    command: "exit 1"
- name: second
  path: command
  data_key: second
  args:
    command: "echo ran"
"#,
        );
        let summary = run_hooks(
            HookPhase::PreBuild,
            &hooks,
            &registry,
            &lookups,
            &ctx,
            &provider,
        )
        .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.ran, 1);
        assert!(ctx.hook_data("second").is_some());
    }

    #[test]
    fn test_hooks_unknown_path() {
        let (ctx, provider, registry, lookups) = setup();
        let hooks = hook_yaml("- path: no.such.hook\n");
        let result = run_hooks(
            HookPhase::PreBuild,
            &hooks,
            &registry,
            &lookups,
            &ctx,
            &provider,
        );
        assert!(matches!(result, Err(HookError::UnknownHook(_))));
    }

    #[test]
    fn test_hooks_ordering_via_requires() {
        let (ctx, provider, registry, lookups) = setup();
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("order.log");
        let hooks = hook_yaml(&format!(
            r#"
- name: second
  path: command
  requires: [first]
  args:
    command: "echo second >> {log}"
- name: first
  path: command
  args:
    command: "echo first >> {log}"
"#,
            log = log.display()
        ));
        run_hooks(
            HookPhase::PreBuild,
            &hooks,
            &registry,
            &lookups,
            &ctx,
            &provider,
        )
        .unwrap();
        let content = std::fs::read_to_string(&log).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[test]
    fn test_hooks_cycle_rejected() {
        let (ctx, provider, registry, lookups) = setup();
        let hooks = hook_yaml(
            r#"
- name: a
  path: command
  requires: [b]
  args: {command: "true"}
- name: b
  path: command
  requires: [a]
  args: {command: "true"}
"#,
        );
        let result = run_hooks(
            HookPhase::PreBuild,
            &hooks,
            &registry,
            &lookups,
            &ctx,
            &provider,
        );
        assert!(matches!(result, Err(HookError::Graph(_))));
    }

    #[test]
    fn test_hooks_args_resolve_lookups() {
        let (ctx, provider, registry, lookups) = setup();
        let mut outputs = std::collections::BTreeMap::new();
        outputs.insert("Id".to_string(), "vpc-1".to_string());
        ctx.set_outputs("vpc", outputs);
        let hooks = hook_yaml(
            r#"
- path: command
  data_key: resolved
  args:
    command: "echo ${output vpc::Id}"
"#,
        );
        run_hooks(
            HookPhase::PostBuild,
            &hooks,
            &registry,
            &lookups,
            &ctx,
            &provider,
        )
        .unwrap();
        assert_eq!(ctx.hook_data("resolved").unwrap()["stdout"], "vpc-1");
    }

    #[test]
    fn test_hooks_post_destroy_skips_destroyed_outputs() {
        let (ctx, provider, registry, lookups) = setup();
        let hooks = hook_yaml(
            r#"
- path: command
  args:
    command: "echo ${output gone::Id}"
"#,
        );
        let summary = run_hooks(
            HookPhase::PostDestroy,
            &hooks,
            &registry,
            &lookups,
            &ctx,
            &provider,
        )
        .unwrap();
        assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn test_hooks_pre_build_missing_output_fails() {
        let (ctx, provider, registry, lookups) = setup();
        let hooks = hook_yaml(
            r#"
- path: command
  args:
    command: "echo ${output gone::Id}"
"#,
        );
        let result = run_hooks(
            HookPhase::PreBuild,
            &hooks,
            &registry,
            &lookups,
            &ctx,
            &provider,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_hooks_command_argv_form() {
        let (ctx, provider, registry, lookups) = setup();
        let hooks = hook_yaml(
            r#"
- path: command
  data_key: argv
  args:
    command: [echo, direct]
"#,
        );
        run_hooks(
            HookPhase::PreBuild,
            &hooks,
            &registry,
            &lookups,
            &ctx,
            &provider,
        )
        .unwrap();
        assert_eq!(ctx.hook_data("argv").unwrap()["stdout"], "direct");
    }
}
