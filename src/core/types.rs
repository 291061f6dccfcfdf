//! Config schema and plan types.
//!
//! Defines the YAML schema for the stack-set config (namespace, stack
//! definitions, hooks, lookups) and the runtime plan vocabulary (actions,
//! step statuses). All config types derive Serialize/Deserialize for YAML
//! roundtripping.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Top-level config
// ============================================================================

/// Root configuration — the desired set of stacks for one namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Namespace prepended to every stack name
    pub namespace: String,

    /// Delimiter between namespace and stack name (may be empty)
    #[serde(default = "default_delimiter")]
    pub namespace_delimiter: String,

    /// Stack definitions, in execution-preference order
    #[serde(default)]
    pub stacks: Vec<StackDef>,

    /// Hooks run before the build action
    #[serde(default)]
    pub pre_build: Vec<HookDef>,

    /// Hooks run after the build action
    #[serde(default)]
    pub post_build: Vec<HookDef>,

    /// Hooks run before the destroy action
    #[serde(default)]
    pub pre_destroy: Vec<HookDef>,

    /// Hooks run after the destroy action
    #[serde(default)]
    pub post_destroy: Vec<HookDef>,

    /// Provider-native mappings passed through to blueprints
    #[serde(default)]
    pub mappings: IndexMap<String, serde_yaml_ng::Value>,

    /// Tags applied to every stack (stack tags win on conflict)
    #[serde(default)]
    pub tags: IndexMap<String, String>,

    /// Custom lookup handlers: name -> handler spec (e.g. "command:./script")
    #[serde(default)]
    pub lookups: IndexMap<String, String>,

    /// Extra search paths for externally loaded blueprints and hooks
    #[serde(default)]
    pub sys_path: Vec<String>,

    /// Bucket for rendered template artifacts
    #[serde(default)]
    pub artifact_bucket: Option<String>,

    /// Region of the artifact bucket
    #[serde(default)]
    pub artifact_region: Option<String>,

    /// Service role passed to the provider on create/update
    #[serde(default)]
    pub service_role: Option<String>,

    /// Object-store key for the persisted dependency graph
    #[serde(default)]
    pub persistent_graph_key: Option<String>,

    /// Unrecognized top-level keys (kept for anchor-only definitions,
    /// warned about at load time)
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_yaml_ng::Value>,
}

fn default_delimiter() -> String {
    "-".to_string()
}

// ============================================================================
// Stack definitions
// ============================================================================

/// A single stack declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackDef {
    /// Logical name, unique within the config
    pub name: String,

    /// Cloud-side name (defaults to `name`)
    #[serde(default)]
    pub stack_name: Option<String>,

    /// Fully-qualified name override (skips namespace joining)
    #[serde(default)]
    pub fqn: Option<String>,

    /// Named blueprint producing the template
    #[serde(default)]
    pub blueprint: Option<String>,

    /// Raw template file (".j2" suffix enables variable substitution)
    #[serde(default)]
    pub template_path: Option<String>,

    /// Variable inputs; values may contain `${type arg}` expressions
    #[serde(default)]
    pub variables: IndexMap<String, serde_yaml_ng::Value>,

    /// Explicit extra dependencies by logical name
    #[serde(default)]
    pub requires: Vec<String>,

    /// Never submit updates for this stack
    #[serde(default)]
    pub locked: bool,

    /// Disabled stacks are left out of the plan
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Updates require interactive approval even in non-interactive runs
    #[serde(default)]
    pub protected: bool,

    /// Managed outside this config; only outputs are read
    #[serde(default)]
    pub external: bool,

    /// Region override for this stack
    #[serde(default)]
    pub region: Option<String>,

    /// Credential profile override for this stack
    #[serde(default)]
    pub profile: Option<String>,

    /// Path to a stack policy document
    #[serde(default)]
    pub stack_policy_path: Option<String>,

    /// Stack-specific tags, merged over the global tags
    #[serde(default)]
    pub tags: IndexMap<String, String>,

    /// Template description override
    #[serde(default)]
    pub description: Option<String>,

    /// Notification topics passed to the provider
    #[serde(default)]
    pub notification_arns: Vec<String>,

    /// What to do when the live stack is already mid-operation
    #[serde(default)]
    pub in_progress_behavior: InProgressBehavior,
}

fn default_true() -> bool {
    true
}

impl StackDef {
    /// The cloud-side stack name (before namespace qualification).
    pub fn stack_name(&self) -> &str {
        self.stack_name.as_deref().unwrap_or(&self.name)
    }
}

/// Behavior when the live stack has an operation in progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InProgressBehavior {
    /// Poll until the in-flight operation terminates, then proceed
    Wait,
    /// Fail the step immediately
    #[default]
    Error,
}

// ============================================================================
// Hooks
// ============================================================================

/// A pre/post action run around the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookDef {
    /// Display name (defaults to `path`)
    #[serde(default)]
    pub name: Option<String>,

    /// Registered hook to invoke
    pub path: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Required hooks abort the invocation on failure
    #[serde(default = "default_true")]
    pub required: bool,

    /// Hook arguments; values may contain `${type arg}` expressions
    #[serde(default)]
    pub args: IndexMap<String, serde_yaml_ng::Value>,

    /// Key under which the hook's result lands in `context.hook_data`
    #[serde(default)]
    pub data_key: Option<String>,

    /// Hooks that must run before this one
    #[serde(default)]
    pub requires: Vec<String>,

    /// Hooks that must run after this one
    #[serde(default)]
    pub required_by: Vec<String>,
}

impl HookDef {
    /// Display name for graphs and events.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.path)
    }
}

/// Hook phases, named after the action they bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    PreBuild,
    PostBuild,
    PreDestroy,
    PostDestroy,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreBuild => write!(f, "pre_build"),
            Self::PostBuild => write!(f, "post_build"),
            Self::PreDestroy => write!(f, "pre_destroy"),
            Self::PostDestroy => write!(f, "post_destroy"),
        }
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Top-level invocation kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ActionKind {
    #[default]
    Build,
    Destroy,
    Diff,
    Dump,
    Graph,
    Info,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::Destroy => write!(f, "destroy"),
            Self::Diff => write!(f, "diff"),
            Self::Dump => write!(f, "dump"),
            Self::Graph => write!(f, "graph"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// Per-step action in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    CreateOrUpdate,
    Destroy,
    Diff,
    Dump,
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateOrUpdate => write!(f, "create_or_update"),
            Self::Destroy => write!(f, "destroy"),
            Self::Diff => write!(f, "diff"),
            Self::Dump => write!(f, "dump"),
        }
    }
}

// ============================================================================
// Step status machine
// ============================================================================

/// Status kinds, ordered by progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Pending = 0,
    Submitted = 1,
    AwaitApproval = 2,
    Complete = 3,
    Skipped = 4,
    Canceled = 5,
    Failed = 6,
}

impl StatusKind {
    /// Whether a step in this status is finished.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Skipped | Self::Canceled | Self::Failed
        )
    }

    /// Whether a finished step counts as successful for its dependents.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Complete | Self::Skipped)
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Submitted => write!(f, "submitted"),
            Self::AwaitApproval => write!(f, "await_approval"),
            Self::Complete => write!(f, "complete"),
            Self::Skipped => write!(f, "skipped"),
            Self::Canceled => write!(f, "canceled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A status kind plus the reason it was entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepStatus {
    pub kind: StatusKind,
    pub reason: Option<String>,
}

impl StepStatus {
    pub fn pending() -> Self {
        Self { kind: StatusKind::Pending, reason: None }
    }

    pub fn pending_reason(reason: &str) -> Self {
        Self { kind: StatusKind::Pending, reason: Some(reason.to_string()) }
    }

    pub fn submitted(reason: &str) -> Self {
        Self { kind: StatusKind::Submitted, reason: Some(reason.to_string()) }
    }

    pub fn await_approval(reason: &str) -> Self {
        Self { kind: StatusKind::AwaitApproval, reason: Some(reason.to_string()) }
    }

    pub fn complete() -> Self {
        Self { kind: StatusKind::Complete, reason: None }
    }

    pub fn complete_reason(reason: &str) -> Self {
        Self { kind: StatusKind::Complete, reason: Some(reason.to_string()) }
    }

    pub fn skipped(reason: &str) -> Self {
        Self { kind: StatusKind::Skipped, reason: Some(reason.to_string()) }
    }

    pub fn canceled(reason: &str) -> Self {
        Self { kind: StatusKind::Canceled, reason: Some(reason.to_string()) }
    }

    pub fn failed(reason: &str) -> Self {
        Self { kind: StatusKind::Failed, reason: Some(reason.to_string()) }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    pub fn is_ok(&self) -> bool {
        self.kind.is_ok()
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{} ({})", self.kind, reason),
            None => write!(f, "{}", self.kind),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_types_config_parse() {
        let yaml = r#"
namespace: prod
stacks:
  - name: vpc
    template_path: templates/vpc.yaml
  - name: bastion
    template_path: templates/bastion.yaml
    variables:
      VpcId: ${output vpc::Id}
    requires: [vpc]
tags:
  team: infra
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.namespace, "prod");
        assert_eq!(config.namespace_delimiter, "-");
        assert_eq!(config.stacks.len(), 2);
        assert_eq!(config.stacks[0].name, "vpc");
        assert!(config.stacks[0].enabled);
        assert_eq!(config.stacks[1].requires, vec!["vpc"]);
        assert_eq!(config.tags["team"], "infra");
    }

    #[test]
    fn test_types_stack_def_defaults() {
        let yaml = r#"
name: app
template_path: app.yaml
"#;
        let def: StackDef = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(def.enabled);
        assert!(!def.locked);
        assert!(!def.protected);
        assert!(!def.external);
        assert_eq!(def.stack_name(), "app");
        assert_eq!(def.in_progress_behavior, InProgressBehavior::Error);
    }

    #[test]
    fn test_types_stack_def_unknown_key_rejected() {
        let yaml = r#"
name: app
template_path: app.yaml
no_such_key: true
"#;
        let result: Result<StackDef, _> = serde_yaml_ng::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_types_stack_name_override() {
        let yaml = r#"
name: app
stack_name: application
template_path: app.yaml
"#;
        let def: StackDef = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.stack_name(), "application");
    }

    #[test]
    fn test_types_top_level_extra_keys_kept() {
        let yaml = r#"
namespace: test
common_variables: &common
  Env: test
stacks: []
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(config.extra.contains_key("common_variables"));
    }

    #[test]
    fn test_types_hook_def() {
        let yaml = r#"
path: command
args:
  command: "echo ready"
data_key: readiness
"#;
        let hook: HookDef = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(hook.enabled);
        assert!(hook.required);
        assert_eq!(hook.label(), "command");
        assert_eq!(hook.data_key.as_deref(), Some("readiness"));
    }

    #[test]
    fn test_types_status_ordering() {
        assert!(StatusKind::Pending < StatusKind::Submitted);
        assert!(StatusKind::Submitted < StatusKind::Complete);
    }

    #[test]
    fn test_types_status_terminal() {
        assert!(!StatusKind::Pending.is_terminal());
        assert!(!StatusKind::Submitted.is_terminal());
        assert!(!StatusKind::AwaitApproval.is_terminal());
        assert!(StatusKind::Complete.is_terminal());
        assert!(StatusKind::Skipped.is_terminal());
        assert!(StatusKind::Canceled.is_terminal());
        assert!(StatusKind::Failed.is_terminal());
    }

    #[test]
    fn test_types_status_ok() {
        assert!(StatusKind::Complete.is_ok());
        assert!(StatusKind::Skipped.is_ok());
        assert!(!StatusKind::Failed.is_ok());
        assert!(!StatusKind::Canceled.is_ok());
    }

    #[test]
    fn test_types_status_display() {
        assert_eq!(StepStatus::complete().to_string(), "complete");
        assert_eq!(
            StepStatus::skipped("locked").to_string(),
            "skipped (locked)"
        );
        assert_eq!(
            StepStatus::failed("rolled back new stack").to_string(),
            "failed (rolled back new stack)"
        );
    }

    #[test]
    fn test_types_action_display() {
        assert_eq!(ActionKind::Build.to_string(), "build");
        assert_eq!(StepAction::CreateOrUpdate.to_string(), "create_or_update");
        assert_eq!(HookPhase::PreDestroy.to_string(), "pre_destroy");
    }

    #[test]
    fn test_types_in_progress_behavior_parse() {
        let def: StackDef = serde_yaml_ng::from_str(
            r#"
name: app
template_path: app.yaml
in_progress_behavior: wait
"#,
        )
        .unwrap();
        assert_eq!(def.in_progress_behavior, InProgressBehavior::Wait);
    }
}
