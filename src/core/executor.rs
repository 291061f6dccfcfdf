//! Plan execution.
//!
//! Walks the plan graph with bounded parallelism and drives each step's
//! state machine against the provider: describe, submit, poll, settle.
//! Steps re-resolve their variables at dispatch so they observe the
//! outputs of every predecessor. Failures cancel dependents; independent
//! subgraphs keep going.

use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::context::Context;
use super::persist::{LockToken, ObjectStore, PersistedGraph, StoreError};
use super::planner::{Plan, Step};
use super::stack::StackError;
use super::types::{InProgressBehavior, StatusKind, StepAction, StepStatus};
use super::walker::{self, Dispatch};
use crate::diff;
use crate::events::EventBus;
use crate::lookups::LookupRegistry;
use crate::provider::{
    with_retries, ChangeSetSummary, Provider, ProviderError, StackDescription, StackStatus,
    StackSubmission,
};

/// Poll interval between describe calls, `APILAR_STACK_POLL_TIME` seconds.
pub fn poll_interval_from_env() -> Duration {
    std::env::var("APILAR_STACK_POLL_TIME")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(5))
}

/// Per-step operation deadline, `APILAR_STACK_OPERATION_TIMEOUT` seconds.
pub fn operation_timeout_from_env() -> Duration {
    std::env::var("APILAR_STACK_OPERATION_TIMEOUT")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(2 * 60 * 60))
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("persistent graph update failed: {0}")]
    Store(#[from] StoreError),
}

/// Decision from an approval source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
    Approve,
    Decline,
}

/// Who answers change-set approval requests. A terminal prompt in the
/// CLI; scripted responders in tests.
pub trait ApprovalSource: Send + Sync {
    fn decide(&self, step: &str, summary: &ChangeSetSummary) -> Approval;
}

/// Approves everything; non-interactive default.
pub struct AutoApprove;

impl ApprovalSource for AutoApprove {
    fn decide(&self, _step: &str, _summary: &ChangeSetSummary) -> Approval {
        Approval::Approve
    }
}

/// Declines everything.
pub struct AutoDecline;

impl ApprovalSource for AutoDecline {
    fn decide(&self, _step: &str, _summary: &ChangeSetSummary) -> Approval {
        Approval::Decline
    }
}

/// Execution tuning and mode flags.
pub struct ExecOptions {
    /// Worker bound; 0 derives from the workload
    pub concurrency: usize,
    pub interactive: bool,
    pub replacements_only: bool,
    pub recreate_failed: bool,
    pub tail: bool,
    pub poll_interval: Duration,
    pub operation_timeout: Duration,
    /// Output directory for the dump action
    pub dump_dir: Option<PathBuf>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            concurrency: 0,
            interactive: false,
            replacements_only: false,
            recreate_failed: false,
            tail: false,
            poll_interval: poll_interval_from_env(),
            operation_timeout: operation_timeout_from_env(),
            dump_dir: None,
        }
    }
}

/// Final status of every step after one execution.
pub struct ExecReport {
    pub outcomes: IndexMap<String, StepStatus>,
}

impl ExecReport {
    pub fn failed(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, s)| s.kind == StatusKind::Failed)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    pub fn canceled(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, s)| s.kind == StatusKind::Canceled)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failed().is_empty() && self.canceled().is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

struct PersistSession<'a> {
    store: &'a dyn ObjectStore,
    key: String,
    token: LockToken,
    graph: Mutex<PersistedGraph>,
}

/// Executes one plan.
pub struct Executor<'a> {
    pub ctx: &'a Context,
    pub provider: &'a dyn Provider,
    pub lookups: &'a LookupRegistry,
    pub bus: &'a EventBus,
    pub approval: &'a dyn ApprovalSource,
    pub options: ExecOptions,
    /// Rendered templates upload here when the config names a bucket
    pub artifacts: Option<&'a dyn crate::core::persist::ArtifactStore>,
}

struct StepState<'a> {
    step: &'a Step,
    status: Mutex<StepStatus>,
}

/// Scratch carried across one step's poll iterations.
#[derive(Default)]
struct Scratch {
    submission: Option<StackSubmission>,
    change_set: Option<ChangeSetSummary>,
    recreating: bool,
    started: Option<Instant>,
}

impl<'a> Executor<'a> {
    /// Walk the plan. Per-step state machines emit an event on every
    /// transition; the report carries each step's terminal status.
    pub fn execute(
        &self,
        plan: &Plan,
        store: Option<&dyn ObjectStore>,
    ) -> Result<ExecReport, ExecError> {
        let persist = match (&plan.persisted, &plan.lock, store) {
            (Some(graph), Some(token), Some(store)) => Some(PersistSession {
                store,
                key: token.key.clone(),
                token: token.clone(),
                graph: Mutex::new(graph.clone()),
            }),
            _ => None,
        };

        let states: IndexMap<String, StepState> = plan
            .steps
            .iter()
            .map(|(name, step)| {
                (
                    name.clone(),
                    StepState { step, status: Mutex::new(step.status.clone()) },
                )
            })
            .collect();

        // Deferred errors surface after every step has had its chance
        let deferred: Mutex<Option<StoreError>> = Mutex::new(None);

        let concurrency = if self.options.concurrency == 0 {
            states.len().max(1)
        } else {
            self.options.concurrency
        };

        walker::walk(&plan.graph, concurrency, &self.ctx.cancel, |name, dispatch| {
            let state = &states[name];
            match dispatch {
                Dispatch::Run => self.run_step(plan, state, persist.as_ref(), &deferred),
                Dispatch::DependencyFailed => {
                    self.finish(state, StepStatus::canceled("dependency has failed"), None);
                    false
                }
                Dispatch::Canceled => {
                    self.finish(state, StepStatus::canceled("canceled"), None);
                    false
                }
            }
        });

        if let Some(persist) = &persist {
            let _ = persist.store.release(&persist.token);
        }

        let outcomes = states
            .iter()
            .map(|(name, state)| (name.clone(), state.status.lock().expect("status").clone()))
            .collect();

        if let Some(error) = deferred.into_inner().expect("deferred lock") {
            return Err(error.into());
        }

        Ok(ExecReport { outcomes })
    }

    fn run_step(
        &self,
        plan: &Plan,
        state: &StepState,
        persist: Option<&PersistSession>,
        deferred: &Mutex<Option<StoreError>>,
    ) -> bool {
        let mut scratch = Scratch { started: Some(Instant::now()), ..Default::default() };

        loop {
            if self.ctx.cancel.is_canceled() {
                self.abort_change_set(&mut scratch);
                self.finish(state, StepStatus::canceled("canceled"), None);
                return false;
            }

            let current = state.status.lock().expect("status").clone();
            let (next, detail) = match self.step_once(state.step, &current, &mut scratch) {
                Ok(outcome) => outcome,
                Err(fault) => (StepStatus::failed(&fault.to_string()), None),
            };

            let timed_out = scratch
                .started
                .is_some_and(|t| t.elapsed() > self.options.operation_timeout);
            let next = if !next.is_terminal() && timed_out {
                StepStatus::failed("timed out")
            } else {
                next
            };

            if next.is_terminal() {
                self.record_persist(plan, state.step, &next, persist, deferred);
                let detail = self.terminal_detail(state.step, detail);
                let ok = next.is_ok();
                self.finish(state, next, detail);
                return ok;
            }

            // Approval prompts should not sit behind a poll delay
            let pause = next.kind != StatusKind::AwaitApproval;
            self.transition(state, next, detail);

            if pause && self.ctx.cancel.wait(self.options.poll_interval) {
                self.abort_change_set(&mut scratch);
                self.finish(state, StepStatus::canceled("canceled"), None);
                return false;
            }
        }
    }

    /// Best-effort abort of an in-flight, unapplied change set.
    fn abort_change_set(&self, scratch: &mut Scratch) {
        if let Some(summary) = scratch.change_set.take() {
            let _ = self.provider.delete_change_set(&summary.id);
        }
    }

    /// Attach recent provider log lines when tailing.
    fn terminal_detail(
        &self,
        step: &Step,
        detail: Option<serde_json::Value>,
    ) -> Option<serde_json::Value> {
        if !self.options.tail {
            return detail;
        }
        let lines = self
            .provider
            .tail(&step.stack.fqn, 0)
            .unwrap_or_default()
            .into_iter()
            .map(|e| {
                serde_json::json!({
                    "status": e.status,
                    "reason": e.reason,
                })
            })
            .collect::<Vec<_>>();
        match detail {
            Some(mut value) => {
                if let Some(map) = value.as_object_mut() {
                    map.insert("tail".to_string(), serde_json::Value::Array(lines));
                }
                Some(value)
            }
            None => Some(serde_json::json!({ "tail": lines })),
        }
    }

    /// Maintain the persisted graph as steps settle. Builds record a stack
    /// only once it actually reconciles; destroys drop it once it is gone.
    fn record_persist(
        &self,
        plan: &Plan,
        step: &Step,
        terminal: &StepStatus,
        persist: Option<&PersistSession>,
        deferred: &Mutex<Option<StoreError>>,
    ) {
        let Some(persist) = persist else {
            return;
        };
        let mut graph = persist.graph.lock().expect("persist lock");
        match step.action {
            StepAction::CreateOrUpdate if terminal.kind == StatusKind::Complete => {
                let deps: Vec<String> = plan
                    .graph
                    .deps_of(&step.name)
                    .iter()
                    .map(|d| d.to_string())
                    .collect();
                graph.add(&step.name, &deps);
            }
            StepAction::Destroy if terminal.is_ok() => {
                graph.remove(&step.name);
            }
            _ => return,
        }
        if let Err(error) = graph.save(persist.store, &persist.key, &persist.token) {
            let mut slot = deferred.lock().expect("deferred lock");
            slot.get_or_insert(error);
        }
    }

    fn transition(
        &self,
        state: &StepState,
        next: StepStatus,
        detail: Option<serde_json::Value>,
    ) {
        let mut status = state.status.lock().expect("status");
        if *status == next || status.is_terminal() {
            return;
        }
        self.bus.emit(
            &state.step.name,
            status.kind,
            next.kind,
            next.reason.as_deref(),
            detail,
        );
        *status = next;
    }

    fn finish(&self, state: &StepState, next: StepStatus, detail: Option<serde_json::Value>) {
        let mut status = state.status.lock().expect("status");
        if status.is_terminal() {
            return;
        }
        self.bus.emit(
            &state.step.name,
            status.kind,
            next.kind,
            next.reason.as_deref(),
            detail,
        );
        *status = next;
    }

    fn step_once(
        &self,
        step: &Step,
        current: &StepStatus,
        scratch: &mut Scratch,
    ) -> Result<(StepStatus, Option<serde_json::Value>), StepFault> {
        match step.action {
            StepAction::CreateOrUpdate => self.launch_once(step, current, scratch),
            StepAction::Destroy => self.destroy_once(step, current),
            StepAction::Diff => self.diff_once(step),
            StepAction::Dump => self.dump_once(step),
        }
    }

    fn describe(&self, fqn: &str) -> Result<Option<StackDescription>, StepFault> {
        Ok(with_retries(&self.ctx.cancel, || self.provider.describe(fqn))?)
    }

    fn submission(
        &self,
        step: &Step,
        scratch: &mut Scratch,
    ) -> Result<StackSubmission, StepFault> {
        if scratch.submission.is_none() {
            let mut submission = step
                .stack
                .resolve(self.ctx, self.provider, self.lookups)
                .map_err(StepFault::Stack)?;
            if let Some(artifacts) = self.artifacts {
                let key = format!(
                    "templates/{}.{}",
                    submission.fqn,
                    submission.template.format.extension()
                );
                let url = artifacts
                    .put_artifact(&key, submission.template.body.as_bytes())
                    .map_err(|e| StepFault::Io(key.clone(), e.to_string()))?;
                submission.template.url = Some(url);
            }
            scratch.submission = Some(submission);
        }
        Ok(scratch.submission.clone().expect("submission cached"))
    }

    // ------------------------------------------------------------------
    // create-or-update state machine
    // ------------------------------------------------------------------

    fn launch_once(
        &self,
        step: &Step,
        current: &StepStatus,
        scratch: &mut Scratch,
    ) -> Result<(StepStatus, Option<serde_json::Value>), StepFault> {
        let stack = &step.stack;

        if current.kind == StatusKind::Submitted {
            return self.poll_launch(step, current, scratch);
        }
        if current.kind == StatusKind::AwaitApproval {
            return self.settle_approval(step, scratch);
        }

        if stack.external {
            if let Some(description) = self.describe(&stack.fqn)? {
                self.ctx.set_outputs(&stack.name, description.outputs);
            }
            return Ok((StepStatus::skipped("external"), None));
        }

        if stack.locked && !stack.forced {
            if let Some(description) = self.describe(&stack.fqn)? {
                self.ctx.set_outputs(&stack.name, description.outputs);
            }
            return Ok((StepStatus::skipped("locked"), None));
        }

        let description = self.describe(&stack.fqn)?;
        let description = match description {
            None => return self.create_new(step, scratch),
            Some(d) if d.status == StackStatus::DeleteComplete => {
                return self.create_new(step, scratch)
            }
            Some(d) => d,
        };

        if description.status.is_in_progress() {
            return match stack.in_progress_behavior {
                InProgressBehavior::Wait => Ok((
                    StepStatus::pending_reason("waiting on in-progress stack"),
                    None,
                )),
                InProgressBehavior::Error => Ok((
                    StepStatus::failed("stack operation already in progress"),
                    None,
                )),
            };
        }

        if matches!(description.status, StackStatus::RolledBack | StackStatus::Failed) {
            if self.options.recreate_failed {
                with_retries(&self.ctx.cancel, || self.provider.destroy(&stack.fqn))?;
                scratch.recreating = true;
                return Ok((
                    StepStatus::submitted("destroying stack for re-creation"),
                    None,
                ));
            }
            return Ok((
                StepStatus::failed("stack is in a failed state; use --recreate-failed"),
                None,
            ));
        }

        // Existing healthy stack: compute the update
        if self.options.interactive || stack.protected {
            return self.interactive_update(step, scratch);
        }

        let submission = self.submission(step, scratch)?;
        match with_retries(&self.ctx.cancel, || self.provider.update(&submission)) {
            Ok(_) => Ok((StepStatus::submitted("updating existing stack"), None)),
            Err(ProviderError::NoUpdates(_)) => {
                self.ctx.set_outputs(&stack.name, description.outputs.clone());
                Ok((StepStatus::skipped("nochange"), None))
            }
            Err(error) => Err(error.into()),
        }
    }

    fn create_new(
        &self,
        step: &Step,
        scratch: &mut Scratch,
    ) -> Result<(StepStatus, Option<serde_json::Value>), StepFault> {
        let submission = self.submission(step, scratch)?;
        with_retries(&self.ctx.cancel, || self.provider.create(&submission))?;
        let reason = if scratch.recreating {
            "re-creating stack"
        } else {
            "creating new stack"
        };
        Ok((StepStatus::submitted(reason), None))
    }

    /// Change-set flow, first half: compute the proposal. Empty change
    /// sets settle as nochange; auto-approvable ones apply immediately;
    /// the rest park in AWAIT_APPROVAL with the summary as event detail.
    fn interactive_update(
        &self,
        step: &Step,
        scratch: &mut Scratch,
    ) -> Result<(StepStatus, Option<serde_json::Value>), StepFault> {
        let stack = &step.stack;
        let submission = self.submission(step, scratch)?;
        let summary =
            with_retries(&self.ctx.cancel, || self.provider.plan_change_set(&submission))?;

        if summary.is_empty() {
            let _ = self.provider.delete_change_set(&summary.id);
            if let Some(description) = self.describe(&stack.fqn)? {
                self.ctx.set_outputs(&stack.name, description.outputs);
            }
            return Ok((StepStatus::skipped("nochange"), None));
        }

        if self.options.replacements_only && !summary.has_replacements() {
            with_retries(&self.ctx.cancel, || {
                self.provider.apply_change_set(&summary.id)
            })?;
            return Ok((StepStatus::submitted("updating existing stack"), None));
        }

        let detail = summary.to_detail();
        scratch.change_set = Some(summary);
        Ok((
            StepStatus::await_approval("change set proposed"),
            Some(detail),
        ))
    }

    /// Change-set flow, second half: block on the approval source.
    fn settle_approval(
        &self,
        step: &Step,
        scratch: &mut Scratch,
    ) -> Result<(StepStatus, Option<serde_json::Value>), StepFault> {
        let summary = scratch
            .change_set
            .take()
            .expect("approval settles a proposed change set");

        if self.approval.decide(&step.name, &summary) != Approval::Approve {
            let _ = self.provider.delete_change_set(&summary.id);
            return Ok((StepStatus::skipped("canceled execution"), None));
        }

        with_retries(&self.ctx.cancel, || {
            self.provider.apply_change_set(&summary.id)
        })?;
        Ok((StepStatus::submitted("updating existing stack"), None))
    }

    fn poll_launch(
        &self,
        step: &Step,
        current: &StepStatus,
        scratch: &mut Scratch,
    ) -> Result<(StepStatus, Option<serde_json::Value>), StepFault> {
        let stack = &step.stack;
        let description = self.describe(&stack.fqn)?;

        let recreating_done = scratch.recreating
            && description
                .as_ref()
                .map_or(true, |d| d.status == StackStatus::DeleteComplete);
        if recreating_done {
            return self.create_new(step, scratch);
        }

        let Some(description) = description else {
            return Ok((
                StepStatus::failed("stack disappeared during operation"),
                None,
            ));
        };

        match description.status {
            StackStatus::InProgress | StackStatus::DeleteInProgress => Ok((current.clone(), None)),
            StackStatus::Complete => {
                self.ctx.set_outputs(&stack.name, description.outputs.clone());
                Ok((StepStatus::complete(), None))
            }
            StackStatus::RolledBack | StackStatus::Failed => {
                let reason = match current.reason.as_deref() {
                    Some("creating new stack") | Some("re-creating stack") => {
                        "rolled back new stack"
                    }
                    Some("updating existing stack") => "rolled back update",
                    _ => "rolled back",
                };
                Ok((StepStatus::failed(reason), None))
            }
            StackStatus::DeleteComplete => Ok((
                StepStatus::failed("stack was deleted during operation"),
                None,
            )),
        }
    }

    // ------------------------------------------------------------------
    // destroy state machine
    // ------------------------------------------------------------------

    fn destroy_once(
        &self,
        step: &Step,
        current: &StepStatus,
    ) -> Result<(StepStatus, Option<serde_json::Value>), StepFault> {
        let stack = &step.stack;
        let submitted = current.kind == StatusKind::Submitted;

        let gone = |submitted: bool| {
            if submitted {
                (StepStatus::complete_reason("stack destroyed"), None)
            } else {
                (StepStatus::skipped("already destroyed"), None)
            }
        };

        let description = match self.describe(&stack.fqn)? {
            None => return Ok(gone(submitted)),
            Some(d) => d,
        };

        match description.status {
            StackStatus::DeleteComplete => Ok(gone(submitted)),
            status if status.is_in_progress() => {
                Ok((StepStatus::submitted("submitted for destruction"), None))
            }
            _ => {
                match with_retries(&self.ctx.cancel, || self.provider.destroy(&stack.fqn)) {
                    Ok(_) => Ok((StepStatus::submitted("submitted for destruction"), None)),
                    Err(ProviderError::StackDeleted(_)) => Ok(gone(submitted)),
                    Err(error) => Err(error.into()),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // diff and dump
    // ------------------------------------------------------------------

    fn diff_once(
        &self,
        step: &Step,
    ) -> Result<(StepStatus, Option<serde_json::Value>), StepFault> {
        let stack = &step.stack;
        if stack.locked && !stack.forced {
            return Ok((StepStatus::skipped("locked"), None));
        }
        if stack.external {
            return Ok((StepStatus::skipped("external"), None));
        }

        let submission = step
            .stack
            .resolve(self.ctx, self.provider, self.lookups)
            .map_err(StepFault::Stack)?;
        let new_params: std::collections::BTreeMap<String, String> = submission
            .parameters
            .iter()
            .map(|p| {
                let value = if p.no_echo { "****".to_string() } else { p.value.clone() };
                (p.key.clone(), value)
            })
            .collect();

        let description = self.describe(&stack.fqn)?;
        let old_params = description
            .as_ref()
            .map(|d| d.parameters.clone())
            .unwrap_or_default();

        let (changed, changes) = diff::diff_dictionaries(&old_params, &new_params);
        let detail = serde_json::json!({
            "new_stack": description.is_none(),
            "parameters": diff::params_diff_detail(&changes),
        });

        if changed == 0 && description.is_some() {
            Ok((StepStatus::skipped("nochange"), Some(detail)))
        } else {
            Ok((StepStatus::complete_reason("diff computed"), Some(detail)))
        }
    }

    fn dump_once(
        &self,
        step: &Step,
    ) -> Result<(StepStatus, Option<serde_json::Value>), StepFault> {
        let directory = self
            .options
            .dump_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let submission = step
            .stack
            .resolve(self.ctx, self.provider, self.lookups)
            .map_err(StepFault::Stack)?;

        let filename = format!("{}.{}", step.name, submission.template.format.extension());
        let path = directory.join(filename);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StepFault::Io(path.display().to_string(), e.to_string()))?;
        }
        std::fs::write(&path, submission.template.body.as_bytes())
            .map_err(|e| StepFault::Io(path.display().to_string(), e.to_string()))?;

        Ok((
            StepStatus::complete_reason("template written"),
            Some(serde_json::json!({ "path": path.display().to_string() })),
        ))
    }
}

/// Why a single step iteration failed.
#[derive(Debug, Error)]
enum StepFault {
    #[error("{0}")]
    Stack(StackError),

    #[error("{0}")]
    Provider(#[from] ProviderError),

    #[error("cannot write {0}: {1}")]
    Io(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::BlueprintRegistry;
    use crate::core::persist::{MemoryStore, ObjectStore};
    use crate::core::planner::{build_plan, PlanRequest};
    use crate::core::types::{ActionKind, Config};
    use crate::events::{CollectingReporter, Reporter, StepEvent};
    use crate::provider::memory::{Behavior, MemoryProvider};
    use std::sync::Arc;

    struct Shared(Arc<CollectingReporter>);
    impl Reporter for Shared {
        fn report(&self, event: &StepEvent) {
            self.0.report(event);
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        provider: MemoryProvider,
        collector: Arc<CollectingReporter>,
        bus: EventBus,
        lookups: LookupRegistry,
    }

    impl Harness {
        fn new() -> Self {
            let bus = EventBus::new();
            let collector = Arc::new(CollectingReporter::new());
            bus.subscribe(Box::new(Shared(collector.clone())));
            Self {
                dir: tempfile::tempdir().unwrap(),
                provider: MemoryProvider::new("us-east-1"),
                collector,
                bus,
                lookups: LookupRegistry::with_builtins(),
            }
        }

        fn write_template(&self, name: &str) {
            std::fs::write(
                self.dir.path().join(format!("{}.yaml", name)),
                "Parameters:\n  VpcId:\n    Type: String\n    Default: none\nResources: {}\n",
            )
            .unwrap();
        }

        fn plan(
            &self,
            yaml: &str,
            request: &PlanRequest,
            store: Option<&dyn ObjectStore>,
        ) -> (Config, Context, Plan) {
            let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
            let mut ctx = Context::for_namespace(&config.namespace);
            ctx.config_dir = self.dir.path().to_path_buf();
            let blueprints = BlueprintRegistry::new();
            let plan = build_plan(&config, &ctx, &blueprints, request, store).unwrap();
            (config, ctx, plan)
        }

        fn options() -> ExecOptions {
            ExecOptions {
                poll_interval: Duration::ZERO,
                operation_timeout: Duration::from_secs(30),
                ..Default::default()
            }
        }

        fn execute_with(
            &self,
            ctx: &Context,
            plan: &Plan,
            options: ExecOptions,
            approval: &dyn ApprovalSource,
            store: Option<&dyn ObjectStore>,
        ) -> ExecReport {
            let executor = Executor {
                ctx,
                provider: &self.provider,
                lookups: &self.lookups,
                bus: &self.bus,
                approval,
                options,
                artifacts: None,
            };
            executor.execute(plan, store).unwrap()
        }

        fn step_events(&self, step: &str) -> Vec<StepEvent> {
            self.collector
                .events()
                .into_iter()
                .filter(|e| e.step_id == step)
                .collect()
        }
    }

    const LINEAR: &str = r#"
namespace: ns
stacks:
  - name: vpc
    template_path: vpc.yaml
  - name: bastion
    template_path: bastion.yaml
    variables:
      VpcId: ${output vpc::Id}
"#;

    /// Linear dependency: create both stacks in order, outputs flow.
    #[test]
    fn test_executor_linear_create() {
        let harness = Harness::new();
        harness.write_template("vpc");
        harness.write_template("bastion");
        harness
            .provider
            .set_behavior("ns-vpc", Behavior::with_outputs(&[("Id", "vpc-1")]));

        let (_, ctx, plan) = harness.plan(LINEAR, &PlanRequest::default(), None);
        let report = harness.execute_with(&ctx, &plan, Harness::options(), &AutoApprove, None);

        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);

        let vpc_events = harness.step_events("vpc");
        assert_eq!(vpc_events[0].to, StatusKind::Submitted);
        assert_eq!(vpc_events[0].reason.as_deref(), Some("creating new stack"));
        assert_eq!(vpc_events.last().unwrap().to, StatusKind::Complete);

        let bastion_events = harness.step_events("bastion");
        assert_eq!(bastion_events[0].to, StatusKind::Submitted);
        assert_eq!(bastion_events[0].reason.as_deref(), Some("creating new stack"));
        assert_eq!(bastion_events.last().unwrap().to, StatusKind::Complete);

        // bastion observed the vpc output
        assert_eq!(ctx.output("vpc", "Id").as_deref(), Some("vpc-1"));
        let description = harness.provider.describe("ns-bastion").unwrap().unwrap();
        assert_eq!(description.parameters["VpcId"], "vpc-1");
    }

    /// Exactly one terminal event per step; per-step prefix order holds.
    #[test]
    fn test_executor_single_terminal_event() {
        let harness = Harness::new();
        harness.write_template("vpc");
        harness.write_template("bastion");
        let (_, ctx, plan) = harness.plan(LINEAR, &PlanRequest::default(), None);
        harness.execute_with(&ctx, &plan, Harness::options(), &AutoApprove, None);

        for step in ["vpc", "bastion"] {
            let events = harness.step_events(step);
            let terminal = events.iter().filter(|e| e.to.is_terminal()).count();
            assert_eq!(terminal, 1, "step {} terminal events", step);
            // statuses only move forward
            for pair in events.windows(2) {
                assert!(pair[0].to <= pair[1].to || pair[1].to.is_terminal());
            }
        }
    }

    /// Locked stack skipped but its live outputs feed consumers.
    #[test]
    fn test_executor_locked_stack() {
        let harness = Harness::new();
        harness.write_template("app");
        let yaml = r#"
namespace: ns
stacks:
  - name: vpc
    locked: true
  - name: app
    template_path: app.yaml
    variables:
      VpcId: ${output vpc::Id}
"#;
        let mut outputs = std::collections::BTreeMap::new();
        outputs.insert("Id".to_string(), "vpc-9".to_string());
        harness.provider.register_stack("ns-vpc", outputs);

        let (_, ctx, plan) = harness.plan(yaml, &PlanRequest::default(), None);
        let report = harness.execute_with(&ctx, &plan, Harness::options(), &AutoApprove, None);

        assert!(report.is_success());
        let vpc_events = harness.step_events("vpc");
        assert_eq!(vpc_events.len(), 1);
        assert_eq!(vpc_events[0].to, StatusKind::Skipped);
        assert_eq!(vpc_events[0].reason.as_deref(), Some("locked"));

        let description = harness.provider.describe("ns-app").unwrap().unwrap();
        assert_eq!(description.parameters["VpcId"], "vpc-9");
    }

    /// Partial failure: dependents canceled, independents continue, exit 1.
    #[test]
    fn test_executor_partial_failure() {
        let harness = Harness::new();
        for name in ["a", "b", "c"] {
            harness.write_template(name);
        }
        let yaml = r#"
namespace: ns
stacks:
  - name: a
    template_path: a.yaml
  - name: b
    template_path: b.yaml
  - name: c
    template_path: c.yaml
    requires: [a]
"#;
        harness
            .provider
            .set_behavior("ns-a", Behavior { fail_create: true, ..Default::default() });

        let (_, ctx, plan) = harness.plan(yaml, &PlanRequest::default(), None);
        let mut options = Harness::options();
        options.concurrency = 2;
        let report = harness.execute_with(&ctx, &plan, options, &AutoApprove, None);

        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.outcomes["a"].kind, StatusKind::Failed);
        assert_eq!(
            report.outcomes["a"].reason.as_deref(),
            Some("rolled back new stack")
        );
        assert_eq!(report.outcomes["b"].kind, StatusKind::Complete);
        assert_eq!(report.outcomes["c"].kind, StatusKind::Canceled);
        assert_eq!(
            report.outcomes["c"].reason.as_deref(),
            Some("dependency has failed")
        );
    }

    /// Unchanged stacks settle as skipped (nochange).
    #[test]
    fn test_executor_nochange_update() {
        let harness = Harness::new();
        harness.write_template("vpc");
        let yaml = r#"
namespace: ns
stacks:
  - name: vpc
    template_path: vpc.yaml
    variables:
      VpcId: vpc-static
"#;
        let (_, ctx, plan) = harness.plan(yaml, &PlanRequest::default(), None);
        // first build creates
        let report = harness.execute_with(&ctx, &plan, Harness::options(), &AutoApprove, None);
        assert!(report.is_success());

        // second build: identical submission -> nochange
        let (_, ctx2, plan2) = harness.plan(yaml, &PlanRequest::default(), None);
        let report = harness.execute_with(&ctx2, &plan2, Harness::options(), &AutoApprove, None);
        assert_eq!(report.outcomes["vpc"].kind, StatusKind::Skipped);
        assert_eq!(report.outcomes["vpc"].reason.as_deref(), Some("nochange"));
    }

    /// Persistent graph: removed stack destroyed, object updated, lock freed.
    #[test]
    fn test_executor_persistent_graph_prune() {
        let harness = Harness::new();
        harness.write_template("vpc");
        harness.write_template("bastion");
        let store = MemoryStore::new();
        store
            .put(
                "ns.json",
                br#"{"version":1,"nodes":{"vpc":[],"bastion":["vpc"],"other":[]}}"#,
            )
            .unwrap();
        harness
            .provider
            .register_stack("ns-other", std::collections::BTreeMap::new());

        let yaml = r#"
namespace: ns
persistent_graph_key: ns.json
stacks:
  - name: vpc
    template_path: vpc.yaml
  - name: bastion
    template_path: bastion.yaml
    requires: [vpc]
"#;
        let (_, ctx, plan) = harness.plan(yaml, &PlanRequest::default(), Some(&store));
        let report =
            harness.execute_with(&ctx, &plan, Harness::options(), &AutoApprove, Some(&store));
        assert!(report.is_success());

        let other_events = harness.step_events("other");
        assert_eq!(other_events[0].to, StatusKind::Submitted);
        assert_eq!(
            other_events[0].reason.as_deref(),
            Some("submitted for destruction")
        );
        assert_eq!(other_events.last().unwrap().to, StatusKind::Complete);
        assert_eq!(
            other_events.last().unwrap().reason.as_deref(),
            Some("stack destroyed")
        );

        // stored graph no longer mentions the pruned stack; lock released
        let body = store.get("ns.json").unwrap().unwrap();
        let stored: crate::core::persist::PersistedGraph =
            serde_json::from_slice(&body).unwrap();
        assert!(!stored.contains("other"));
        assert!(stored.contains("vpc"));
        assert!(stored.contains("bastion"));
        assert!(!store.is_locked("ns.json"));
    }

    /// Interactive replacements-only: non-replacing changes auto-apply,
    /// replacing changes await approval and skip on decline.
    #[test]
    fn test_executor_replacements_only_approval() {
        let harness = Harness::new();
        harness.write_template("safe");
        harness.write_template("risky");
        let yaml = r#"
namespace: ns
stacks:
  - name: safe
    template_path: safe.yaml
    variables:
      VpcId: new-value
  - name: risky
    template_path: risky.yaml
    variables:
      VpcId: new-value
"#;
        // both stacks exist with an old parameter value
        for (name, replaces) in [("safe", false), ("risky", true)] {
            let fqn = format!("ns-{}", name);
            let old = crate::provider::StackSubmission {
                fqn: fqn.clone(),
                template: crate::blueprint::Template::new(
                    "old",
                    crate::blueprint::TemplateFormat::Yaml,
                ),
                parameters: vec![crate::variables::Parameter {
                    key: "VpcId".to_string(),
                    value: "old-value".to_string(),
                    no_echo: false,
                }],
                tags: Default::default(),
                stack_policy: None,
                service_role: None,
                notification_arns: Vec::new(),
            };
            harness.provider.register_stack_matching(&old);
            let behavior = Behavior {
                replacement_keys: if replaces {
                    vec!["VpcId".to_string()]
                } else {
                    Vec::new()
                },
                ..Default::default()
            };
            harness.provider.set_behavior(&fqn, behavior);
        }

        let (_, ctx, plan) = harness.plan(yaml, &PlanRequest::default(), None);
        let mut options = Harness::options();
        options.interactive = true;
        options.replacements_only = true;
        let report = harness.execute_with(&ctx, &plan, options, &AutoDecline, None);

        // non-replacing change was auto-applied
        assert_eq!(report.outcomes["safe"].kind, StatusKind::Complete);

        // replacing change proposed, declined, no apply
        assert_eq!(report.outcomes["risky"].kind, StatusKind::Skipped);
        assert_eq!(
            report.outcomes["risky"].reason.as_deref(),
            Some("canceled execution")
        );
        let events = harness.step_events("risky");
        assert!(events.iter().any(|e| e.to == StatusKind::AwaitApproval));
        let description = harness.provider.describe("ns-risky").unwrap().unwrap();
        assert_eq!(description.parameters["VpcId"], "old-value");
    }

    /// Protected stacks escalate to the approval source even without -i.
    #[test]
    fn test_executor_protected_escalates() {
        let harness = Harness::new();
        harness.write_template("prod");
        let yaml = r#"
namespace: ns
stacks:
  - name: prod
    template_path: prod.yaml
    protected: true
    variables:
      VpcId: new
"#;
        let old = crate::provider::StackSubmission {
            fqn: "ns-prod".to_string(),
            template: crate::blueprint::Template::new(
                "old",
                crate::blueprint::TemplateFormat::Yaml,
            ),
            parameters: vec![crate::variables::Parameter {
                key: "VpcId".to_string(),
                value: "old".to_string(),
                no_echo: false,
            }],
            tags: Default::default(),
            stack_policy: None,
            service_role: None,
            notification_arns: Vec::new(),
        };
        harness.provider.register_stack_matching(&old);

        let (_, ctx, plan) = harness.plan(yaml, &PlanRequest::default(), None);
        let report =
            harness.execute_with(&ctx, &plan, Harness::options(), &AutoDecline, None);
        assert_eq!(report.outcomes["prod"].kind, StatusKind::Skipped);
        assert_eq!(
            report.outcomes["prod"].reason.as_deref(),
            Some("canceled execution")
        );
    }

    /// External stacks only read outputs.
    #[test]
    fn test_executor_external_stack() {
        let harness = Harness::new();
        harness.write_template("app");
        let yaml = r#"
namespace: ns
stacks:
  - name: shared
    external: true
  - name: app
    template_path: app.yaml
    variables:
      VpcId: ${output shared::Id}
"#;
        let mut outputs = std::collections::BTreeMap::new();
        outputs.insert("Id".to_string(), "vpc-ext".to_string());
        harness.provider.register_stack("ns-shared", outputs);

        let (_, ctx, plan) = harness.plan(yaml, &PlanRequest::default(), None);
        let report = harness.execute_with(&ctx, &plan, Harness::options(), &AutoApprove, None);
        assert!(report.is_success());
        assert_eq!(report.outcomes["shared"].kind, StatusKind::Skipped);
        assert_eq!(report.outcomes["shared"].reason.as_deref(), Some("external"));
        let description = harness.provider.describe("ns-app").unwrap().unwrap();
        assert_eq!(description.parameters["VpcId"], "vpc-ext");
    }

    /// Serial execution settles steps in topological order.
    #[test]
    fn test_executor_serial_topological_terminals() {
        let harness = Harness::new();
        for name in ["a", "b", "c"] {
            harness.write_template(name);
        }
        let yaml = r#"
namespace: ns
stacks:
  - name: a
    template_path: a.yaml
  - name: b
    template_path: b.yaml
    requires: [a]
  - name: c
    template_path: c.yaml
    requires: [b]
"#;
        let (_, ctx, plan) = harness.plan(yaml, &PlanRequest::default(), None);
        let mut options = Harness::options();
        options.concurrency = 1;
        harness.execute_with(&ctx, &plan, options, &AutoApprove, None);

        let terminals: Vec<String> = harness
            .collector
            .events()
            .into_iter()
            .filter(|e| e.to.is_terminal())
            .map(|e| e.step_id)
            .collect();
        assert_eq!(terminals, vec!["a", "b", "c"]);
    }

    /// Destroy action: reverse order, already-gone stacks skipped.
    #[test]
    fn test_executor_destroy() {
        let harness = Harness::new();
        harness.write_template("vpc");
        harness.write_template("bastion");
        harness
            .provider
            .register_stack("ns-vpc", std::collections::BTreeMap::new());
        // bastion never existed

        let request = PlanRequest { action: ActionKind::Destroy, ..Default::default() };
        let (_, ctx, plan) = harness.plan(LINEAR, &request, None);
        let mut options = Harness::options();
        options.concurrency = 1;
        let report = harness.execute_with(&ctx, &plan, options, &AutoApprove, None);

        assert!(report.is_success());
        assert_eq!(report.outcomes["bastion"].kind, StatusKind::Skipped);
        assert_eq!(
            report.outcomes["bastion"].reason.as_deref(),
            Some("already destroyed")
        );
        assert_eq!(report.outcomes["vpc"].kind, StatusKind::Complete);
        assert_eq!(
            report.outcomes["vpc"].reason.as_deref(),
            Some("stack destroyed")
        );
        // bastion settles before vpc
        let terminals: Vec<String> = harness
            .collector
            .events()
            .into_iter()
            .filter(|e| e.to.is_terminal())
            .map(|e| e.step_id)
            .collect();
        assert_eq!(terminals, vec!["bastion", "vpc"]);
    }

    /// Throttled mutations retry and eventually succeed.
    #[test]
    fn test_executor_throttle_retry() {
        let harness = Harness::new();
        harness.write_template("vpc");
        let yaml = r#"
namespace: ns
stacks:
  - name: vpc
    template_path: vpc.yaml
"#;
        harness
            .provider
            .set_behavior("ns-vpc", Behavior { throttle: 1, ..Default::default() });

        let (_, ctx, plan) = harness.plan(yaml, &PlanRequest::default(), None);
        let report = harness.execute_with(&ctx, &plan, Harness::options(), &AutoApprove, None);
        assert!(report.is_success());
    }

    /// Rolled-back stack without --recreate-failed fails the step.
    #[test]
    fn test_executor_rolled_back_requires_recreate_flag() {
        let harness = Harness::new();
        harness.write_template("vpc");
        let yaml = r#"
namespace: ns
stacks:
  - name: vpc
    template_path: vpc.yaml
"#;
        harness
            .provider
            .register_stack_status("ns-vpc", StackStatus::RolledBack);

        let (_, ctx, plan) = harness.plan(yaml, &PlanRequest::default(), None);
        let report = harness.execute_with(&ctx, &plan, Harness::options(), &AutoApprove, None);
        assert_eq!(report.outcomes["vpc"].kind, StatusKind::Failed);
    }

    /// --recreate-failed destroys then re-creates a rolled-back stack.
    #[test]
    fn test_executor_recreate_failed() {
        let harness = Harness::new();
        harness.write_template("vpc");
        let yaml = r#"
namespace: ns
stacks:
  - name: vpc
    template_path: vpc.yaml
"#;
        harness
            .provider
            .register_stack_status("ns-vpc", StackStatus::RolledBack);

        let (_, ctx, plan) = harness.plan(yaml, &PlanRequest::default(), None);
        let mut options = Harness::options();
        options.recreate_failed = true;
        let report = harness.execute_with(&ctx, &plan, options, &AutoApprove, None);

        assert_eq!(report.outcomes["vpc"].kind, StatusKind::Complete);
        let events = harness.step_events("vpc");
        assert!(events
            .iter()
            .any(|e| e.reason.as_deref() == Some("destroying stack for re-creation")));
        assert!(events
            .iter()
            .any(|e| e.reason.as_deref() == Some("re-creating stack")));
    }

    /// Cancellation while a change set awaits approval deletes it.
    #[test]
    fn test_executor_cancel_aborts_pending_change_set() {
        use crate::core::context::CancellationToken;

        struct CancelOnProposal(CancellationToken);
        impl Reporter for CancelOnProposal {
            fn report(&self, event: &StepEvent) {
                if event.to == StatusKind::AwaitApproval {
                    self.0.cancel();
                }
            }
        }

        let harness = Harness::new();
        harness.write_template("prod");
        let yaml = r#"
namespace: ns
stacks:
  - name: prod
    template_path: prod.yaml
    variables:
      VpcId: new
"#;
        let old = crate::provider::StackSubmission {
            fqn: "ns-prod".to_string(),
            template: crate::blueprint::Template::new(
                "old",
                crate::blueprint::TemplateFormat::Yaml,
            ),
            parameters: vec![crate::variables::Parameter {
                key: "VpcId".to_string(),
                value: "old".to_string(),
                no_echo: false,
            }],
            tags: Default::default(),
            stack_policy: None,
            service_role: None,
            notification_arns: Vec::new(),
        };
        harness.provider.register_stack_matching(&old);

        let (_, ctx, plan) = harness.plan(yaml, &PlanRequest::default(), None);
        harness
            .bus
            .subscribe(Box::new(CancelOnProposal(ctx.cancel.clone())));

        let mut options = Harness::options();
        options.interactive = true;
        let report = harness.execute_with(&ctx, &plan, options, &AutoDecline, None);

        assert_eq!(report.outcomes["prod"].kind, StatusKind::Canceled);
        // the proposed change set was deleted, not left dangling
        let events = harness.step_events("prod");
        let proposal = events
            .iter()
            .find(|e| e.to == StatusKind::AwaitApproval)
            .expect("change set proposed");
        let id = proposal.detail.as_ref().unwrap()["change_set_id"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(harness.provider.apply_change_set(&id).is_err());
        // no update reached the stack
        let description = harness.provider.describe("ns-prod").unwrap().unwrap();
        assert_eq!(description.parameters["VpcId"], "old");
    }

    /// Cancellation settles in-flight steps as canceled.
    #[test]
    fn test_executor_cancellation() {
        let harness = Harness::new();
        harness.write_template("vpc");
        harness.write_template("bastion");
        let (_, ctx, plan) = harness.plan(LINEAR, &PlanRequest::default(), None);
        ctx.cancel.cancel();
        let report = harness.execute_with(&ctx, &plan, Harness::options(), &AutoApprove, None);
        assert_eq!(report.outcomes["vpc"].kind, StatusKind::Canceled);
        assert_eq!(report.outcomes["bastion"].kind, StatusKind::Canceled);
        assert_eq!(report.exit_code(), 1);
    }

    /// Diff produces a parameter diff detail and mutates nothing.
    #[test]
    fn test_executor_diff_action() {
        let harness = Harness::new();
        harness.write_template("vpc");
        let yaml = r#"
namespace: ns
stacks:
  - name: vpc
    template_path: vpc.yaml
    variables:
      VpcId: new-cidr
"#;
        let old = crate::provider::StackSubmission {
            fqn: "ns-vpc".to_string(),
            template: crate::blueprint::Template::new(
                "old",
                crate::blueprint::TemplateFormat::Yaml,
            ),
            parameters: vec![crate::variables::Parameter {
                key: "VpcId".to_string(),
                value: "old-cidr".to_string(),
                no_echo: false,
            }],
            tags: Default::default(),
            stack_policy: None,
            service_role: None,
            notification_arns: Vec::new(),
        };
        harness.provider.register_stack_matching(&old);

        let request = PlanRequest { action: ActionKind::Diff, ..Default::default() };
        let (_, ctx, plan) = harness.plan(yaml, &request, None);
        let report = harness.execute_with(&ctx, &plan, Harness::options(), &AutoApprove, None);

        assert_eq!(report.outcomes["vpc"].kind, StatusKind::Complete);
        let events = harness.step_events("vpc");
        let detail = events.last().unwrap().detail.as_ref().unwrap();
        assert_eq!(detail["parameters"][0]["key"], "VpcId");
        // still the old value remotely
        let description = harness.provider.describe("ns-vpc").unwrap().unwrap();
        assert_eq!(description.parameters["VpcId"], "old-cidr");
    }

    /// Dump writes rendered templates under the requested directory.
    #[test]
    fn test_executor_dump_action() {
        let harness = Harness::new();
        harness.write_template("vpc");
        let yaml = r#"
namespace: ns
stacks:
  - name: vpc
    template_path: vpc.yaml
"#;
        let request = PlanRequest { action: ActionKind::Dump, ..Default::default() };
        let (_, ctx, plan) = harness.plan(yaml, &request, None);
        let out = tempfile::tempdir().unwrap();
        let mut options = Harness::options();
        options.dump_dir = Some(out.path().to_path_buf());
        let report = harness.execute_with(&ctx, &plan, options, &AutoApprove, None);
        assert!(report.is_success());
        assert!(out.path().join("vpc.yaml").exists());
    }

    /// Execution-time resolution failure fails the step cleanly.
    #[test]
    fn test_executor_resolution_failure() {
        let harness = Harness::new();
        harness.write_template("app");
        let yaml = r#"
namespace: ns
stacks:
  - name: app
    template_path: app.yaml
    variables:
      VpcId: ${envvar APILAR_EXECUTOR_NO_SUCH_VAR}
"#;
        let (_, ctx, plan) = harness.plan(yaml, &PlanRequest::default(), None);
        let report = harness.execute_with(&ctx, &plan, Harness::options(), &AutoApprove, None);
        assert_eq!(report.outcomes["app"].kind, StatusKind::Failed);
    }

    /// In-progress stack with wait behavior polls through to submission.
    #[test]
    fn test_executor_in_progress_wait() {
        let harness = Harness::new();
        harness.write_template("vpc");
        let yaml = r#"
namespace: ns
stacks:
  - name: vpc
    template_path: vpc.yaml
    in_progress_behavior: wait
    variables:
      VpcId: changed
"#;
        // a previous invocation's update is still settling
        let old = crate::provider::StackSubmission {
            fqn: "ns-vpc".to_string(),
            template: crate::blueprint::Template::new(
                "old",
                crate::blueprint::TemplateFormat::Yaml,
            ),
            parameters: Vec::new(),
            tags: Default::default(),
            stack_policy: None,
            service_role: None,
            notification_arns: Vec::new(),
        };
        harness.provider.register_stack_matching(&old);
        harness.provider.set_behavior("ns-vpc", Behavior { ticks: 2, ..Default::default() });
        harness.provider.update(&crate::provider::StackSubmission {
            parameters: vec![crate::variables::Parameter {
                key: "Seed".to_string(),
                value: "1".to_string(),
                no_echo: false,
            }],
            ..old.clone()
        })
        .unwrap();

        let (_, ctx, plan) = harness.plan(yaml, &PlanRequest::default(), None);
        let report = harness.execute_with(&ctx, &plan, Harness::options(), &AutoApprove, None);
        assert_eq!(report.outcomes["vpc"].kind, StatusKind::Complete);
        let events = harness.step_events("vpc");
        assert!(events
            .iter()
            .any(|e| e.reason.as_deref() == Some("waiting on in-progress stack")));
    }

    /// In-progress stack with error behavior fails fast.
    #[test]
    fn test_executor_in_progress_error() {
        let harness = Harness::new();
        harness.write_template("vpc");
        let yaml = r#"
namespace: ns
stacks:
  - name: vpc
    template_path: vpc.yaml
"#;
        harness
            .provider
            .register_stack_status("ns-vpc", StackStatus::InProgress);

        let (_, ctx, plan) = harness.plan(yaml, &PlanRequest::default(), None);
        let report = harness.execute_with(&ctx, &plan, Harness::options(), &AutoApprove, None);
        assert_eq!(report.outcomes["vpc"].kind, StatusKind::Failed);
    }
}
