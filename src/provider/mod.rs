//! Cloud-control capability.
//!
//! The executor drives stacks through this trait; the concrete cloud SDK
//! adapter lives outside the core. `MemoryProvider` is the in-repo
//! reference adapter used by the test suite.

pub mod memory;

use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::blueprint::Template;
use crate::core::context::CancellationToken;
use crate::variables::Parameter;

/// Failure taxonomy surfaced by provider adapters.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The service reported the submitted template/parameters change nothing
    #[error("no updates to perform on '{0}'")]
    NoUpdates(String),

    /// Transient rate limiting; retried with backoff
    #[error("throttled by the control plane")]
    Throttled,

    #[error("stack '{0}' rolled back: {1}")]
    StackRolledBack(String, String),

    #[error("stack '{0}' does not exist")]
    StackDeleted(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("operation on '{0}' did not finish before the deadline")]
    TimedOut(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Optional facility not offered by this adapter
    #[error("operation '{0}' is not supported by this provider")]
    Unsupported(&'static str),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Errors that fail a step immediately, with no retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ValidationError(_) | Self::PermissionDenied(_) | Self::Unsupported(_)
        )
    }
}

/// Live status of a cloud stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackStatus {
    InProgress,
    Complete,
    Failed,
    RolledBack,
    DeleteInProgress,
    DeleteComplete,
}

impl StackStatus {
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::InProgress | Self::DeleteInProgress)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_in_progress()
    }
}

/// Snapshot returned by `describe`. A stack that was never created yields
/// `None` from `describe` instead.
#[derive(Debug, Clone)]
pub struct StackDescription {
    pub fqn: String,
    pub status: StackStatus,
    pub outputs: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, String>,
    /// Reason attached to the most recent status transition
    pub last_reason: Option<String>,
    pub drift_info: Option<String>,
}

/// Everything needed to create or update one stack.
#[derive(Debug, Clone)]
pub struct StackSubmission {
    pub fqn: String,
    pub template: Template,
    pub parameters: Vec<Parameter>,
    pub tags: BTreeMap<String, String>,
    pub stack_policy: Option<String>,
    pub service_role: Option<String>,
    pub notification_arns: Vec<String>,
}

/// Handle for a submitted asynchronous operation.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    pub fqn: String,
    pub kind: OperationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Update,
    Destroy,
}

/// One resource-level change inside a change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceChange {
    pub logical_id: String,
    pub detail: String,
}

/// Provider-computed preview of an update.
#[derive(Debug, Clone, Default)]
pub struct ChangeSetSummary {
    pub id: String,
    pub additions: Vec<ResourceChange>,
    pub modifications: Vec<ResourceChange>,
    pub replacements: Vec<ResourceChange>,
}

impl ChangeSetSummary {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty()
            && self.modifications.is_empty()
            && self.replacements.is_empty()
    }

    pub fn has_replacements(&self) -> bool {
        !self.replacements.is_empty()
    }

    pub fn to_detail(&self) -> serde_json::Value {
        let list = |changes: &[ResourceChange]| -> Vec<serde_json::Value> {
            changes
                .iter()
                .map(|c| serde_json::json!({"id": c.logical_id, "detail": c.detail}))
                .collect()
        };
        serde_json::json!({
            "change_set_id": self.id,
            "additions": list(&self.additions),
            "modifications": list(&self.modifications),
            "replacements": list(&self.replacements),
        })
    }
}

/// Event-log line streamed by `tail`.
#[derive(Debug, Clone)]
pub struct ProviderEvent {
    pub sequence: u64,
    pub fqn: String,
    pub status: String,
    pub reason: Option<String>,
}

/// Filters for an image search.
#[derive(Debug, Clone, Default)]
pub struct ImageQuery {
    pub owners: Vec<String>,
    pub name_regex: String,
    pub executable_users: Vec<String>,
    pub filters: BTreeMap<String, Vec<String>>,
}

/// Contract for stack reconciliation against one cloud control plane.
pub trait Provider: Send + Sync {
    fn region(&self) -> &str;

    /// Current state of a stack; `None` when it has never been created.
    fn describe(&self, fqn: &str) -> Result<Option<StackDescription>, ProviderError>;

    fn create(&self, submission: &StackSubmission) -> Result<OperationHandle, ProviderError>;

    /// Returns `NoUpdates` when the service reports no change.
    fn update(&self, submission: &StackSubmission) -> Result<OperationHandle, ProviderError>;

    fn plan_change_set(
        &self,
        submission: &StackSubmission,
    ) -> Result<ChangeSetSummary, ProviderError>;

    fn apply_change_set(&self, change_set_id: &str) -> Result<OperationHandle, ProviderError>;

    /// Best-effort abort for an unapplied change set.
    fn delete_change_set(&self, change_set_id: &str) -> Result<(), ProviderError>;

    fn destroy(&self, fqn: &str) -> Result<OperationHandle, ProviderError>;

    /// Block until the operation terminates, polling `describe`.
    fn wait(
        &self,
        handle: &OperationHandle,
        poll_interval: Duration,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<StackStatus, ProviderError> {
        let started = Instant::now();
        loop {
            if cancel.is_canceled() {
                return Err(ProviderError::Other("canceled".to_string()));
            }
            let status = match self.describe(&handle.fqn)? {
                Some(description) => description.status,
                None if handle.kind == OperationKind::Destroy => {
                    return Ok(StackStatus::DeleteComplete)
                }
                None => return Err(ProviderError::StackDeleted(handle.fqn.clone())),
            };
            if status.is_terminal() {
                return Ok(status);
            }
            if started.elapsed() >= deadline {
                return Err(ProviderError::TimedOut(handle.fqn.clone()));
            }
            if cancel.wait(poll_interval) {
                return Err(ProviderError::Other("canceled".to_string()));
            }
        }
    }

    /// Event-log entries for a stack after `since` (a sequence number).
    fn tail(&self, fqn: &str, since: u64) -> Result<Vec<ProviderEvent>, ProviderError>;

    // Optional facilities consumed by lookups.

    fn decrypt(&self, _ciphertext: &str, _region: Option<&str>) -> Result<String, ProviderError> {
        Err(ProviderError::Unsupported("decrypt"))
    }

    fn get_parameter(&self, _name: &str, _region: Option<&str>) -> Result<String, ProviderError> {
        Err(ProviderError::Unsupported("get_parameter"))
    }

    fn get_item(
        &self,
        _table: &str,
        _key_name: &str,
        _key_value: &str,
        _region: Option<&str>,
    ) -> Result<serde_json::Value, ProviderError> {
        Err(ProviderError::Unsupported("get_item"))
    }

    fn find_image(
        &self,
        _query: &ImageQuery,
        _region: Option<&str>,
    ) -> Result<String, ProviderError> {
        Err(ProviderError::Unsupported("find_image"))
    }
}

/// Fetch a single output from a live stack by fully-qualified name.
pub fn get_output(
    provider: &dyn Provider,
    fqn: &str,
    output_name: &str,
) -> Result<String, ProviderError> {
    let description = provider
        .describe(fqn)?
        .ok_or_else(|| ProviderError::StackDeleted(fqn.to_string()))?;
    description.outputs.get(output_name).cloned().ok_or_else(|| {
        ProviderError::Other(format!("output '{}' does not exist on '{}'", output_name, fqn))
    })
}

// Throttle retry policy: base 1s, factor 2, jitter +/-20%, cap 30s, max 10
// attempts. Single call site so the policy can track cloud guidance.
const RETRY_BASE_MS: u64 = 1_000;
const RETRY_CAP_MS: u64 = 30_000;
const RETRY_MAX_ATTEMPTS: u32 = 10;

/// Run `operation`, retrying `Throttled` errors with capped exponential
/// backoff. Other errors propagate immediately.
pub fn with_retries<T>(
    cancel: &CancellationToken,
    mut operation: impl FnMut() -> Result<T, ProviderError>,
) -> Result<T, ProviderError> {
    let mut attempt = 0u32;
    loop {
        match operation() {
            Err(ProviderError::Throttled) if attempt + 1 < RETRY_MAX_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                if cancel.wait(delay) {
                    return Err(ProviderError::Other("canceled".to_string()));
                }
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_MS.saturating_mul(1 << attempt.min(5)).min(RETRY_CAP_MS);
    // +/-20% jitter seeded from the clock; no RNG dependency needed
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let spread = base / 5; // 20%
    let jitter = if spread == 0 { 0 } else { nanos % (2 * spread) };
    Duration::from_millis(base - spread + jitter)
}
