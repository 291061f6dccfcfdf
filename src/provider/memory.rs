//! In-memory control-plane simulator.
//!
//! Reference adapter backing the test suite. Operations are asynchronous
//! like the real control plane: a submitted create/update/destroy stays
//! IN_PROGRESS for a scripted number of describe polls before settling,
//! and failures/rollbacks/throttling are injected per stack through
//! [`Behavior`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use regex::Regex;

use super::{
    ChangeSetSummary, ImageQuery, OperationHandle, OperationKind, Provider, ProviderError,
    ProviderEvent, ResourceChange, StackDescription, StackStatus, StackSubmission,
};

/// Scripted behavior for one stack.
#[derive(Debug, Clone)]
pub struct Behavior {
    /// Describe polls before a submitted operation terminates
    pub ticks: u32,
    /// Roll back instead of completing a create
    pub fail_create: bool,
    /// Roll back instead of completing an update
    pub fail_update: bool,
    /// Outputs published when an operation completes
    pub outputs: BTreeMap<String, String>,
    /// Throttled errors to inject before mutating calls succeed
    pub throttle: u32,
    /// Parameter keys whose modification requires replacement
    pub replacement_keys: Vec<String>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            ticks: 1,
            fail_create: false,
            fail_update: false,
            outputs: BTreeMap::new(),
            throttle: 0,
            replacement_keys: Vec::new(),
        }
    }
}

impl Behavior {
    pub fn with_outputs(pairs: &[(&str, &str)]) -> Self {
        Self {
            outputs: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
struct PendingOp {
    kind: OperationKind,
    ticks_left: u32,
    fail: bool,
    fingerprint: String,
    parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct SimStack {
    status: StackStatus,
    fingerprint: String,
    parameters: BTreeMap<String, String>,
    tags: BTreeMap<String, String>,
    outputs: BTreeMap<String, String>,
    last_reason: Option<String>,
    pending: Option<PendingOp>,
}

#[derive(Debug, Clone)]
struct SimImage {
    name: String,
    owner: String,
    created: u64,
    id: String,
}

#[derive(Default)]
struct Sim {
    stacks: HashMap<String, SimStack>,
    behaviors: HashMap<String, Behavior>,
    throttle_left: HashMap<String, u32>,
    change_sets: HashMap<String, StackSubmission>,
    next_change_set: u64,
    events: Vec<ProviderEvent>,
    secrets: HashMap<String, String>,
    parameters: HashMap<String, String>,
    items: HashMap<String, serde_json::Value>,
    images: Vec<SimImage>,
}

pub struct MemoryProvider {
    region: String,
    sim: Mutex<Sim>,
}

impl MemoryProvider {
    pub fn new(region: &str) -> Self {
        Self { region: region.to_string(), sim: Mutex::new(Sim::default()) }
    }

    /// Script the behavior of one stack.
    pub fn set_behavior(&self, fqn: &str, behavior: Behavior) {
        let mut sim = self.sim.lock().expect("sim lock");
        sim.throttle_left.insert(fqn.to_string(), behavior.throttle);
        sim.behaviors.insert(fqn.to_string(), behavior);
    }

    /// Install a pre-existing COMPLETE stack with the given outputs.
    pub fn register_stack(&self, fqn: &str, outputs: BTreeMap<String, String>) {
        let mut sim = self.sim.lock().expect("sim lock");
        sim.stacks.insert(
            fqn.to_string(),
            SimStack {
                status: StackStatus::Complete,
                fingerprint: String::new(),
                parameters: BTreeMap::new(),
                tags: BTreeMap::new(),
                outputs,
                last_reason: None,
                pending: None,
            },
        );
    }

    /// Install a pre-existing stack in an arbitrary status.
    pub fn register_stack_status(&self, fqn: &str, status: StackStatus) {
        let mut sim = self.sim.lock().expect("sim lock");
        sim.stacks.insert(
            fqn.to_string(),
            SimStack {
                status,
                fingerprint: String::new(),
                parameters: BTreeMap::new(),
                tags: BTreeMap::new(),
                outputs: BTreeMap::new(),
                last_reason: None,
                pending: None,
            },
        );
    }

    /// Install a pre-existing stack whose stored submission fingerprint
    /// matches `submission`, so an identical update reports NoUpdates.
    pub fn register_stack_matching(&self, submission: &StackSubmission) {
        let mut sim = self.sim.lock().expect("sim lock");
        let parameters: BTreeMap<String, String> = submission
            .parameters
            .iter()
            .map(|p| (p.key.clone(), p.value.clone()))
            .collect();
        sim.stacks.insert(
            submission.fqn.clone(),
            SimStack {
                status: StackStatus::Complete,
                fingerprint: fingerprint(submission),
                parameters,
                tags: submission.tags.clone(),
                outputs: BTreeMap::new(),
                last_reason: None,
                pending: None,
            },
        );
    }

    pub fn set_secret(&self, ciphertext: &str, plaintext: &str) {
        let mut sim = self.sim.lock().expect("sim lock");
        sim.secrets.insert(ciphertext.to_string(), plaintext.to_string());
    }

    pub fn set_parameter(&self, name: &str, value: &str) {
        let mut sim = self.sim.lock().expect("sim lock");
        sim.parameters.insert(name.to_string(), value.to_string());
    }

    pub fn put_item(&self, table: &str, key_name: &str, key_value: &str, item: serde_json::Value) {
        let mut sim = self.sim.lock().expect("sim lock");
        sim.items.insert(item_key(table, key_name, key_value), item);
    }

    pub fn add_image(&self, name: &str, owner: &str, created: u64, id: &str) {
        let mut sim = self.sim.lock().expect("sim lock");
        sim.images.push(SimImage {
            name: name.to_string(),
            owner: owner.to_string(),
            created,
            id: id.to_string(),
        });
    }

    /// Live status of a stack, for test assertions.
    pub fn status_of(&self, fqn: &str) -> Option<StackStatus> {
        let sim = self.sim.lock().expect("sim lock");
        sim.stacks.get(fqn).map(|s| s.status)
    }
}

fn item_key(table: &str, key_name: &str, key_value: &str) -> String {
    format!("{}|{}|{}", table, key_name, key_value)
}

/// Digest of a submission's template and parameters; two submissions with
/// equal fingerprints represent no change.
pub fn fingerprint(submission: &StackSubmission) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(submission.template.body.as_bytes());
    hasher.update(b"\0");
    for parameter in &submission.parameters {
        hasher.update(parameter.key.as_bytes());
        hasher.update(b"=");
        hasher.update(parameter.value.as_bytes());
        hasher.update(b"\n");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

impl Sim {
    fn check_throttle(&mut self, fqn: &str) -> Result<(), ProviderError> {
        if let Some(left) = self.throttle_left.get_mut(fqn) {
            if *left > 0 {
                *left -= 1;
                return Err(ProviderError::Throttled);
            }
        }
        Ok(())
    }

    fn behavior(&self, fqn: &str) -> Behavior {
        self.behaviors.get(fqn).cloned().unwrap_or_default()
    }

    fn record_event(&mut self, fqn: &str, status: &str, reason: Option<String>) {
        let sequence = self.events.len() as u64;
        self.events.push(ProviderEvent {
            sequence,
            fqn: fqn.to_string(),
            status: status.to_string(),
            reason,
        });
    }

    /// Advance a stack's pending operation by one poll.
    fn tick(&mut self, fqn: &str) {
        let behavior = self.behavior(fqn);
        let Some(stack) = self.stacks.get_mut(fqn) else {
            return;
        };
        let Some(pending) = stack.pending.as_mut() else {
            return;
        };
        if pending.ticks_left > 0 {
            pending.ticks_left -= 1;
            return;
        }
        let pending = stack.pending.take().expect("pending present");
        match (pending.kind, pending.fail) {
            (OperationKind::Destroy, _) => {
                stack.status = StackStatus::DeleteComplete;
                stack.outputs.clear();
                stack.last_reason = Some("stack deleted".to_string());
            }
            (_, true) => {
                stack.status = StackStatus::RolledBack;
                stack.last_reason = Some("resource creation failed".to_string());
            }
            (_, false) => {
                stack.status = StackStatus::Complete;
                stack.fingerprint = pending.fingerprint;
                stack.parameters = pending.parameters;
                stack.outputs = behavior.outputs.clone();
                stack.last_reason = None;
            }
        }
        let status = format!("{:?}", stack.status);
        let reason = stack.last_reason.clone();
        self.record_event(fqn, &status, reason);
    }

    fn begin(
        &mut self,
        submission: &StackSubmission,
        kind: OperationKind,
        fail: bool,
    ) -> OperationHandle {
        let behavior = self.behavior(&submission.fqn);
        let parameters: BTreeMap<String, String> = submission
            .parameters
            .iter()
            .map(|p| (p.key.clone(), p.value.clone()))
            .collect();
        let pending = PendingOp {
            kind,
            ticks_left: behavior.ticks,
            fail,
            fingerprint: fingerprint(submission),
            parameters,
        };
        let entry = self
            .stacks
            .entry(submission.fqn.clone())
            .or_insert_with(|| SimStack {
                status: StackStatus::InProgress,
                fingerprint: String::new(),
                parameters: BTreeMap::new(),
                tags: BTreeMap::new(),
                outputs: BTreeMap::new(),
                last_reason: None,
                pending: None,
            });
        entry.status = match kind {
            OperationKind::Destroy => StackStatus::DeleteInProgress,
            _ => StackStatus::InProgress,
        };
        entry.tags = submission.tags.clone();
        entry.pending = Some(pending);
        self.record_event(&submission.fqn, &format!("{:?} submitted", kind), None);
        OperationHandle { fqn: submission.fqn.clone(), kind }
    }
}

impl Provider for MemoryProvider {
    fn region(&self) -> &str {
        &self.region
    }

    fn describe(&self, fqn: &str) -> Result<Option<StackDescription>, ProviderError> {
        let mut sim = self.sim.lock().expect("sim lock");
        sim.tick(fqn);
        Ok(sim.stacks.get(fqn).map(|stack| StackDescription {
            fqn: fqn.to_string(),
            status: stack.status,
            outputs: stack.outputs.clone(),
            parameters: stack.parameters.clone(),
            last_reason: stack.last_reason.clone(),
            drift_info: None,
        }))
    }

    fn create(&self, submission: &StackSubmission) -> Result<OperationHandle, ProviderError> {
        let mut sim = self.sim.lock().expect("sim lock");
        sim.check_throttle(&submission.fqn)?;
        if let Some(existing) = sim.stacks.get(&submission.fqn) {
            if existing.status != StackStatus::DeleteComplete {
                return Err(ProviderError::ValidationError(format!(
                    "stack '{}' already exists",
                    submission.fqn
                )));
            }
        }
        let fail = sim.behavior(&submission.fqn).fail_create;
        Ok(sim.begin(submission, OperationKind::Create, fail))
    }

    fn update(&self, submission: &StackSubmission) -> Result<OperationHandle, ProviderError> {
        let mut sim = self.sim.lock().expect("sim lock");
        sim.check_throttle(&submission.fqn)?;
        let Some(existing) = sim.stacks.get(&submission.fqn) else {
            return Err(ProviderError::StackDeleted(submission.fqn.clone()));
        };
        if existing.fingerprint == fingerprint(submission) && existing.tags == submission.tags {
            return Err(ProviderError::NoUpdates(submission.fqn.clone()));
        }
        let fail = sim.behavior(&submission.fqn).fail_update;
        Ok(sim.begin(submission, OperationKind::Update, fail))
    }

    fn plan_change_set(
        &self,
        submission: &StackSubmission,
    ) -> Result<ChangeSetSummary, ProviderError> {
        let mut sim = self.sim.lock().expect("sim lock");
        sim.check_throttle(&submission.fqn)?;
        let behavior = sim.behavior(&submission.fqn);
        let existing = sim.stacks.get(&submission.fqn);

        let mut summary = ChangeSetSummary::default();
        let old_parameters: BTreeMap<String, String> = existing
            .map(|s| s.parameters.clone())
            .unwrap_or_default();
        let old_fingerprint = existing.map(|s| s.fingerprint.clone()).unwrap_or_default();

        for parameter in &submission.parameters {
            let change = ResourceChange {
                logical_id: parameter.key.clone(),
                detail: if parameter.no_echo {
                    "****".to_string()
                } else {
                    parameter.value.clone()
                },
            };
            match old_parameters.get(&parameter.key) {
                None => summary.additions.push(change),
                Some(old) if *old != parameter.value => {
                    if behavior.replacement_keys.contains(&parameter.key) {
                        summary.replacements.push(change);
                    } else {
                        summary.modifications.push(change);
                    }
                }
                Some(_) => {}
            }
        }
        if !old_fingerprint.is_empty() && old_fingerprint != fingerprint(submission)
            && summary.is_empty()
        {
            summary.modifications.push(ResourceChange {
                logical_id: "Template".to_string(),
                detail: "template body changed".to_string(),
            });
        }

        sim.next_change_set += 1;
        summary.id = format!("cs-{:04}", sim.next_change_set);
        sim.change_sets.insert(summary.id.clone(), submission.clone());
        Ok(summary)
    }

    fn apply_change_set(&self, change_set_id: &str) -> Result<OperationHandle, ProviderError> {
        let mut sim = self.sim.lock().expect("sim lock");
        let Some(submission) = sim.change_sets.remove(change_set_id) else {
            return Err(ProviderError::ValidationError(format!(
                "change set '{}' does not exist",
                change_set_id
            )));
        };
        let kind = if sim.stacks.contains_key(&submission.fqn) {
            OperationKind::Update
        } else {
            OperationKind::Create
        };
        let fail = match kind {
            OperationKind::Create => sim.behavior(&submission.fqn).fail_create,
            _ => sim.behavior(&submission.fqn).fail_update,
        };
        Ok(sim.begin(&submission, kind, fail))
    }

    fn delete_change_set(&self, change_set_id: &str) -> Result<(), ProviderError> {
        let mut sim = self.sim.lock().expect("sim lock");
        sim.change_sets.remove(change_set_id);
        Ok(())
    }

    fn destroy(&self, fqn: &str) -> Result<OperationHandle, ProviderError> {
        let mut sim = self.sim.lock().expect("sim lock");
        sim.check_throttle(fqn)?;
        let Some(stack) = sim.stacks.get_mut(fqn) else {
            return Err(ProviderError::StackDeleted(fqn.to_string()));
        };
        if stack.status == StackStatus::DeleteComplete {
            return Err(ProviderError::StackDeleted(fqn.to_string()));
        }
        let ticks = sim.behavior(fqn).ticks;
        let stack = sim.stacks.get_mut(fqn).expect("stack present");
        stack.status = StackStatus::DeleteInProgress;
        stack.pending = Some(PendingOp {
            kind: OperationKind::Destroy,
            ticks_left: ticks,
            fail: false,
            fingerprint: String::new(),
            parameters: BTreeMap::new(),
        });
        sim.record_event(fqn, "Destroy submitted", None);
        Ok(OperationHandle { fqn: fqn.to_string(), kind: OperationKind::Destroy })
    }

    fn tail(&self, fqn: &str, since: u64) -> Result<Vec<ProviderEvent>, ProviderError> {
        let sim = self.sim.lock().expect("sim lock");
        Ok(sim
            .events
            .iter()
            .filter(|e| e.fqn == fqn && e.sequence >= since)
            .cloned()
            .collect())
    }

    fn decrypt(&self, ciphertext: &str, _region: Option<&str>) -> Result<String, ProviderError> {
        let sim = self.sim.lock().expect("sim lock");
        sim.secrets
            .get(ciphertext)
            .cloned()
            .ok_or_else(|| ProviderError::PermissionDenied("cannot decrypt ciphertext".to_string()))
    }

    fn get_parameter(&self, name: &str, _region: Option<&str>) -> Result<String, ProviderError> {
        let sim = self.sim.lock().expect("sim lock");
        sim.parameters
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::Other(format!("parameter '{}' not found", name)))
    }

    fn get_item(
        &self,
        table: &str,
        key_name: &str,
        key_value: &str,
        _region: Option<&str>,
    ) -> Result<serde_json::Value, ProviderError> {
        let sim = self.sim.lock().expect("sim lock");
        sim.items
            .get(&item_key(table, key_name, key_value))
            .cloned()
            .ok_or_else(|| {
                ProviderError::Other(format!(
                    "item {}:{} not found in table '{}'",
                    key_name, key_value, table
                ))
            })
    }

    fn find_image(
        &self,
        query: &ImageQuery,
        _region: Option<&str>,
    ) -> Result<String, ProviderError> {
        let pattern = Regex::new(&format!("^{}$", query.name_regex))
            .map_err(|e| ProviderError::ValidationError(format!("bad name_regex: {}", e)))?;
        let sim = self.sim.lock().expect("sim lock");
        let mut candidates: Vec<&SimImage> = sim
            .images
            .iter()
            .filter(|image| query.owners.iter().any(|o| *o == image.owner))
            .filter(|image| pattern.is_match(&image.name))
            .collect();
        candidates.sort_by(|a, b| b.created.cmp(&a.created));
        candidates
            .first()
            .map(|image| image.id.clone())
            .ok_or_else(|| ProviderError::Other("no matching image found".to_string()))
    }
}
