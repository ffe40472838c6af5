// store.rs — PolicyStore: engines, policies, schemas and attachments.
//
// Concurrency model:
//
//   - Each engine owns a `Mutex<EngineFile>` that serializes its writers and
//     an `ArcSwap<PolicySnapshot>` that readers load without locking. A write
//     builds the next state, persists it, swaps it in, and publishes a new
//     snapshot with a higher version, all while holding the engine's mutex.
//     A request evaluates against exactly one snapshot, before or after.
//   - The engine registry and the enforcement-point binding table are
//     `ArcSwap`ed maps, replaced wholesale by writers. The decision path
//     never takes a lock.
//   - Lock order: registry lock, then attachment lock, then engine mutexes
//     one at a time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use verdict_policy::{
    authorize, parse_policy, parse_policy_set, Analyzer, Decision, EnforcementMode, Finding,
    PolicySnapshot, PolicyStatement, Request, Schema, SchemaCompiler, SnapshotPolicy,
    ToolDefinition, ValidationMode, ValidationResult, Validator, DEFAULT_MAX_CLAUSES,
};

use crate::attachment::EnforcementAttachment;
use crate::engine::{EngineStatus, PolicyEngine};
use crate::error::StoreError;
use crate::persist::{EngineFile, EngineFiles};
use crate::policy::{Policy, ValidationStatus};
use crate::throttle::{ThrottleConfig, WriteThrottle};

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Where engine files live. `None` keeps everything in memory.
    pub state_dir: Option<PathBuf>,
    pub throttle: ThrottleConfig,
    /// Normal-form clause cap for validation and analysis.
    pub max_normal_form_clauses: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            state_dir: None,
            throttle: ThrottleConfig::default(),
            max_normal_form_clauses: DEFAULT_MAX_CLAUSES,
        }
    }
}

impl StoreOptions {
    /// No persistence, no throttling.
    pub fn in_memory() -> Self {
        Self {
            throttle: ThrottleConfig::unlimited(),
            ..Self::default()
        }
    }

    pub fn persistent(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: Some(state_dir.into()),
            ..Self::default()
        }
    }
}

/// How a clone is made.
#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    /// Engine to clone into; defaults to the source policy's engine.
    pub target_engine: Option<Uuid>,
    /// Defaults to `<source name>-copy`.
    pub name: Option<String>,
    /// Replacement statement text, so a locked policy can be cloned and
    /// edited in one step.
    pub statement: Option<String>,
}

/// One engine's state and its published snapshot.
pub struct EngineSlot {
    engine_id: Uuid,
    snapshot: ArcSwap<PolicySnapshot>,
    state: Mutex<EngineFile>,
}

impl EngineSlot {
    fn new(file: EngineFile) -> Self {
        Self {
            engine_id: file.engine.engine_id,
            snapshot: ArcSwap::from_pointee(build_snapshot(&file)),
            state: Mutex::new(file),
        }
    }

    pub fn engine_id(&self) -> Uuid {
        self.engine_id
    }

    /// The current snapshot. Holding the `Arc` pins it for the caller.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot.load_full()
    }
}

/// An enforcement point's resolved attachment, as seen by the decision path.
pub struct Binding {
    pub attachment: EnforcementAttachment,
    slot: Arc<EngineSlot>,
}

impl Binding {
    pub fn engine_id(&self) -> Uuid {
        self.attachment.engine_id
    }

    pub fn mode(&self) -> EnforcementMode {
        self.attachment.mode
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.slot.snapshot()
    }

    /// Decide against the engine's current snapshot.
    pub fn authorize(&self, request: &Request) -> Decision {
        authorize(request, &self.slot.snapshot())
    }
}

pub struct PolicyStore {
    engines: ArcSwap<HashMap<Uuid, Arc<EngineSlot>>>,
    bindings: ArcSwap<HashMap<String, Arc<Binding>>>,
    registry_lock: Mutex<()>,
    attachment_lock: Mutex<()>,
    compiler: SchemaCompiler,
    validator: Validator,
    analyzer: Analyzer,
    throttle: WriteThrottle,
    files: Option<EngineFiles>,
}

impl PolicyStore {
    /// Open a store, loading any engines persisted under the state directory.
    pub fn open(options: StoreOptions) -> Result<Self, StoreError> {
        let files = match &options.state_dir {
            Some(dir) => Some(EngineFiles::new(dir)?),
            None => None,
        };
        let loaded = match &files {
            Some(files) => files.load_all()?,
            None => Vec::new(),
        };

        let mut engines = HashMap::new();
        let mut bindings = HashMap::new();
        for mut file in loaded {
            recover_interrupted(&mut file.engine);
            sync_locks(&mut file);
            let slot = Arc::new(EngineSlot::new(file));
            {
                let state = slot.state.lock();
                for attachment in state.engine.attachments.values() {
                    bindings.insert(
                        attachment.enforcement_point.clone(),
                        Arc::new(Binding {
                            attachment: attachment.clone(),
                            slot: Arc::clone(&slot),
                        }),
                    );
                }
            }
            engines.insert(slot.engine_id, slot);
        }
        if !engines.is_empty() {
            tracing::info!(
                engines = engines.len(),
                attachments = bindings.len(),
                "loaded policy store"
            );
        }

        Ok(Self {
            engines: ArcSwap::from_pointee(engines),
            bindings: ArcSwap::from_pointee(bindings),
            registry_lock: Mutex::new(()),
            attachment_lock: Mutex::new(()),
            compiler: SchemaCompiler::new()?,
            validator: Validator::new(options.max_normal_form_clauses),
            analyzer: Analyzer::new(options.max_normal_form_clauses),
            throttle: WriteThrottle::new(options.throttle),
            files,
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(StoreOptions::in_memory())
    }

    // ── Engines ─────────────────────────────────────────────────

    pub fn create_engine(&self, name: &str, description: &str) -> Result<PolicyEngine, StoreError> {
        self.throttle.acquire()?;
        let _registry = self.registry_lock.lock();
        if self
            .engines
            .load()
            .values()
            .any(|slot| slot.state.lock().engine.name == name)
        {
            return Err(StoreError::Conflict {
                kind: "policy engine",
                name: name.to_string(),
            });
        }

        let mut file = EngineFile {
            engine: PolicyEngine::new(name, description),
            policies: Vec::new(),
        };
        let mut active = file.clone();
        active.engine.transition(EngineStatus::Active)?;
        let saved = self.save(&active);
        match &saved {
            Ok(()) => file = active,
            Err(e) => {
                tracing::warn!(name, error = %e, "policy engine creation failed");
                file.engine.transition(EngineStatus::CreateFailed {
                    reason: e.to_string(),
                })?;
            }
        }

        let engine = file.engine.clone();
        let slot = Arc::new(EngineSlot::new(file));
        let mut engines = HashMap::clone(&self.engines.load());
        engines.insert(engine.engine_id, slot);
        self.engines.store(Arc::new(engines));

        saved?;
        tracing::info!(engine_id = %engine.engine_id, name, "created policy engine");
        Ok(engine)
    }

    pub fn get_engine(&self, engine_id: Uuid) -> Result<PolicyEngine, StoreError> {
        Ok(self.slot(engine_id)?.state.lock().engine.clone())
    }

    /// All engines, oldest first.
    pub fn list_engines(&self) -> Vec<PolicyEngine> {
        let mut engines: Vec<PolicyEngine> = self
            .engines
            .load()
            .values()
            .map(|slot| slot.state.lock().engine.clone())
            .collect();
        engines.sort_by_key(|e| e.created_at);
        engines
    }

    /// Delete an engine and its policies. Fails while any enforcement point
    /// is attached to it.
    pub fn delete_engine(&self, engine_id: Uuid) -> Result<(), StoreError> {
        self.throttle.acquire()?;
        let _registry = self.registry_lock.lock();
        let slot = self.slot(engine_id)?;
        {
            let mut state = slot.state.lock();
            if state.engine.is_locked() {
                let attachments = state.engine.attachment_ids();
                tracing::warn!(%engine_id, ?attachments, "refusing to delete attached engine");
                return Err(StoreError::EngineAttached {
                    engine_id,
                    attachments,
                });
            }
            state.engine.transition(EngineStatus::Deleting)?;
            if let Some(files) = &self.files {
                if let Err(e) = files.remove(engine_id) {
                    tracing::warn!(%engine_id, error = %e, "policy engine deletion failed");
                    state.engine.transition(EngineStatus::DeleteFailed {
                        reason: e.to_string(),
                    })?;
                    return Err(e);
                }
            }
        }

        let mut engines = HashMap::clone(&self.engines.load());
        engines.remove(&engine_id);
        self.engines.store(Arc::new(engines));
        tracing::info!(%engine_id, "deleted policy engine");
        Ok(())
    }

    // ── Schemas ─────────────────────────────────────────────────

    /// Recompile the engine's schema from tool definitions.
    ///
    /// Policies naming actions the new schema lacks are marked stale; they
    /// keep evaluating. A compile failure leaves the previous schema in
    /// place and the engine in UPDATE_FAILED.
    pub fn refresh_schema(
        &self,
        engine_id: Uuid,
        tools: &[ToolDefinition],
    ) -> Result<PolicyEngine, StoreError> {
        self.throttle.acquire()?;
        let slot = self.slot(engine_id)?;
        let mut state = slot.state.lock();
        let mut next = state.clone();
        next.engine.transition(EngineStatus::Updating)?;

        match self.compiler.compile(tools) {
            Ok(schema) => {
                let stale = mark_stale(&mut next.policies, &schema);
                next.engine.schema = schema;
                next.engine.transition(EngineStatus::Active)?;
                self.commit(&slot, &mut state, next, false)?;
                tracing::info!(
                    %engine_id,
                    actions = state.engine.schema.actions.len(),
                    stale,
                    "refreshed engine schema"
                );
                Ok(state.engine.clone())
            }
            Err(e) => {
                tracing::warn!(%engine_id, error = %e, "schema refresh failed");
                next.engine.transition(EngineStatus::UpdateFailed {
                    reason: e.to_string(),
                })?;
                self.commit(&slot, &mut state, next, false)?;
                Err(e.into())
            }
        }
    }

    pub fn schema(&self, engine_id: Uuid) -> Result<Schema, StoreError> {
        Ok(self.slot(engine_id)?.state.lock().engine.schema.clone())
    }

    // ── Policies ────────────────────────────────────────────────

    /// Parse, validate and analyze a statement, then add it to the engine.
    ///
    /// Under FAIL_ON_ANY_FINDINGS any finding rejects the policy with
    /// `StoreError::Validation`; under IGNORE_ALL_FINDINGS the findings are
    /// stored with it.
    pub fn create_policy(
        &self,
        engine_id: Uuid,
        name: &str,
        text: &str,
        mode: ValidationMode,
    ) -> Result<Policy, StoreError> {
        self.throttle.acquire()?;
        let statement = parse_policy(text)?;
        let slot = self.slot(engine_id)?;
        let mut state = slot.state.lock();
        self.insert_policy(&slot, &mut state, name, statement, mode, None)
    }

    /// Add every statement in a policy set. All are accepted or none are.
    ///
    /// Each statement is named by its `@id` annotation, or `policy-<n>`.
    pub fn import_policy_set(
        &self,
        engine_id: Uuid,
        text: &str,
        mode: ValidationMode,
    ) -> Result<Vec<Policy>, StoreError> {
        self.throttle.acquire()?;
        let statements = parse_policy_set(text)?;
        let slot = self.slot(engine_id)?;
        let mut state = slot.state.lock();
        state.engine.ensure_usable()?;

        let mut next = state.clone();
        let mut imported = Vec::new();
        let mut rejected = Vec::new();
        for statement in statements {
            let name = match statement.id_annotation() {
                Some(id) => id.to_string(),
                None => format!("policy-{}", next.policies.len() + 1),
            };
            ensure_unique_name(&next.policies, &name, None)?;
            let findings = self.review(&next, &statement, None);
            let result = ValidationResult::from_findings(findings, mode);
            if !result.ok {
                rejected.extend(result.findings);
                continue;
            }
            let mut policy = Policy::new(engine_id, name, statement, result.findings);
            policy.locked = next.engine.is_locked();
            next.policies.push(policy.clone());
            imported.push(policy);
        }

        if !rejected.is_empty() {
            tracing::warn!(%engine_id, findings = rejected.len(), "policy set rejected");
            return Err(StoreError::Validation { findings: rejected });
        }
        self.commit(&slot, &mut state, next, true)?;
        tracing::info!(
            %engine_id,
            policies = imported.len(),
            snapshot_version = state.engine.snapshot_version,
            "imported policy set"
        );
        Ok(imported)
    }

    pub fn get_policy(&self, policy_id: Uuid) -> Result<Policy, StoreError> {
        let slot = self.slot_for_policy(policy_id)?;
        let state = slot.state.lock();
        state
            .policies
            .iter()
            .find(|p| p.policy_id == policy_id)
            .cloned()
            .ok_or(StoreError::PolicyNotFound(policy_id))
    }

    /// The engine's policies in evaluation order.
    pub fn list_policies(&self, engine_id: Uuid) -> Result<Vec<Policy>, StoreError> {
        Ok(self.slot(engine_id)?.state.lock().policies.clone())
    }

    /// Replace a policy's statement, keeping its id and position.
    pub fn update_policy(
        &self,
        policy_id: Uuid,
        text: &str,
        mode: ValidationMode,
    ) -> Result<Policy, StoreError> {
        self.throttle.acquire()?;
        let statement = parse_policy(text)?;
        let slot = self.slot_for_policy(policy_id)?;
        let mut state = slot.state.lock();
        let index = policy_index(&state, policy_id)?;
        ensure_unlocked(&state, policy_id)?;
        state.engine.ensure_usable()?;

        let name = state.policies[index].name.clone();
        let findings = self.review(&state, &statement, Some(policy_id));
        let findings = gate(findings, mode, &name)?;

        let mut next = state.clone();
        let policy = &mut next.policies[index];
        policy.validation = ValidationStatus::from_findings(&findings);
        policy.statement = statement;
        policy.findings = findings;
        policy.updated_at = Utc::now();
        let updated = policy.clone();

        self.commit(&slot, &mut state, next, true)?;
        tracing::info!(%policy_id, name = %updated.name, "updated policy");
        Ok(updated)
    }

    pub fn delete_policy(&self, policy_id: Uuid) -> Result<(), StoreError> {
        self.throttle.acquire()?;
        let slot = self.slot_for_policy(policy_id)?;
        let mut state = slot.state.lock();
        let index = policy_index(&state, policy_id)?;
        ensure_unlocked(&state, policy_id)?;

        let mut next = state.clone();
        next.policies.remove(index);
        self.commit(&slot, &mut state, next, true)?;
        tracing::info!(%policy_id, engine_id = %slot.engine_id, "deleted policy");
        Ok(())
    }

    /// Copy a policy, possibly into another engine and with a new statement.
    /// Works on locked policies; the clone goes through the same validation
    /// as a new policy.
    pub fn clone_policy(
        &self,
        policy_id: Uuid,
        options: CloneOptions,
        mode: ValidationMode,
    ) -> Result<Policy, StoreError> {
        self.throttle.acquire()?;
        let source = self.get_policy(policy_id)?;
        let statement = match &options.statement {
            Some(text) => parse_policy(text)?,
            None => source.statement.clone(),
        };
        let name = options
            .name
            .unwrap_or_else(|| format!("{}-copy", source.name));
        let target = options.target_engine.unwrap_or(source.engine_id);

        let slot = self.slot(target)?;
        let mut state = slot.state.lock();
        self.insert_policy(&slot, &mut state, &name, statement, mode, Some(policy_id))
    }

    // ── Attachments ─────────────────────────────────────────────

    /// Bind an enforcement point to an engine, replacing any previous
    /// binding. The next request at the point uses the new engine and mode.
    ///
    /// A rebinding detaches the previous engine first. If the new engine
    /// then cannot be saved, the previous attachment is restored, so the
    /// point is never claimed by two engines.
    pub fn update_attachment(
        &self,
        enforcement_point: &str,
        engine_id: Uuid,
        mode: EnforcementMode,
    ) -> Result<EnforcementAttachment, StoreError> {
        self.throttle.acquire()?;
        let _attachments = self.attachment_lock.lock();
        let slot = self.slot(engine_id)?;
        slot.state.lock().engine.ensure_usable()?;
        let attachment = EnforcementAttachment::new(enforcement_point, engine_id, mode);

        let previous = self
            .bindings
            .load()
            .get(enforcement_point)
            .cloned()
            .filter(|previous| previous.engine_id() != engine_id);
        if let Some(previous) = &previous {
            self.detach(&previous.slot, enforcement_point)?;
        }

        if let Err(e) = self.attach(&slot, &attachment) {
            if let Some(previous) = &previous {
                if let Err(rollback) = self.attach(&previous.slot, &previous.attachment) {
                    tracing::error!(
                        enforcement_point,
                        engine_id = %previous.engine_id(),
                        error = %rollback,
                        "failed to restore previous attachment"
                    );
                }
            }
            return Err(e);
        }

        let mut bindings = HashMap::clone(&self.bindings.load());
        bindings.insert(
            enforcement_point.to_string(),
            Arc::new(Binding {
                attachment: attachment.clone(),
                slot,
            }),
        );
        self.bindings.store(Arc::new(bindings));
        tracing::info!(enforcement_point, %engine_id, %mode, "updated enforcement attachment");
        Ok(attachment)
    }

    /// Unbind an enforcement point. Its requests are denied from then on.
    pub fn remove_attachment(&self, enforcement_point: &str) -> Result<EnforcementAttachment, StoreError> {
        self.throttle.acquire()?;
        let _attachments = self.attachment_lock.lock();
        let binding = self
            .bindings
            .load()
            .get(enforcement_point)
            .cloned()
            .ok_or_else(|| StoreError::AttachmentNotFound(enforcement_point.to_string()))?;
        self.detach(&binding.slot, enforcement_point)?;

        let mut bindings = HashMap::clone(&self.bindings.load());
        bindings.remove(enforcement_point);
        self.bindings.store(Arc::new(bindings));
        tracing::info!(enforcement_point, engine_id = %binding.engine_id(), "removed enforcement attachment");
        Ok(binding.attachment.clone())
    }

    pub fn get_attachment(&self, enforcement_point: &str) -> Option<EnforcementAttachment> {
        self.bindings
            .load()
            .get(enforcement_point)
            .map(|b| b.attachment.clone())
    }

    /// All attachments, ordered by enforcement point.
    pub fn list_attachments(&self) -> Vec<EnforcementAttachment> {
        let mut attachments: Vec<EnforcementAttachment> = self
            .bindings
            .load()
            .values()
            .map(|b| b.attachment.clone())
            .collect();
        attachments.sort_by(|a, b| a.enforcement_point.cmp(&b.enforcement_point));
        attachments
    }

    // ── Decision path ───────────────────────────────────────────

    /// Resolve an enforcement point to its binding. Lock-free.
    pub fn resolve(&self, enforcement_point: &str) -> Option<Arc<Binding>> {
        self.bindings.load().get(enforcement_point).cloned()
    }

    /// The engine's current snapshot. Lock-free.
    pub fn snapshot(&self, engine_id: Uuid) -> Result<Arc<PolicySnapshot>, StoreError> {
        Ok(self.slot(engine_id)?.snapshot())
    }

    /// Decide a request directly against an engine, bypassing attachments.
    pub fn authorize(&self, engine_id: Uuid, request: &Request) -> Result<Decision, StoreError> {
        let snapshot = self.snapshot(engine_id)?;
        Ok(authorize(request, &snapshot))
    }

    // ── Internals ───────────────────────────────────────────────

    fn slot(&self, engine_id: Uuid) -> Result<Arc<EngineSlot>, StoreError> {
        self.engines
            .load()
            .get(&engine_id)
            .cloned()
            .ok_or(StoreError::EngineNotFound(engine_id))
    }

    fn slot_for_policy(&self, policy_id: Uuid) -> Result<Arc<EngineSlot>, StoreError> {
        self.engines
            .load()
            .values()
            .find(|slot| {
                slot.state
                    .lock()
                    .policies
                    .iter()
                    .any(|p| p.policy_id == policy_id)
            })
            .cloned()
            .ok_or(StoreError::PolicyNotFound(policy_id))
    }

    fn insert_policy(
        &self,
        slot: &EngineSlot,
        state: &mut EngineFile,
        name: &str,
        statement: PolicyStatement,
        mode: ValidationMode,
        cloned_from: Option<Uuid>,
    ) -> Result<Policy, StoreError> {
        state.engine.ensure_usable()?;
        ensure_unique_name(&state.policies, name, None)?;
        let findings = self.review(state, &statement, None);
        let findings = gate(findings, mode, name)?;

        let mut policy = Policy::new(slot.engine_id, name, statement, findings);
        policy.locked = state.engine.is_locked();
        policy.cloned_from = cloned_from;
        let mut next = state.clone();
        next.policies.push(policy.clone());
        self.commit(slot, state, next, true)?;
        tracing::info!(
            policy_id = %policy.policy_id,
            engine_id = %slot.engine_id,
            name,
            findings = policy.findings.len(),
            snapshot_version = state.engine.snapshot_version,
            "created policy"
        );
        Ok(policy)
    }

    /// Validation findings against the engine's schema plus analyzer
    /// findings against its other policies.
    fn review(&self, state: &EngineFile, statement: &PolicyStatement, exclude: Option<Uuid>) -> Vec<Finding> {
        let schema = &state.engine.schema;
        let mut findings = self
            .validator
            .validate(statement, schema, ValidationMode::IgnoreAllFindings)
            .findings;
        let existing: Vec<SnapshotPolicy> = state
            .policies
            .iter()
            .filter(|p| Some(p.policy_id) != exclude)
            .map(Policy::to_snapshot)
            .collect();
        findings.extend(
            self.analyzer
                .analyze(statement, &existing, schema)
                .findings(&existing),
        );
        findings
    }

    fn attach(&self, slot: &EngineSlot, attachment: &EnforcementAttachment) -> Result<(), StoreError> {
        let mut state = slot.state.lock();
        state.engine.ensure_usable()?;
        let mut next = state.clone();
        next.engine
            .attachments
            .insert(attachment.enforcement_point.clone(), attachment.clone());
        sync_locks(&mut next);
        self.commit(slot, &mut state, next, false)
    }

    fn detach(&self, slot: &EngineSlot, enforcement_point: &str) -> Result<(), StoreError> {
        let mut state = slot.state.lock();
        let mut next = state.clone();
        next.engine.attachments.remove(enforcement_point);
        sync_locks(&mut next);
        self.commit(slot, &mut state, next, false)
    }

    /// Persist `next`, swap it in, and publish a new snapshot if the policy
    /// set changed. `state` must be the guard of `slot`'s mutex.
    fn commit(
        &self,
        slot: &EngineSlot,
        state: &mut EngineFile,
        mut next: EngineFile,
        republish: bool,
    ) -> Result<(), StoreError> {
        if republish {
            next.engine.snapshot_version += 1;
        }
        next.engine.updated_at = Utc::now();
        self.save(&next)?;
        *state = next;
        if republish {
            slot.snapshot.store(Arc::new(build_snapshot(state)));
            tracing::debug!(
                engine_id = %slot.engine_id,
                version = state.engine.snapshot_version,
                policies = state.policies.len(),
                "published snapshot"
            );
        }
        Ok(())
    }

    fn save(&self, file: &EngineFile) -> Result<(), StoreError> {
        match &self.files {
            Some(files) => files.save(file),
            None => Ok(()),
        }
    }
}

fn build_snapshot(file: &EngineFile) -> PolicySnapshot {
    PolicySnapshot::new(
        file.engine.snapshot_version,
        file.policies.iter().map(Policy::to_snapshot).collect(),
    )
}

fn gate(findings: Vec<Finding>, mode: ValidationMode, name: &str) -> Result<Vec<Finding>, StoreError> {
    let result = ValidationResult::from_findings(findings, mode);
    if result.ok {
        Ok(result.findings)
    } else {
        tracing::warn!(name, findings = result.findings.len(), "policy rejected");
        Err(StoreError::Validation {
            findings: result.findings,
        })
    }
}

fn ensure_unique_name(policies: &[Policy], name: &str, except: Option<Uuid>) -> Result<(), StoreError> {
    if policies
        .iter()
        .any(|p| p.name == name && Some(p.policy_id) != except)
    {
        return Err(StoreError::Conflict {
            kind: "policy",
            name: name.to_string(),
        });
    }
    Ok(())
}

fn ensure_unlocked(state: &EngineFile, policy_id: Uuid) -> Result<(), StoreError> {
    if state.engine.is_locked() {
        tracing::warn!(%policy_id, engine_id = %state.engine.engine_id, "policy is locked");
        return Err(StoreError::PolicyLocked {
            policy_id,
            engine_id: state.engine.engine_id,
        });
    }
    Ok(())
}

fn policy_index(state: &EngineFile, policy_id: Uuid) -> Result<usize, StoreError> {
    state
        .policies
        .iter()
        .position(|p| p.policy_id == policy_id)
        .ok_or(StoreError::PolicyNotFound(policy_id))
}

fn sync_locks(file: &mut EngineFile) {
    let locked = file.engine.is_locked();
    for policy in &mut file.policies {
        policy.locked = locked;
    }
}

/// Mark policies naming undeclared actions as stale and clear the mark on
/// those that are whole again. Returns how many are stale.
fn mark_stale(policies: &mut [Policy], schema: &Schema) -> usize {
    let mut stale = 0;
    for policy in policies.iter_mut() {
        let missing: Vec<String> = if schema.is_empty() {
            Vec::new()
        } else {
            policy
                .statement
                .action
                .named()
                .into_iter()
                .filter(|name| !schema.has_action(name))
                .map(str::to_string)
                .collect()
        };
        if missing.is_empty() {
            if policy.is_stale() {
                policy.validation = ValidationStatus::from_findings(&policy.findings);
            }
        } else {
            policy.validation = ValidationStatus::Stale {
                missing_actions: missing,
            };
            stale += 1;
        }
    }
    stale
}

/// Engines persisted mid-transition come back in the matching failed state.
fn recover_interrupted(engine: &mut PolicyEngine) {
    let reason = "interrupted by restart".to_string();
    let next = match engine.status {
        EngineStatus::Updating => EngineStatus::UpdateFailed { reason },
        EngineStatus::Deleting => EngineStatus::DeleteFailed { reason },
        EngineStatus::Creating => EngineStatus::CreateFailed { reason },
        _ => return,
    };
    tracing::warn!(engine_id = %engine.engine_id, from = %engine.status, to = %next, "recovering engine");
    engine.status = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use verdict_policy::{DecisionEffect, FindingKind, Principal};

    const FAIL: ValidationMode = ValidationMode::FailOnAnyFindings;
    const IGNORE: ValidationMode = ValidationMode::IgnoreAllFindings;

    const SMALL_REFUNDS: &str =
        r#"permit(principal, action == "process_refund", resource) when { context.input.amount < 1000 };"#;

    fn refund_tools() -> Vec<ToolDefinition> {
        vec![ToolDefinition::new(
            "process_refund",
            json!({
                "type": "object",
                "properties": {
                    "amount": { "type": "number" },
                    "currency": { "type": "string" }
                },
                "required": ["amount"]
            }),
        )]
    }

    fn store_with_engine() -> (PolicyStore, Uuid) {
        let store = PolicyStore::in_memory().unwrap();
        let engine = store.create_engine("refunds", "").unwrap();
        store.refresh_schema(engine.engine_id, &refund_tools()).unwrap();
        (store, engine.engine_id)
    }

    fn refund(amount: i64) -> Request {
        Request::new(
            Principal::new("userX"),
            "process_refund",
            "gwA",
            json!({ "amount": amount }),
        )
    }

    #[test]
    fn create_engine_is_active_and_unique() {
        let store = PolicyStore::in_memory().unwrap();
        let engine = store.create_engine("refunds", "refund desk").unwrap();
        assert_eq!(engine.status, EngineStatus::Active);
        assert!(matches!(
            store.create_engine("refunds", ""),
            Err(StoreError::Conflict { .. })
        ));
        assert_eq!(store.list_engines().len(), 1);
    }

    #[test]
    fn each_write_publishes_a_higher_version() {
        let (store, engine_id) = store_with_engine();
        assert_eq!(store.snapshot(engine_id).unwrap().version(), 0);
        let policy = store
            .create_policy(engine_id, "small", SMALL_REFUNDS, FAIL)
            .unwrap();
        assert_eq!(store.snapshot(engine_id).unwrap().version(), 1);
        store.delete_policy(policy.policy_id).unwrap();
        let snapshot = store.snapshot(engine_id).unwrap();
        assert_eq!(snapshot.version(), 2);
        assert!(snapshot.is_empty());
    }

    #[test]
    fn syntax_errors_are_not_findings() {
        let (store, engine_id) = store_with_engine();
        assert!(matches!(
            store.create_policy(engine_id, "bad", "permit(principal,", FAIL),
            Err(StoreError::Parse(_))
        ));
    }

    #[test]
    fn findings_reject_or_attach_by_mode() {
        let (store, engine_id) = store_with_engine();
        let text = r#"permit(principal, action == "process_refund", resource) when { context.input.amount == "high" };"#;
        match store.create_policy(engine_id, "typo", text, FAIL) {
            Err(StoreError::Validation { findings }) => {
                assert_eq!(findings[0].kind, FindingKind::TypeMismatch);
            }
            other => panic!("expected Validation, got {:?}", other),
        }
        assert!(store.list_policies(engine_id).unwrap().is_empty());

        let policy = store.create_policy(engine_id, "typo", text, IGNORE).unwrap();
        assert_eq!(policy.validation, ValidationStatus::ValidWithFindings);
        assert_eq!(policy.findings[0].kind, FindingKind::TypeMismatch);
    }

    #[test]
    fn duplicate_policy_names_conflict() {
        let (store, engine_id) = store_with_engine();
        store.create_policy(engine_id, "small", SMALL_REFUNDS, FAIL).unwrap();
        let other = r#"forbid(principal, action == "process_refund", resource) when { context.input.amount > 5000 };"#;
        assert!(matches!(
            store.create_policy(engine_id, "small", other, FAIL),
            Err(StoreError::Conflict { kind: "policy", .. })
        ));
    }

    #[test]
    fn attached_engine_locks_policies() {
        let (store, engine_id) = store_with_engine();
        let policy = store.create_policy(engine_id, "small", SMALL_REFUNDS, FAIL).unwrap();
        store
            .update_attachment("gwA", engine_id, EnforcementMode::Enforce)
            .unwrap();

        assert!(store.get_policy(policy.policy_id).unwrap().locked);
        assert!(matches!(
            store.delete_policy(policy.policy_id),
            Err(StoreError::PolicyLocked { .. })
        ));
        assert!(matches!(
            store.update_policy(policy.policy_id, SMALL_REFUNDS, IGNORE),
            Err(StoreError::PolicyLocked { .. })
        ));
        assert!(matches!(
            store.delete_engine(engine_id),
            Err(StoreError::EngineAttached { .. })
        ));

        store.remove_attachment("gwA").unwrap();
        assert!(!store.get_policy(policy.policy_id).unwrap().locked);
        store.delete_policy(policy.policy_id).unwrap();
        store.delete_engine(engine_id).unwrap();
        assert!(matches!(
            store.get_engine(engine_id),
            Err(StoreError::EngineNotFound(_))
        ));
    }

    #[test]
    fn clone_of_locked_policy_can_be_edited() {
        let (store, engine_id) = store_with_engine();
        let policy = store.create_policy(engine_id, "small", SMALL_REFUNDS, FAIL).unwrap();
        store
            .update_attachment("gwA", engine_id, EnforcementMode::Enforce)
            .unwrap();
        let draft = store.create_engine("refunds-draft", "").unwrap();
        store.refresh_schema(draft.engine_id, &refund_tools()).unwrap();

        let clone = store
            .clone_policy(
                policy.policy_id,
                CloneOptions {
                    target_engine: Some(draft.engine_id),
                    ..CloneOptions::default()
                },
                FAIL,
            )
            .unwrap();
        assert_eq!(clone.name, "small-copy");
        assert_eq!(clone.cloned_from, Some(policy.policy_id));
        assert!(!clone.locked);

        let edited = store
            .update_policy(
                clone.policy_id,
                r#"permit(principal, action == "process_refund", resource) when { context.input.amount < 2000 };"#,
                FAIL,
            )
            .unwrap();
        assert_eq!(edited.policy_id, clone.policy_id);
        let decision = store.authorize(draft.engine_id, &refund(1500)).unwrap();
        assert_eq!(decision.effect, DecisionEffect::Allow);
    }

    #[test]
    fn rebinding_moves_the_lock() {
        let (store, first) = store_with_engine();
        let second = store.create_engine("other", "").unwrap().engine_id;
        store.update_attachment("gwA", first, EnforcementMode::LogOnly).unwrap();
        store.update_attachment("gwA", second, EnforcementMode::Enforce).unwrap();

        assert!(!store.get_engine(first).unwrap().is_locked());
        assert!(store.get_engine(second).unwrap().is_locked());
        let binding = store.resolve("gwA").unwrap();
        assert_eq!(binding.engine_id(), second);
        assert_eq!(binding.mode(), EnforcementMode::Enforce);
        assert_eq!(store.list_attachments().len(), 1);
    }

    #[test]
    fn removing_unknown_attachment_fails() {
        let store = PolicyStore::in_memory().unwrap();
        assert!(matches!(
            store.remove_attachment("nowhere"),
            Err(StoreError::AttachmentNotFound(_))
        ));
    }

    #[test]
    fn import_is_all_or_nothing() {
        let (store, engine_id) = store_with_engine();
        let good = r#"
            @id("small")
            permit(principal, action == "process_refund", resource) when { context.input.amount < 1000 };
            forbid(principal, action == "process_refund", resource) when { context.input.amount > 50000 };
        "#;
        let imported = store.import_policy_set(engine_id, good, FAIL).unwrap();
        assert_eq!(imported[0].name, "small");
        assert_eq!(imported[1].name, "policy-2");
        assert_eq!(store.snapshot(engine_id).unwrap().version(), 1);

        let bad = r#"
            permit(principal, action == "process_refund", resource) when { context.input.amount < 10 };
            permit(principal, action == "process_refund", resource) when { context.input.bogus > 1 };
        "#;
        assert!(matches!(
            store.import_policy_set(engine_id, bad, FAIL),
            Err(StoreError::Validation { .. })
        ));
        assert_eq!(store.list_policies(engine_id).unwrap().len(), 2);
    }

    #[test]
    fn schema_refresh_marks_stale_and_recovers() {
        let (store, engine_id) = store_with_engine();
        let policy = store.create_policy(engine_id, "small", SMALL_REFUNDS, FAIL).unwrap();

        let lookup_only = vec![ToolDefinition::new("lookup_order", json!({ "type": "object" }))];
        store.refresh_schema(engine_id, &lookup_only).unwrap();
        let stale = store.get_policy(policy.policy_id).unwrap();
        assert_eq!(
            stale.validation,
            ValidationStatus::Stale {
                missing_actions: vec!["process_refund".to_string()]
            }
        );
        // Stale policies still evaluate.
        let decision = store.authorize(engine_id, &refund(10)).unwrap();
        assert_eq!(decision.effect, DecisionEffect::Allow);

        store.refresh_schema(engine_id, &refund_tools()).unwrap();
        assert_eq!(
            store.get_policy(policy.policy_id).unwrap().validation,
            ValidationStatus::Valid
        );
    }

    #[test]
    fn failed_schema_refresh_keeps_previous_schema() {
        let (store, engine_id) = store_with_engine();
        let conflicting = vec![
            ToolDefinition::new(
                "process_refund",
                json!({ "type": "object", "properties": { "amount": { "type": "number" } } }),
            ),
            ToolDefinition::new(
                "process_refund",
                json!({ "type": "object", "properties": { "amount": { "type": "string" } } }),
            ),
        ];
        assert!(matches!(
            store.refresh_schema(engine_id, &conflicting),
            Err(StoreError::Schema(_))
        ));
        let engine = store.get_engine(engine_id).unwrap();
        assert!(matches!(engine.status, EngineStatus::UpdateFailed { .. }));
        assert!(engine.schema.has_action("process_refund"));

        // Still usable, and a later refresh recovers.
        store.create_policy(engine_id, "small", SMALL_REFUNDS, FAIL).unwrap();
        store.refresh_schema(engine_id, &refund_tools()).unwrap();
        assert_eq!(store.get_engine(engine_id).unwrap().status, EngineStatus::Active);
    }

    #[test]
    fn throttled_writes_are_rejected() {
        let store = PolicyStore::open(StoreOptions {
            throttle: ThrottleConfig {
                burst: 2,
                per_second: 0.001,
            },
            ..StoreOptions::default()
        })
        .unwrap();
        store.create_engine("a", "").unwrap();
        store.create_engine("b", "").unwrap();
        assert!(matches!(
            store.create_engine("c", ""),
            Err(StoreError::Throttled { .. })
        ));
        // Reads are never throttled.
        assert_eq!(store.list_engines().len(), 2);
    }

    #[test]
    fn interrupted_update_recovers_as_failed() {
        let mut engine = PolicyEngine::new("e", "");
        engine.transition(EngineStatus::Active).unwrap();
        engine.transition(EngineStatus::Updating).unwrap();
        recover_interrupted(&mut engine);
        assert!(matches!(engine.status, EngineStatus::UpdateFailed { .. }));
    }
}
