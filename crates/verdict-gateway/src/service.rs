// service.rs — PolicyService: the control-plane and data-plane surface.
//
// Owns the store, the generation jobs and the enforcement adapter, wired
// from one ServiceConfig. Control-plane calls return errors; the
// data-plane calls (`authorize`, `on_request`) always return an answer.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use verdict_audit::{AuditLog, AuditSink, MemoryAuditSink};
use verdict_policy::{
    Decision, EnforcementMode, Principal, Request, SchemaCompiler, ToolDefinition, ValidationMode,
};
use verdict_store::{EnforcementAttachment, Policy, PolicyEngine, PolicyStore};

use crate::adapter::{AdapterResponse, EnforcementAdapter};
use crate::config::ServiceConfig;
use crate::error::GatewayError;
use crate::generator::{GenerationLimits, PolicyGeneration, PolicyGenerator};
use crate::judge::JudgeModel;

pub struct PolicyService {
    config: ServiceConfig,
    store: Arc<PolicyStore>,
    generator: PolicyGenerator,
    adapter: EnforcementAdapter,
}

impl PolicyService {
    /// Open the store and decision log named by the config. Without an
    /// `audit_log` path, records are kept in memory.
    pub fn open(config: ServiceConfig, judge: Arc<dyn JudgeModel>) -> Result<Self, GatewayError> {
        let sink: Arc<dyn AuditSink> = match &config.audit_log {
            Some(path) => Arc::new(AuditLog::open(path)?),
            None => Arc::new(MemoryAuditSink::new()),
        };
        Self::with_sink(config, judge, sink)
    }

    pub fn with_sink(
        config: ServiceConfig,
        judge: Arc<dyn JudgeModel>,
        sink: Arc<dyn AuditSink>,
    ) -> Result<Self, GatewayError> {
        let store = Arc::new(PolicyStore::open(config.store_options())?);
        let generator = PolicyGenerator::new(
            Arc::clone(&store),
            judge,
            GenerationLimits::from(&config.generation),
            config.validation.max_normal_form_clauses,
        );
        let adapter = EnforcementAdapter::new(Arc::clone(&store), sink);
        tracing::info!(
            state_dir = ?config.state_dir,
            audit_log = ?config.audit_log,
            engines = store.list_engines().len(),
            "policy service ready"
        );
        Ok(Self {
            config,
            store,
            generator,
            adapter,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The store, for operations beyond the ones surfaced here.
    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn generator(&self) -> &PolicyGenerator {
        &self.generator
    }

    // ── Engines and schemas ─────────────────────────────────────

    pub fn create_policy_engine(&self, name: &str, description: &str) -> Result<PolicyEngine, GatewayError> {
        Ok(self.store.create_engine(name, description)?)
    }

    /// Fails while any enforcement point is attached.
    pub fn delete_policy_engine(&self, engine_id: Uuid) -> Result<(), GatewayError> {
        Ok(self.store.delete_engine(engine_id)?)
    }

    pub fn refresh_schema(&self, engine_id: Uuid, tools: &[ToolDefinition]) -> Result<PolicyEngine, GatewayError> {
        Ok(self.store.refresh_schema(engine_id, tools)?)
    }

    /// Refresh the schema from a YAML or JSON tool manifest.
    pub fn load_tool_manifest(&self, engine_id: Uuid, path: &Path) -> Result<PolicyEngine, GatewayError> {
        let tools = SchemaCompiler::load_manifest(path)?;
        self.refresh_schema(engine_id, &tools)
    }

    /// The reference to pass as `target_schema` when starting generation.
    pub fn schema_fingerprint(&self, engine_id: Uuid) -> Result<String, GatewayError> {
        Ok(self.store.schema(engine_id)?.fingerprint())
    }

    // ── Policies ────────────────────────────────────────────────

    pub fn create_policy(
        &self,
        engine_id: Uuid,
        name: &str,
        statement: &str,
        mode: ValidationMode,
    ) -> Result<Policy, GatewayError> {
        Ok(self.store.create_policy(engine_id, name, statement, mode)?)
    }

    pub fn list_policies(&self, engine_id: Uuid) -> Result<Vec<Policy>, GatewayError> {
        Ok(self.store.list_policies(engine_id)?)
    }

    /// Fails if the policy is locked.
    pub fn delete_policy(&self, policy_id: Uuid) -> Result<(), GatewayError> {
        Ok(self.store.delete_policy(policy_id)?)
    }

    // ── Generation ──────────────────────────────────────────────

    /// Start drafting policies from text. The job runs on the caller's
    /// Tokio runtime.
    pub fn start_policy_generation(
        &self,
        engine_id: Uuid,
        text: &str,
        target_schema: &str,
    ) -> Result<Uuid, GatewayError> {
        self.generator.start(engine_id, text, target_schema)
    }

    pub fn get_policy_generation(&self, generation_id: Uuid) -> Result<PolicyGeneration, GatewayError> {
        self.generator.get(generation_id)
    }

    pub fn cancel_policy_generation(&self, generation_id: Uuid) -> Result<PolicyGeneration, GatewayError> {
        self.generator.cancel(generation_id)
    }

    // ── Attachments ─────────────────────────────────────────────

    pub fn update_enforcement_attachment(
        &self,
        enforcement_point: &str,
        engine_id: Uuid,
        mode: EnforcementMode,
    ) -> Result<EnforcementAttachment, GatewayError> {
        Ok(self.store.update_attachment(enforcement_point, engine_id, mode)?)
    }

    pub fn remove_enforcement_attachment(&self, enforcement_point: &str) -> Result<EnforcementAttachment, GatewayError> {
        Ok(self.store.remove_attachment(enforcement_point)?)
    }

    pub fn get_enforcement_attachment(&self, enforcement_point: &str) -> Option<EnforcementAttachment> {
        self.store.get_attachment(enforcement_point)
    }

    // ── Data plane ──────────────────────────────────────────────

    /// The engine's decision for a call, with the resource taken as the
    /// enforcement point. Unattached resources are denied. Nothing is
    /// audited and the attachment mode is not applied; see
    /// [`on_request`](Self::on_request).
    pub fn authorize(&self, principal: Principal, action: &str, resource: &str, input: Value) -> Decision {
        let request = Request::new(principal, action, resource, input);
        match self.store.resolve(resource) {
            Some(binding) => binding.authorize(&request),
            None => Decision::default_deny(0),
        }
    }

    /// Decide, apply the attachment mode and audit.
    pub fn on_request(
        &self,
        enforcement_point: &str,
        principal: Principal,
        action: &str,
        resource: &str,
        input: Value,
    ) -> AdapterResponse {
        self.adapter
            .on_request(enforcement_point, principal, action, resource, input)
    }
}
