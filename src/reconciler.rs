//! Reconciler tying the engine together.
//!
//! Each CLI command maps to one method here. Commands that change anything
//! hold the cross-process state lock for their whole duration, and every
//! structural check (parse, references, cycles, validation) runs before the
//! lock is taken or any provider call is made.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, ConfigValidator, ValidationResult, WorkspaceConfig};
use crate::error::{HalyardError, PlanError, ProviderError, Result, StateError};
use crate::graph::{DeclarationLoader, ResourceGraph, ResourceId};
use crate::planner::{
    CancellationFlag, DeploymentPlan, DiffEngine, DiffResult, ExecutionResult, PlanExecutor,
    RetryPolicy,
};
use crate::provider::{Provider, SchemaRegistry};
use crate::render::{RenderedArtifact, Renderer, remove_artifacts, resolve_outputs};
use crate::state::{
    ArtifactState, DeploymentOperation, DeploymentState, LOCK_RENEW_SECS, OutputValue, StateStore,
    generate_holder_id,
};

/// Orchestrates load, plan, apply and render for one workspace.
pub struct Reconciler {
    config: WorkspaceConfig,
    workspace_dir: PathBuf,
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    renderer: Renderer,
    cancel: CancellationFlag,
    lock_renewal: Duration,
    hasher: ConfigHasher,
    diff_engine: DiffEngine,
}

/// Result of `plan`.
#[derive(Debug, Serialize)]
pub struct PlanReport {
    /// Per-resource differences.
    pub diff: DiffResult,
    /// Ordered actions.
    pub plan: DeploymentPlan,
    /// Validation warnings.
    pub warnings: Vec<String>,
}

/// Result of `apply` or `destroy`.
#[derive(Debug, Serialize)]
pub struct ReconciliationResult {
    /// Which operation ran.
    pub operation: DeploymentOperation,
    /// The plan that was executed.
    pub plan: DeploymentPlan,
    /// Execution details; `None` when there was nothing to do.
    pub execution: Option<ExecutionResult>,
    /// Outputs after the operation.
    pub outputs: BTreeMap<String, OutputValue>,
    /// Files written by apply or removed by destroy.
    pub artifacts: Vec<PathBuf>,
    /// Whether everything succeeded.
    pub success: bool,
    /// Error messages, first failure first.
    pub errors: Vec<String>,
    /// The first failure, for the exit status.
    #[serde(skip)]
    pub failure: Option<HalyardError>,
}

/// Result of comparing state with what the provider reports.
#[derive(Debug, Serialize)]
pub struct DriftReport {
    /// One entry per recorded resource.
    pub entries: Vec<DriftEntry>,
    /// Whether state was updated from the findings.
    pub refreshed: bool,
}

/// Drift of one resource.
#[derive(Debug, Serialize)]
pub struct DriftEntry {
    /// Resource identity.
    pub resource: ResourceId,
    /// Provider id from state.
    pub provider_id: String,
    /// Finding.
    pub status: DriftStatus,
    /// Attributes that differ.
    pub changes: Vec<DriftChange>,
}

/// Drift finding for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    /// Matches state.
    InSync,
    /// Exists with different attributes.
    Changed,
    /// No longer exists.
    Missing,
}

/// One attribute that changed outside the engine.
#[derive(Debug, Serialize)]
pub struct DriftChange {
    /// Attribute name.
    pub attribute: String,
    /// Value in state.
    pub recorded: Value,
    /// Value reported by the provider.
    pub actual: Option<Value>,
}

impl Reconciler {
    /// Creates a reconciler with explicit provider and state store.
    #[must_use]
    pub fn new(
        config: WorkspaceConfig,
        workspace_dir: impl Into<PathBuf>,
        provider: Arc<dyn Provider>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let renderer = Renderer::new(&config.effective_host_os());
        Self {
            config,
            workspace_dir: workspace_dir.into(),
            provider,
            store,
            renderer,
            cancel: CancellationFlag::new(),
            lock_renewal: Duration::from_secs(LOCK_RENEW_SECS),
            hasher: ConfigHasher::new(),
            diff_engine: DiffEngine::new(),
        }
    }

    /// Creates a reconciler with the provider and state backend the
    /// workspace selects.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider or state store cannot be built.
    pub async fn from_config(config: WorkspaceConfig, workspace_dir: &Path) -> Result<Self> {
        let provider = crate::provider::from_config(&config)?;
        let store = crate::state::from_config(&config, workspace_dir).await?;
        info!(
            "Workspace {} using {} provider and {} state at {}",
            config.qualified_name(),
            provider.name(),
            store.backend_type(),
            store.location()
        );
        Ok(Self::new(config, workspace_dir, provider, store))
    }

    /// Replaces the renderer.
    #[must_use]
    pub fn with_renderer(mut self, renderer: Renderer) -> Self {
        self.renderer = renderer;
        self
    }

    /// Uses a shared cancellation flag for apply and destroy.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets how often the state lock is renewed while apply, destroy,
    /// render or a drift refresh runs.
    #[must_use]
    pub fn with_lock_renewal(mut self, interval: Duration) -> Self {
        self.lock_renewal = interval;
        self
    }

    /// Returns the workspace configuration.
    #[must_use]
    pub const fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// Returns the state store.
    #[must_use]
    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// Loads the declarations into a resource graph.
    ///
    /// # Errors
    ///
    /// Returns parse, duplicate-name and unresolved-reference errors.
    pub fn load_graph(&self) -> Result<ResourceGraph> {
        DeclarationLoader::new(self.config.variables.clone())
            .load(&self.workspace_dir, &self.config.sources)
    }

    /// Loads state, or a fresh empty state if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if state exists but cannot be read.
    pub async fn load_state(&self) -> Result<DeploymentState> {
        let state = self.store.load().await?;
        Ok(state.unwrap_or_else(|| {
            DeploymentState::new(&self.config.project.name, &self.config.project.environment)
        }))
    }

    /// Fetches kind schemas from the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot be reached.
    pub async fn schemas(&self) -> Result<SchemaRegistry> {
        Ok(self.provider.schemas().await?)
    }

    /// Validates the workspace and the declarations.
    ///
    /// Falls back to built-in schemas when the provider is unreachable.
    ///
    /// # Errors
    ///
    /// Returns the first structural or validation error.
    pub async fn validate(&self) -> Result<ValidationResult> {
        let schemas = self.schemas().await.unwrap_or_else(|e| {
            warn!("Using built-in schemas: {e}");
            SchemaRegistry::builtin()
        });
        let validator = ConfigValidator::new(schemas);

        let mut result = validator.validate(&self.config)?;
        let graph = self.load_graph()?;
        graph.topological_order()?;
        let graph_result = validator.validate_graph(&graph, self.renderer.host_os())?;
        result.warnings.extend(graph_result.warnings);
        info!("Validated {} resources", graph.len());
        Ok(result)
    }

    /// Computes the plan without changing anything.
    ///
    /// # Errors
    ///
    /// Returns structural errors, or an error if state cannot be read.
    pub async fn plan(&self) -> Result<PlanReport> {
        let (graph, schemas, warnings) = self.prepare().await?;
        let state = self.load_state().await?;

        let diff = self.diff_engine.compute_diff(&graph, &state, &schemas)?;
        let plan = DeploymentPlan::from_diff(&diff, &graph, &state, &self.hasher.hash_graph(&graph))?;
        info!("Plan: {}", plan.summary());

        Ok(PlanReport {
            diff,
            plan,
            warnings,
        })
    }

    /// Computes the teardown plan without changing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read.
    pub async fn plan_destroy(&self) -> Result<DeploymentPlan> {
        let state = self.load_state().await?;
        Ok(DeploymentPlan::destroy(&state)?)
    }

    /// Plans and applies the declarations, then renders local artifacts.
    ///
    /// Action and render failures are reported in the result together with
    /// the partial state; only errors before execution return `Err`.
    ///
    /// # Errors
    ///
    /// Returns structural errors, lock conflicts and state I/O errors.
    pub async fn apply(&self) -> Result<ReconciliationResult> {
        self.apply_checked(None).await
    }

    /// Like [`Reconciler::apply`], but refuses to run unless the plan
    /// computed under the lock matches `reviewed`.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::PlanChanged` if declarations or state moved on
    /// since `reviewed` was produced, plus everything `apply` returns.
    pub async fn apply_reviewed(&self, reviewed: &DeploymentPlan) -> Result<ReconciliationResult> {
        self.apply_checked(Some(reviewed)).await
    }

    async fn apply_checked(&self, reviewed: Option<&DeploymentPlan>) -> Result<ReconciliationResult> {
        let (graph, schemas, _) = self.prepare().await?;
        self.with_lock("apply", || self.apply_locked(&graph, &schemas, reviewed))
            .await
    }

    /// Destroys everything recorded in state, in reverse dependency order,
    /// and removes rendered artifacts.
    ///
    /// # Errors
    ///
    /// Returns lock conflicts and state I/O errors.
    pub async fn destroy(&self) -> Result<ReconciliationResult> {
        self.with_lock("destroy", || self.destroy_locked()).await
    }

    /// Re-renders local artifacts from current state.
    ///
    /// # Errors
    ///
    /// Returns unresolved-output, template and write errors.
    pub async fn render(&self) -> Result<Vec<RenderedArtifact>> {
        let graph = self.load_graph()?;
        self.with_lock("render", || async {
            let mut state = self.load_state().await?;
            self.render_outputs(&graph, &mut state).await
        })
        .await
    }

    /// Returns the outputs recorded by the last apply.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read.
    pub async fn outputs(&self) -> Result<BTreeMap<String, OutputValue>> {
        Ok(self.load_state().await?.outputs)
    }

    /// Compares state with what the provider reports.
    ///
    /// With `refresh`, missing resources are dropped from state and drifted
    /// attributes are recorded, so the next plan corrects them.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider fails or state cannot be written.
    pub async fn drift(&self, refresh: bool) -> Result<DriftReport> {
        if refresh {
            self.with_lock("refresh", || self.check_drift(true)).await
        } else {
            self.check_drift(false).await
        }
    }

    /// Loads, orders and validates declarations and fetches schemas.
    async fn prepare(&self) -> Result<(ResourceGraph, SchemaRegistry, Vec<String>)> {
        let graph = self.load_graph()?;
        graph.topological_order()?;

        let schemas = self.schemas().await?;
        let validation = ConfigValidator::new(schemas.clone()).validate_graph(&graph, self.renderer.host_os())?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }
        Ok((graph, schemas, validation.warnings))
    }

    async fn with_lock<T, F, Fut>(&self, operation: &str, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.store.acquire_lock(&generate_holder_id(), operation).await?;

        let body = body();
        tokio::pin!(body);
        let mut renewal = tokio::time::interval(self.lock_renewal.max(Duration::from_millis(1)));
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renewal.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut body => break result,
                _ = renewal.tick() => self.renew_lock(&lock.lock_id).await,
            }
        };

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {}", lock.lock_id, e);
        }
        result
    }

    /// Renews the lock; once another holder has it, no new actions start.
    async fn renew_lock(&self, lock_id: &str) {
        match self.store.refresh_lock(lock_id).await {
            Ok(_) => {}
            Err(HalyardError::State(e @ StateError::LockedByOther { .. })) => {
                error!("Lost state lock {lock_id}: {e}");
                self.cancel.cancel();
            }
            Err(e) => warn!("Failed to renew state lock {lock_id}: {e}"),
        }
    }

    async fn apply_locked(
        &self,
        graph: &ResourceGraph,
        schemas: &SchemaRegistry,
        reviewed: Option<&DeploymentPlan>,
    ) -> Result<ReconciliationResult> {
        let state = self.load_state().await?;
        let diff = self.diff_engine.compute_diff(graph, &state, schemas)?;
        let plan = DeploymentPlan::from_diff(&diff, graph, &state, &self.hasher.hash_graph(graph))?;
        if let Some(reviewed) = reviewed
            && !plan.matches(reviewed)
        {
            return Err(PlanError::PlanChanged {
                message: format!("reviewed {}, now {}", reviewed.summary(), plan.summary()),
            }
            .into());
        }
        info!("Applying plan: {}", plan.summary());

        let (execution, mut state) = self.run_plan(&plan, state).await?;
        let mut result = ReconciliationResult::new(DeploymentOperation::Apply, plan, execution);

        if result.failure.is_none() {
            match self.render_outputs(graph, &mut state).await {
                Ok(rendered) => {
                    result.artifacts = rendered.into_iter().map(|a| a.state.path).collect();
                }
                Err(e) => result.fail(e),
            }
        } else {
            warn!("Skipping outputs and rendering after a failed apply");
        }

        result.outputs = state.outputs;
        Ok(result)
    }

    async fn destroy_locked(&self) -> Result<ReconciliationResult> {
        let state = self.load_state().await?;
        let plan = DeploymentPlan::destroy(&state)?;
        info!("Destroying {} resources", plan.action_count());

        let (execution, mut state) = self.run_plan(&plan, state).await?;
        let mut result = ReconciliationResult::new(DeploymentOperation::Destroy, plan, execution);
        if result.failure.is_some() || (state.artifacts.is_empty() && state.outputs.is_empty()) {
            result.outputs = state.outputs;
            return Ok(result);
        }

        match remove_artifacts(&state.artifacts).await {
            Ok(removed) => {
                result.artifacts = removed;
                state.artifacts.clear();
                state.outputs.clear();
                state.bump_serial();
                self.store.save(&state).await?;
            }
            Err(e) => result.fail(e),
        }
        result.outputs = state.outputs;
        Ok(result)
    }

    async fn run_plan(
        &self,
        plan: &DeploymentPlan,
        state: DeploymentState,
    ) -> Result<(Option<ExecutionResult>, DeploymentState)> {
        if plan.is_empty() {
            info!("No changes. Infrastructure matches the declarations.");
            return Ok((None, state));
        }

        let execution = PlanExecutor::new(Arc::clone(&self.provider), Arc::clone(&self.store))
            .with_config(&self.config.executor)
            .with_cancellation(self.cancel.clone())
            .execute(plan, state)
            .await?;
        let state = execution.state.clone();
        Ok((Some(execution), state))
    }

    /// Resolves outputs, renders every target and records both in state.
    async fn render_outputs(
        &self,
        graph: &ResourceGraph,
        state: &mut DeploymentState,
    ) -> Result<Vec<RenderedArtifact>> {
        let outputs = resolve_outputs(graph.outputs(), state)?;
        let mut dirty = state.outputs != outputs;
        state.outputs = outputs;

        let rendered = self.renderer.render_all(graph.renders(), &state.outputs).await;
        if let Ok(rendered) = &rendered {
            let current: BTreeMap<String, ArtifactState> = rendered
                .iter()
                .map(|a| (a.name.clone(), a.state.clone()))
                .collect();

            let stale: BTreeMap<String, ArtifactState> = state
                .artifacts
                .iter()
                .filter(|(name, old)| current.get(*name).is_none_or(|new| new.path != old.path))
                .map(|(name, old)| (name.clone(), old.clone()))
                .collect();
            if !stale.is_empty() {
                remove_artifacts(&stale).await?;
            }

            let same_files = state.artifacts.len() == current.len()
                && current.iter().all(|(name, new)| {
                    state
                        .artifacts
                        .get(name)
                        .is_some_and(|old| old.path == new.path && old.content_hash == new.content_hash)
                });
            if !same_files {
                state.artifacts = current;
                dirty = true;
            }
        }

        if dirty {
            state.bump_serial();
            self.store.save(state).await?;
            debug!("Recorded outputs and artifacts at serial {}", state.serial);
        }
        rendered
    }

    async fn check_drift(&self, refresh: bool) -> Result<DriftReport> {
        let mut state = self.load_state().await?;
        let retry = RetryPolicy::from_config(&self.config.executor);
        let mut entries = Vec::with_capacity(state.resources.len());

        for (id, recorded) in &state.resources {
            let label = format!("read {id}");
            let (result, _) = retry
                .run(&label, || self.provider.read(&recorded.kind, &recorded.provider_id))
                .await;

            let (status, changes) = match result {
                Ok(actual) => {
                    let changes: Vec<DriftChange> = recorded
                        .attributes
                        .iter()
                        .filter(|(attribute, _)| attribute.as_str() != "id")
                        .filter(|(attribute, value)| actual.attributes.get(*attribute) != Some(*value))
                        .map(|(attribute, value)| DriftChange {
                            attribute: attribute.clone(),
                            recorded: value.clone(),
                            actual: actual.attributes.get(attribute).cloned(),
                        })
                        .collect();
                    let status = if changes.is_empty() {
                        DriftStatus::InSync
                    } else {
                        DriftStatus::Changed
                    };
                    (status, changes)
                }
                Err(ProviderError::NotFound { .. }) => (DriftStatus::Missing, Vec::new()),
                Err(e) => return Err(e.into()),
            };

            if status != DriftStatus::InSync {
                warn!("{id} has drifted ({status})");
            }
            entries.push(DriftEntry {
                resource: id.clone(),
                provider_id: recorded.provider_id.clone(),
                status,
                changes,
            });
        }

        let drifted = entries.iter().any(|e| e.status != DriftStatus::InSync);
        if refresh && drifted {
            for entry in &entries {
                match entry.status {
                    DriftStatus::InSync => {}
                    DriftStatus::Missing => {
                        state.remove_resource(&entry.resource);
                    }
                    DriftStatus::Changed => {
                        if let Some(recorded) = state.resources.get_mut(&entry.resource) {
                            for change in &entry.changes {
                                match &change.actual {
                                    Some(value) => {
                                        recorded.attributes.insert(change.attribute.clone(), value.clone());
                                    }
                                    None => {
                                        recorded.attributes.remove(&change.attribute);
                                    }
                                }
                                // Forget the declared value so the next plan re-applies it.
                                recorded.declared.remove(&change.attribute);
                            }
                        }
                    }
                }
            }
            state.bump_serial();
            self.store.save(&state).await?;
            info!("Refreshed state from provider");
        }

        Ok(DriftReport {
            entries,
            refreshed: refresh && drifted,
        })
    }
}

impl ReconciliationResult {
    fn new(
        operation: DeploymentOperation,
        plan: DeploymentPlan,
        mut execution: Option<ExecutionResult>,
    ) -> Self {
        let failure = execution
            .as_mut()
            .and_then(|e| e.failure.take())
            .map(HalyardError::Apply);
        let errors = failure.iter().map(ToString::to_string).collect();
        Self {
            operation,
            plan,
            execution,
            outputs: BTreeMap::new(),
            artifacts: Vec::new(),
            success: failure.is_none(),
            errors,
            failure,
        }
    }

    fn fail(&mut self, error: HalyardError) {
        self.errors.push(error.to_string());
        self.success = false;
        self.failure.get_or_insert(error);
    }
}

impl DriftReport {
    /// Returns true if every resource matches state.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.entries.iter().all(|e| e.status == DriftStatus::InSync)
    }
}

impl std::fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InSync => "in sync",
            Self::Changed => "changed",
            Self::Missing => "missing",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected");
        }
        writeln!(f, "Drift detected:")?;
        for entry in self.entries.iter().filter(|e| e.status != DriftStatus::InSync) {
            writeln!(f, "  - {} ({}): {}", entry.resource, entry.provider_id, entry.status)?;
            for change in &entry.changes {
                let actual = change.actual.as_ref().map_or_else(|| String::from("<unset>"), ToString::to_string);
                writeln!(f, "      {}: {} -> {}", change.attribute, change.recorded, actual)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.success { "complete" } else { "failed" };
        writeln!(f, "{} {status}: {}", capitalize(&self.operation.to_string()), self.plan.summary())?;
        if let Some(execution) = &self.execution {
            writeln!(f, "  {execution}")?;
        }
        for path in &self.artifacts {
            writeln!(f, "  artifact: {}", path.display())?;
        }
        for error in &self.errors {
            writeln!(f, "  error: {error}")?;
        }
        Ok(())
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    chars
        .next()
        .map(|first| first.to_uppercase().chain(chars).collect())
        .unwrap_or_default()
}
