//! Plan executor.
//!
//! Actions run on a bounded pool of tokio tasks. An action is dispatched once
//! every action it waits on has succeeded. State lives behind one async
//! mutex that is held while the state is written, so every completed action
//! is persisted before the next one can record anything.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::error::{ApplyError, HalyardError, ProviderError, Result};
use crate::graph::AttributeRef;
use crate::graph::expr::resolve_attributes;
use crate::provider::{Provider, ProviderResource, ResourceRequest};
use crate::state::{
    DeploymentHistoryEntry, DeploymentOperation, DeploymentState, ResourceState, ResourceStatus,
    StateStore,
};

use super::plan::{ActionType, DeploymentPlan, PlannedAction};
use super::retry::RetryPolicy;

/// Shared flag that stops the executor from dispatching new actions.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    /// Creates a flag that is not set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Executor for deployment plans.
pub struct PlanExecutor {
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    parallelism: usize,
    retry: RetryPolicy,
    cancel: CancellationFlag,
}

/// Result of executing a single action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    /// Plan index of the action.
    pub index: usize,
    /// Action description, e.g. `create network.main`.
    pub action: String,
    /// Whether the action succeeded.
    pub success: bool,
    /// Provider calls made.
    pub attempts: u32,
    /// Provider id after the action, for creates and updates.
    pub provider_id: Option<String>,
    /// Error message if the action failed.
    pub error: Option<String>,
    /// Wall time spent on the action.
    pub duration_ms: u64,
}

/// Result of executing a plan.
#[derive(Debug, Serialize)]
pub struct ExecutionResult {
    /// Per-action results in completion order.
    pub results: Vec<ActionResult>,
    /// Number of actions dispatched.
    pub total_executed: usize,
    /// Number of successful actions.
    pub successful: usize,
    /// Number of failed actions.
    pub failed: usize,
    /// Actions never dispatched because of a failure or cancellation.
    pub not_started: usize,
    /// Whether every action ran and succeeded.
    pub success: bool,
    /// The failure that halted the plan.
    #[serde(skip)]
    pub failure: Option<ApplyError>,
    /// State after the last action.
    #[serde(skip)]
    pub state: DeploymentState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Everything one spawned action needs.
struct ActionTask {
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    state: Arc<Mutex<DeploymentState>>,
    retry: RetryPolicy,
    action: PlannedAction,
}

struct ActionOutcome {
    attempts: u32,
    provider_id: Option<String>,
    error: Option<ApplyError>,
    duration_ms: u64,
}

impl PlanExecutor {
    /// Creates an executor with default settings.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, store: Arc<dyn StateStore>) -> Self {
        let config = ExecutorConfig::default();
        Self {
            provider,
            store,
            parallelism: config.parallelism,
            retry: RetryPolicy::from_config(&config),
            cancel: CancellationFlag::new(),
        }
    }

    /// Applies parallelism and retry settings.
    #[must_use]
    pub fn with_config(mut self, config: &ExecutorConfig) -> Self {
        self.parallelism = config.parallelism.max(1);
        self.retry = RetryPolicy::from_config(config);
        self
    }

    /// Uses a shared cancellation flag.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Executes a plan against `state`.
    ///
    /// Action failures do not return `Err`: they halt dispatch and are
    /// reported in [`ExecutionResult::failure`] together with the partial
    /// state.
    ///
    /// # Errors
    ///
    /// Returns an error if the final state write fails or an action task
    /// panics.
    pub async fn execute(&self, plan: &DeploymentPlan, state: DeploymentState) -> Result<ExecutionResult> {
        let total = plan.actions.len();
        info!("Executing {} actions ({} at a time)", total, self.parallelism);

        let shared = Arc::new(Mutex::new(state));
        let mut status = vec![Status::Pending; total];
        let mut join_set: JoinSet<(usize, ActionOutcome)> = JoinSet::new();
        let mut results = Vec::new();
        let mut completed = Vec::new();
        let mut failure: Option<ApplyError> = None;
        let mut panicked: Option<String> = None;

        loop {
            let halted = failure.is_some() || panicked.is_some();
            if !halted && !self.cancel.is_cancelled() {
                self.dispatch(plan, &mut status, &mut join_set, &shared);
            } else if self.cancel.is_cancelled() && !join_set.is_empty() {
                debug!("Cancellation requested, waiting for {} in-flight actions", join_set.len());
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            let (index, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("Action task failed: {e}");
                    panicked.get_or_insert_with(|| e.to_string());
                    continue;
                }
            };

            let action = &plan.actions[index];
            let error_message = outcome.error.as_ref().map(ToString::to_string);
            match outcome.error {
                None => {
                    status[index] = Status::Succeeded;
                    info!("{} complete ({}ms)", action.description(), outcome.duration_ms);
                    completed.push(action.description());
                }
                Some(e) => {
                    status[index] = Status::Failed;
                    error!("{e}");
                    failure.get_or_insert(e);
                }
            }

            results.push(ActionResult {
                index,
                action: action.description(),
                success: error_message.is_none(),
                attempts: outcome.attempts,
                provider_id: outcome.provider_id,
                error: error_message,
                duration_ms: outcome.duration_ms,
            });
        }

        let not_started = status.iter().filter(|s| **s == Status::Pending).count();
        if failure.is_none() && not_started > 0 {
            warn!("Stopped with {not_started} actions not started");
            failure = Some(ApplyError::Cancelled {
                completed: completed.len(),
                pending: not_started,
            });
        }

        let final_state = {
            let mut state = shared.lock().await;
            state.add_history(DeploymentHistoryEntry::new(
                plan.operation,
                &plan.config_hash,
                completed,
                failure.as_ref().map(ToString::to_string),
            ));
            if failure.is_none() && plan.operation == DeploymentOperation::Apply {
                state.config_hash.clone_from(&plan.config_hash);
            }
            state.bump_serial();
            self.store.save(&state).await?;
            state.clone()
        };

        if let Some(message) = panicked {
            return Err(HalyardError::internal(format!("Action task panicked: {message}")));
        }

        let successful = results.iter().filter(|r| r.success).count();
        let failed = results.len() - successful;
        let result = ExecutionResult {
            total_executed: results.len(),
            successful,
            failed,
            not_started,
            success: failure.is_none(),
            results,
            failure,
            state: final_state,
        };
        info!("{result}");
        Ok(result)
    }

    /// Spawns ready actions until the pool is full.
    fn dispatch(
        &self,
        plan: &DeploymentPlan,
        status: &mut [Status],
        join_set: &mut JoinSet<(usize, ActionOutcome)>,
        shared: &Arc<Mutex<DeploymentState>>,
    ) {
        for index in 0..plan.actions.len() {
            if join_set.len() >= self.parallelism {
                break;
            }
            let action = &plan.actions[index];
            let ready = status[index] == Status::Pending
                && action
                    .dependencies
                    .iter()
                    .all(|&dep| status.get(dep) == Some(&Status::Succeeded));
            if !ready {
                continue;
            }

            status[index] = Status::Running;
            debug!("Dispatching {}", action.description());
            let task = ActionTask {
                provider: Arc::clone(&self.provider),
                store: Arc::clone(&self.store),
                state: Arc::clone(shared),
                retry: self.retry,
                action: action.clone(),
            };
            join_set.spawn(async move { (index, task.run().await) });
        }
    }
}

impl ActionTask {
    async fn run(self) -> ActionOutcome {
        let started = Instant::now();
        info!("{} ({})", self.action.description(), self.action.reason);

        let (result, attempts) = match self.action.action_type {
            ActionType::Create => self.create().await,
            ActionType::Update => self.update().await,
            ActionType::Destroy => self.destroy().await,
        };

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match result {
            Ok(provider_id) => ActionOutcome {
                attempts,
                provider_id,
                error: None,
                duration_ms,
            },
            Err(e) => ActionOutcome {
                attempts,
                provider_id: None,
                error: Some(e),
                duration_ms,
            },
        }
    }

    async fn create(&self) -> (std::result::Result<Option<String>, ApplyError>, u32) {
        let request = match self.request().await {
            Ok(request) => request,
            Err(e) => return (Err(e), 0),
        };

        let label = self.action.description();
        let (result, attempts) = self.retry.run(&label, || self.provider.create(&request)).await;
        let created = match result {
            Ok(created) => created,
            Err(e) => return (Err(self.failed(attempts, &e.to_string())), attempts),
        };

        let provider_id = created.id.clone();
        let record = self.record(created);
        let saved = self.persist(move |state| state.set_resource(record)).await;
        (self.after_save(saved, &provider_id, attempts), attempts)
    }

    async fn update(&self) -> (std::result::Result<Option<String>, ApplyError>, u32) {
        let Some(provider_id) = self.action.provider_id.clone() else {
            return (Err(self.failed(0, "no provider id recorded")), 0);
        };
        let request = match self.request().await {
            Ok(request) => request,
            Err(e) => return (Err(e), 0),
        };

        let label = self.action.description();
        let (result, attempts) = self
            .retry
            .run(&label, || self.provider.update(&provider_id, &request))
            .await;

        match result {
            Ok(updated) => {
                let record = self.record(updated);
                let saved = self
                    .persist(move |state| {
                        let id = record.id();
                        match state.resources.get_mut(&id) {
                            Some(existing) => {
                                existing.declared = record.declared;
                                existing.declared_hash = record.declared_hash;
                                existing.attributes = record.attributes;
                                existing.dependencies = record.dependencies;
                                existing.set_status(ResourceStatus::Created);
                            }
                            None => state.set_resource(record),
                        }
                    })
                    .await;
                (self.after_save(saved, &provider_id, attempts), attempts)
            }
            Err(e) => {
                let id = self.action.resource.clone();
                let tainted = self
                    .persist(move |state| {
                        if let Some(existing) = state.resources.get_mut(&id) {
                            existing.set_status(ResourceStatus::Tainted);
                        }
                    })
                    .await;
                if let Err(save) = tainted {
                    warn!("Could not mark {} as tainted: {}", self.action.resource, save);
                }
                (Err(self.failed(attempts, &e.to_string())), attempts)
            }
        }
    }

    async fn destroy(&self) -> (std::result::Result<Option<String>, ApplyError>, u32) {
        let kind = &self.action.resource.kind;
        let mut attempts = 0;

        if let Some(provider_id) = &self.action.provider_id {
            let label = self.action.description();
            let (result, made) = self.retry.run(&label, || self.provider.delete(kind, provider_id)).await;
            attempts = made;
            match result {
                Ok(()) => {}
                Err(ProviderError::NotFound { .. }) => {
                    debug!("{} was already gone", self.action.resource);
                }
                Err(e) => return (Err(self.failed(attempts, &e.to_string())), attempts),
            }
        }

        let id = self.action.resource.clone();
        let saved = self
            .persist(move |state| {
                state.remove_resource(&id);
            })
            .await;
        let result = saved
            .map(|()| None)
            .map_err(|e| self.failed(attempts, &format!("deleted but state could not be saved: {e}")));
        (result, attempts)
    }

    /// Resolves references against current state.
    async fn request(&self) -> std::result::Result<ResourceRequest, ApplyError> {
        let state = self.state.lock().await;
        let mut lookup = |reference: &AttributeRef| -> std::result::Result<Value, String> {
            let recorded = state
                .get(&reference.target)
                .ok_or_else(|| format!("{} has not been created", reference.target))?;
            recorded
                .attribute(&reference.attribute)
                .ok_or_else(|| format!("{} has no attribute '{}'", reference.target, reference.attribute))
        };

        let attributes: BTreeMap<String, Value> = resolve_attributes(&self.action.attributes, &mut lookup)
            .map_err(|failure| ApplyError::UnresolvedValue {
                resource: self.action.resource.to_string(),
                reference: failure.reference,
                reason: failure.reason,
            })?;

        Ok(ResourceRequest {
            kind: self.action.resource.kind.clone(),
            name: self.action.resource.name.clone(),
            attributes,
        })
    }

    fn record(&self, reported: ProviderResource) -> ResourceState {
        let provider_id = reported.id.clone();
        ResourceState::new(
            &self.action.resource,
            &provider_id,
            self.action.attributes.clone(),
            self.action.new_hash.as_deref().unwrap_or_default(),
            reported.into_state_attributes(),
            self.action.resource_dependencies.clone(),
        )
    }

    /// Applies `mutate` and writes the state while holding the lock.
    async fn persist<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut DeploymentState) + Send,
    {
        let mut state = self.state.lock().await;
        mutate(&mut state);
        state.bump_serial();
        self.store.save(&state).await
    }

    fn after_save(
        &self,
        saved: Result<()>,
        provider_id: &str,
        attempts: u32,
    ) -> std::result::Result<Option<String>, ApplyError> {
        match saved {
            Ok(()) => Ok(Some(provider_id.to_string())),
            Err(e) => Err(self.failed(
                attempts,
                &format!("applied as {provider_id} but state could not be saved: {e}"),
            )),
        }
    }

    fn failed(&self, attempts: u32, message: &str) -> ApplyError {
        ApplyError::ActionFailed {
            resource: self.action.resource.to_string(),
            operation: self.action.action_type.to_string(),
            attempts,
            message: message.to_string(),
        }
    }
}

impl ExecutionResult {
    /// Returns true if every action ran and succeeded.
    #[must_use]
    pub const fn all_successful(&self) -> bool {
        self.success
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Executed {} actions: {} successful, {} failed, {} not started",
            self.total_executed, self.successful, self.failed, self.not_started
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ResourceGraph, ResourceId};
    use crate::planner::diff::DiffEngine;
    use crate::planner::diff::tests::{resource, sample_graph};
    use crate::provider::{InMemoryProvider, SchemaRegistry};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use crate::state::LocalStateStore;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        provider: Arc<InMemoryProvider>,
        store: Arc<LocalStateStore>,
        _dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().expect("temp dir");
            Self {
                provider: Arc::new(InMemoryProvider::new()),
                store: Arc::new(LocalStateStore::with_base_dir(dir.path().join(".halyard"))),
                _dir: dir,
            }
        }

        fn executor(&self) -> PlanExecutor {
            PlanExecutor::new(self.provider.clone(), self.store.clone()).with_config(&ExecutorConfig {
                parallelism: 4,
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
            })
        }
    }

    fn plan(graph: &ResourceGraph, state: &DeploymentState) -> DeploymentPlan {
        let diff = DiffEngine::new()
            .compute_diff(graph, state, &SchemaRegistry::builtin())
            .expect("diff");
        DeploymentPlan::from_diff(&diff, graph, state, "hash-1").expect("plan")
    }

    #[tokio::test]
    async fn test_apply_records_provider_attributes() {
        let h = Harness::new();
        let graph = sample_graph("10.0.0.0/16", "a");
        let empty = DeploymentState::new("devbox", "dev");

        let result = h.executor().execute(&plan(&graph, &empty), empty).await.expect("execute");

        assert!(result.all_successful());
        assert_eq!(result.successful, 3);
        let network_id = h.provider.find("network", "main").expect("network exists");
        let subnet = result
            .state
            .get(&ResourceId::new("subnet", "public"))
            .expect("subnet recorded");
        assert_eq!(subnet.attributes["network_id"], json!(network_id));
        assert_eq!(subnet.declared["network_id"], json!("${network.main.id}"));
        let instance = result.state.get(&ResourceId::new("instance", "dev")).expect("instance");
        assert!(instance.attributes.contains_key("public_ip"));

        // three action writes plus the history write
        assert_eq!(result.state.serial, 4);
        assert_eq!(result.state.config_hash, "hash-1");
        let saved = h.store.load().await.expect("load").expect("saved");
        assert_eq!(saved, result.state);
    }

    #[tokio::test]
    async fn test_second_apply_is_a_no_op() {
        let h = Harness::new();
        let graph = sample_graph("10.0.0.0/16", "a");
        let empty = DeploymentState::new("devbox", "dev");
        let first = h.executor().execute(&plan(&graph, &empty), empty).await.expect("execute");

        assert!(plan(&graph, &first.state).is_empty());
    }

    #[tokio::test]
    async fn test_transient_errors_exhaust_and_halt() {
        let h = Harness::new();
        h.provider.inject_transient("public", 10);
        let graph = sample_graph("10.0.0.0/16", "a");
        let empty = DeploymentState::new("devbox", "dev");

        let result = h.executor().execute(&plan(&graph, &empty), empty).await.expect("execute");

        assert!(!result.success);
        assert_eq!(result.not_started, 1);
        assert!(matches!(
            result.failure,
            Some(ApplyError::ActionFailed { attempts: 3, ref resource, .. }) if resource == "subnet.public"
        ));
        assert!(result.state.get(&ResourceId::new("network", "main")).is_some());
        assert!(result.state.get(&ResourceId::new("subnet", "public")).is_none());

        let saved = h.store.load().await.expect("load").expect("saved");
        assert_eq!(saved.resources.len(), 1);
        let last = saved.history.last().expect("history entry");
        assert!(!last.success);
        assert_eq!(last.actions, vec![String::from("create network.main")]);
        assert_ne!(saved.config_hash, "hash-1");
    }

    #[tokio::test]
    async fn test_transient_errors_within_budget_succeed() {
        let h = Harness::new();
        h.provider.inject_transient("dev", 2);
        let graph = sample_graph("10.0.0.0/16", "a");
        let empty = DeploymentState::new("devbox", "dev");

        let result = h.executor().execute(&plan(&graph, &empty), empty).await.expect("execute");

        assert!(result.success);
        let instance = result
            .results
            .iter()
            .find(|r| r.action == "create instance.dev")
            .expect("instance result");
        assert_eq!(instance.attempts, 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let h = Harness::new();
        h.provider.inject_fatal("dev", "image not found");
        let graph = sample_graph("10.0.0.0/16", "a");
        let empty = DeploymentState::new("devbox", "dev");

        let result = h.executor().execute(&plan(&graph, &empty), empty).await.expect("execute");

        let message = result.failure.as_ref().map(ToString::to_string).expect("failure");
        assert!(message.contains("create instance.dev after 1 attempt"));
        assert!(message.contains("image not found"));
        assert_eq!(result.state.resources.len(), 2);
    }

    #[tokio::test]
    async fn test_destroy_runs_in_reverse_order() {
        let h = Harness::new();
        let graph = sample_graph("10.0.0.0/16", "a");
        let empty = DeploymentState::new("devbox", "dev");
        let applied = h.executor().execute(&plan(&graph, &empty), empty).await.expect("apply");

        let teardown = DeploymentPlan::destroy(&applied.state).expect("destroy plan");
        let result = h.executor().execute(&teardown, applied.state).await.expect("destroy");

        assert!(result.success);
        assert!(result.state.resources.is_empty());
        assert_eq!(h.provider.resource_count(), 0);
        let deleted: Vec<String> = h
            .provider
            .calls()
            .into_iter()
            .filter(|c| c.operation == "delete")
            .map(|c| c.kind)
            .collect();
        assert_eq!(deleted, vec!["instance", "subnet", "network"]);
    }

    #[tokio::test]
    async fn test_delete_of_missing_resource_succeeds() {
        let h = Harness::new();
        let graph = sample_graph("10.0.0.0/16", "a");
        let empty = DeploymentState::new("devbox", "dev");
        let applied = h.executor().execute(&plan(&graph, &empty), empty).await.expect("apply");
        let instance_id = h.provider.find("instance", "dev").expect("instance");
        h.provider.forget(&instance_id);

        let teardown = DeploymentPlan::destroy(&applied.state).expect("destroy plan");
        let result = h.executor().execute(&teardown, applied.state).await.expect("destroy");
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_failed_update_taints_resource() {
        let h = Harness::new();
        let empty = DeploymentState::new("devbox", "dev");
        let graph = sample_graph("10.0.0.0/16", "a");
        let applied = h.executor().execute(&plan(&graph, &empty), empty).await.expect("apply");

        h.provider.inject_fatal("public", "tags rejected");
        let changed = sample_graph("10.0.0.0/16", "b");
        let result = h
            .executor()
            .execute(&plan(&changed, &applied.state), applied.state)
            .await
            .expect("execute");

        assert!(!result.success);
        let subnet = result.state.get(&ResourceId::new("subnet", "public")).expect("subnet");
        assert_eq!(subnet.status, ResourceStatus::Tainted);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = Harness::new();
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let graph = sample_graph("10.0.0.0/16", "a");
        let empty = DeploymentState::new("devbox", "dev");

        let result = h
            .executor()
            .with_cancellation(cancel)
            .execute(&plan(&graph, &empty), empty)
            .await
            .expect("execute");

        assert!(matches!(
            result.failure,
            Some(ApplyError::Cancelled { completed: 0, pending: 3 })
        ));
        assert!(h.provider.calls().is_empty());
    }

    /// Requests cancellation while its first create is in flight.
    struct InterruptingProvider {
        inner: InMemoryProvider,
        cancel: CancellationFlag,
    }

    #[async_trait]
    impl Provider for InterruptingProvider {
        fn name(&self) -> &'static str {
            "interrupting"
        }

        async fn create(
            &self,
            request: &ResourceRequest,
        ) -> std::result::Result<ProviderResource, ProviderError> {
            self.cancel.cancel();
            self.inner.create(request).await
        }

        async fn read(&self, kind: &str, id: &str) -> std::result::Result<ProviderResource, ProviderError> {
            self.inner.read(kind, id).await
        }

        async fn update(
            &self,
            id: &str,
            request: &ResourceRequest,
        ) -> std::result::Result<ProviderResource, ProviderError> {
            self.inner.update(id, request).await
        }

        async fn delete(&self, kind: &str, id: &str) -> std::result::Result<(), ProviderError> {
            self.inner.delete(kind, id).await
        }
    }

    #[tokio::test]
    async fn test_cancellation_lets_in_flight_action_finish() {
        let h = Harness::new();
        let cancel = CancellationFlag::new();
        let provider = Arc::new(InterruptingProvider {
            inner: InMemoryProvider::new(),
            cancel: cancel.clone(),
        });
        let graph = sample_graph("10.0.0.0/16", "a");
        let empty = DeploymentState::new("devbox", "dev");

        let result = PlanExecutor::new(provider.clone(), h.store.clone())
            .with_cancellation(cancel)
            .execute(&plan(&graph, &empty), empty)
            .await
            .expect("execute");

        assert!(matches!(
            result.failure,
            Some(ApplyError::Cancelled { completed: 1, pending: 2 })
        ));
        assert!(result.state.get(&ResourceId::new("network", "main")).is_some());
        assert_eq!(provider.inner.resource_count(), 1);
    }

    /// Holds every create open for a while and records how many overlap.
    struct SlowProvider {
        inner: InMemoryProvider,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Provider for SlowProvider {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn create(
            &self,
            request: &ResourceRequest,
        ) -> std::result::Result<ProviderResource, ProviderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.create(request).await
        }

        async fn read(&self, kind: &str, id: &str) -> std::result::Result<ProviderResource, ProviderError> {
            self.inner.read(kind, id).await
        }

        async fn update(
            &self,
            id: &str,
            request: &ResourceRequest,
        ) -> std::result::Result<ProviderResource, ProviderError> {
            self.inner.update(id, request).await
        }

        async fn delete(&self, kind: &str, id: &str) -> std::result::Result<(), ProviderError> {
            self.inner.delete(kind, id).await
        }
    }

    #[tokio::test]
    async fn test_independent_actions_overlap_up_to_parallelism() {
        let h = Harness::new();
        let provider = Arc::new(SlowProvider {
            inner: InMemoryProvider::new(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let keys = (1..=6)
            .map(|i| resource("key_pair", &format!("k{i}"), &[("key_name", json!(format!("k{i}")))]))
            .collect();
        let graph = ResourceGraph::new(keys, Vec::new(), Vec::new());
        let empty = DeploymentState::new("devbox", "dev");

        let result = PlanExecutor::new(provider.clone(), h.store.clone())
            .with_config(&ExecutorConfig {
                parallelism: 3,
                max_attempts: 1,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
            })
            .execute(&plan(&graph, &empty), empty)
            .await
            .expect("execute");

        assert!(result.success);
        assert_eq!(result.successful, 6);
        assert_eq!(result.state.resources.len(), 6);
        assert_eq!(provider.peak.load(Ordering::SeqCst), 3);
        assert_eq!(provider.inner.resource_count(), 6);
    }
}
