//! One reconciliation cycle for one environment.
//!
//! [`Reconciler::prepare`] validates the graph, takes the environment lock,
//! loads the snapshot and plans. The returned [`PreparedCycle`] owns the lock
//! and keeps it alive in the background for as long as it exists, including
//! while the plan waits for approval and while a step runs. Applying or
//! abandoning it always releases the lock, and a cycle that changed anything
//! always commits what it did before reporting.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DesiredConfiguration, KeelConfig};
use crate::error::{KeelError, Result};
use crate::graph::{ExecutionOrder, ResourceGraph};
use crate::planner::{
    AppliedStep, ChangePlan, DEFAULT_STEP_TIMEOUT, PlanExecutor, Planner, StepObserver,
};
use crate::provision::ProvisionerRegistry;
use crate::state::{
    CycleOperation, CycleRecord, LockInfo, LockWait, StateSnapshot, StateStore,
    acquire_with_policy, generate_holder_id,
};

/// Locking and execution knobs for a reconciler.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// How long to wait for a held lock.
    pub lock_wait: LockWait,
    /// Whether an expired lock may be broken automatically.
    pub take_over_stale: bool,
    /// Per-step provisioning timeout.
    pub step_timeout: Duration,
    /// Identity recorded in the lock.
    pub holder: String,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            lock_wait: LockWait::FailFast,
            take_over_stale: false,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            holder: generate_holder_id(),
        }
    }
}

impl ReconcileSettings {
    /// Reads the settings from the `state` and `execution` sections.
    #[must_use]
    pub fn from_config(config: &KeelConfig) -> Self {
        Self {
            lock_wait: LockWait::from_secs(config.state.lock_wait_secs),
            take_over_stale: config.state.take_over_stale_locks,
            step_timeout: Duration::from_secs(config.execution.step_timeout_secs),
            holder: generate_holder_id(),
        }
    }
}

/// Drives cycles against one environment's store.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    registry: ProvisionerRegistry,
    settings: ReconcileSettings,
    planner: Planner,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("environment", &self.store.environment())
            .field("backend", &self.store.backend_type())
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Shortest interval between background lock renewals.
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(100);

/// A planned cycle holding the environment lock.
pub struct PreparedCycle {
    store: Arc<dyn StateStore>,
    registry: ProvisionerRegistry,
    step_timeout: Duration,
    operation: CycleOperation,
    keeper: LockKeeper,
    snapshot: StateSnapshot,
    order: ExecutionOrder,
    plan: ChangePlan,
}

/// What a completed cycle did.
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    /// Environment reconciled.
    pub environment: String,
    /// Apply or teardown.
    pub operation: CycleOperation,
    /// The plan that was applied.
    pub plan: ChangePlan,
    /// Steps that ran.
    pub applied: Vec<AppliedStep>,
    /// Serial of the committed snapshot, if anything was committed.
    pub committed_serial: Option<u64>,
}

/// Renews the environment lock every third of its ttl until stopped.
struct LockKeeper {
    lock: Arc<Mutex<LockInfo>>,
    lock_id: String,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LockKeeper {
    fn spawn(store: Arc<dyn StateStore>, lock: LockInfo) -> Self {
        let interval = renewal_interval(lock.ttl_secs);
        let lock_id = lock.lock_id.clone();
        let lock = Arc::new(Mutex::new(lock));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn({
            let lock = Arc::clone(&lock);
            let stop = shutdown.clone();
            async move {
                let mut ticks =
                    tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        () = stop.cancelled() => break,
                        _ = ticks.tick() => {}
                    }
                    let mut held = lock.lock().await;
                    if let Err(err) = store.renew_lock(&mut held).await {
                        error!(
                            environment = %held.environment,
                            lock_id = %held.lock_id,
                            "Lost state lock: {err}"
                        );
                        break;
                    }
                    debug!(remaining_secs = held.remaining_secs(), "Lock kept alive");
                }
            }
        });

        Self {
            lock,
            lock_id,
            shutdown,
            task: Some(task),
        }
    }

    /// Stops the background renewals and returns the lock as last renewed.
    async fn stop(mut self) -> LockInfo {
        self.shutdown.cancel();
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            warn!(lock_id = %self.lock_id, "Lock renewal task failed: {err}");
        }
        self.lock.lock().await.clone()
    }
}

impl Drop for LockKeeper {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn renewal_interval(ttl_secs: u64) -> Duration {
    Duration::from_millis(ttl_secs.saturating_mul(1000) / 3).max(MIN_RENEWAL_INTERVAL)
}

/// Renews the environment lock after every step.
struct LockRenewer {
    store: Arc<dyn StateStore>,
    lock: Arc<Mutex<LockInfo>>,
}

#[async_trait]
impl StepObserver for LockRenewer {
    async fn step_applied(&self, step: &AppliedStep) -> Result<()> {
        let mut lock = self.lock.lock().await;
        self.store.renew_lock(&mut lock).await?;
        debug!(module = %step.module, remaining_secs = lock.remaining_secs(), "Lock renewed");
        Ok(())
    }
}

impl Reconciler {
    /// Creates a reconciler with default settings.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, registry: ProvisionerRegistry) -> Self {
        Self {
            store,
            registry,
            settings: ReconcileSettings::default(),
            planner: Planner::new(),
        }
    }

    /// Replaces the settings.
    #[must_use]
    pub fn with_settings(mut self, settings: ReconcileSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Environment this reconciler manages.
    #[must_use]
    pub fn environment(&self) -> &str {
        self.store.environment()
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Plans a cycle that converges the environment on `desired`.
    ///
    /// The graph is validated before the lock is taken, so a bad
    /// configuration never contends for it.
    ///
    /// # Errors
    ///
    /// Returns a graph error, a lock error, or a planning error. The lock is
    /// released if planning fails after it was acquired.
    pub async fn prepare(&self, desired: &DesiredConfiguration) -> Result<PreparedCycle> {
        let order = ResourceGraph::from_desired(desired).build()?;
        debug!(environment = self.environment(), order = ?order.as_slice(), "Execution order");

        let lock = self.acquire().await?;
        let planned = async {
            let snapshot = self.store.load_snapshot().await?;
            let plan = self.planner.plan(desired, &snapshot, &order)?;
            Ok::<_, KeelError>((snapshot, plan))
        }
        .await;

        match planned {
            Ok((snapshot, plan)) => {
                info!(environment = self.environment(), "{}", plan.summary());
                Ok(self.prepared(CycleOperation::Apply, lock, snapshot, order, plan))
            }
            Err(err) => {
                self.release(&lock).await;
                Err(err)
            }
        }
    }

    /// Plans a cycle that destroys every module in the environment.
    ///
    /// # Errors
    ///
    /// Returns a lock error or an error loading the snapshot.
    pub async fn prepare_teardown(&self) -> Result<PreparedCycle> {
        let lock = self.acquire().await?;
        let planned = async {
            let snapshot = self.store.load_snapshot().await?;
            let order = ResourceGraph::from_snapshot(&snapshot).build()?.reversed();
            let plan = self.planner.plan_teardown(&snapshot)?;
            Ok::<_, KeelError>((snapshot, order, plan))
        }
        .await;

        match planned {
            Ok((snapshot, order, plan)) => {
                Ok(self.prepared(CycleOperation::Teardown, lock, snapshot, order, plan))
            }
            Err(err) => {
                self.release(&lock).await;
                Err(err)
            }
        }
    }

    async fn acquire(&self) -> Result<LockInfo> {
        acquire_with_policy(
            self.store.as_ref(),
            &self.settings.holder,
            self.settings.lock_wait,
            self.settings.take_over_stale,
        )
        .await
    }

    async fn release(&self, lock: &LockInfo) {
        release(self.store.as_ref(), lock).await;
    }

    fn prepared(
        &self,
        operation: CycleOperation,
        lock: LockInfo,
        snapshot: StateSnapshot,
        order: ExecutionOrder,
        plan: ChangePlan,
    ) -> PreparedCycle {
        PreparedCycle {
            keeper: LockKeeper::spawn(Arc::clone(&self.store), lock),
            store: Arc::clone(&self.store),
            registry: self.registry.clone(),
            step_timeout: self.settings.step_timeout,
            operation,
            snapshot,
            order,
            plan,
        }
    }
}

async fn release(store: &dyn StateStore, lock: &LockInfo) {
    if let Err(err) = store.release_lock(lock).await {
        warn!(environment = store.environment(), lock_id = %lock.lock_id, "Failed to release lock: {err}");
    }
}

impl std::fmt::Debug for PreparedCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedCycle")
            .field("environment", &self.plan.environment)
            .field("operation", &self.operation)
            .field("lock_id", &self.keeper.lock_id)
            .field("serial", &self.snapshot.serial)
            .finish_non_exhaustive()
    }
}

impl PreparedCycle {
    /// The computed plan.
    #[must_use]
    pub const fn plan(&self) -> &ChangePlan {
        &self.plan
    }

    /// The snapshot the plan was computed against.
    #[must_use]
    pub const fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }

    /// The execution order the plan follows.
    #[must_use]
    pub const fn order(&self) -> &ExecutionOrder {
        &self.order
    }

    /// The held lock, as last renewed.
    pub async fn lock(&self) -> LockInfo {
        self.keeper.lock.lock().await.clone()
    }

    /// Records the configuration hash on the plan.
    #[must_use]
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.plan.config_hash = Some(hash.into());
        self
    }

    /// Releases the lock without applying anything.
    pub async fn abandon(self) {
        debug!(environment = %self.plan.environment, "Abandoning cycle");
        let lock = self.keeper.stop().await;
        release(self.store.as_ref(), &lock).await;
    }

    /// Applies the plan, commits the resulting snapshot and releases the lock.
    ///
    /// A plan without changes commits nothing. If a step fails, the snapshot
    /// holding every step applied so far is committed before the
    /// [`KeelError::PartialApply`] is returned; a failure to commit it is
    /// attached to that error.
    ///
    /// The lock is renewed before the first step, so a cycle whose lock was
    /// lost while it waited runs nothing.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::PartialApply`] if the apply halted, or a state
    /// error if the lock was lost before the first step or the final commit
    /// failed.
    pub async fn apply(
        self,
        cancel: &CancellationToken,
        trigger: Option<String>,
    ) -> Result<CycleOutcome> {
        let Self {
            store,
            registry,
            step_timeout,
            operation,
            keeper,
            snapshot,
            order: _,
            plan,
        } = self;

        if !plan.has_changes() {
            info!(environment = %plan.environment, "No changes required, state is converged");
            let lock = keeper.stop().await;
            release(store.as_ref(), &lock).await;
            return Ok(CycleOutcome {
                environment: plan.environment.clone(),
                operation,
                plan,
                applied: Vec::new(),
                committed_serial: None,
            });
        }

        let renewed = {
            let mut held = keeper.lock.lock().await;
            store.renew_lock(&mut held).await
        };
        if let Err(err) = renewed {
            error!(environment = %plan.environment, "Lock lost before applying: {err}");
            keeper.stop().await;
            return Err(err);
        }

        let renewer = Arc::new(LockRenewer {
            store: Arc::clone(&store),
            lock: Arc::clone(&keeper.lock),
        });
        let executor = PlanExecutor::new(registry)
            .with_step_timeout(step_timeout)
            .with_observer(renewer as Arc<dyn StepObserver>);

        let serial = snapshot.serial + 1;
        let result = executor.apply(&plan, snapshot, cancel).await;
        let lock = keeper.stop().await;

        let outcome = match result {
            Ok(applied) => {
                let mut snapshot = applied.snapshot;
                let changed = applied.applied.iter().map(|s| s.module.clone()).collect();
                record(&mut snapshot, serial, operation, changed, trigger, None);

                let committed = if operation == CycleOperation::Teardown {
                    store.teardown(&lock).await
                } else {
                    store.commit_snapshot(&snapshot, &lock).await
                };
                if let Err(err) = committed {
                    error!(
                        environment = %plan.environment,
                        applied = ?plan.changed_modules(),
                        "Applied changes but failed to record them: {err}"
                    );
                    release(store.as_ref(), &lock).await;
                    return Err(err);
                }

                info!(environment = %plan.environment, serial, "Cycle committed");
                Ok(CycleOutcome {
                    environment: plan.environment.clone(),
                    operation,
                    applied: applied.applied,
                    plan,
                    committed_serial: (operation == CycleOperation::Apply).then_some(serial),
                })
            }
            Err(mut partial) => {
                let changed = partial.applied.iter().map(|s| s.module.clone()).collect();
                let cause = partial.cause.to_string();
                record(&mut partial.snapshot, serial, operation, changed, trigger, Some(cause));
                match store.commit_snapshot(&partial.snapshot, &lock).await {
                    Ok(()) => info!(
                        environment = %plan.environment,
                        serial,
                        applied = partial.applied.len(),
                        "Committed partial state"
                    ),
                    Err(err) => {
                        error!(environment = %plan.environment, "Failed to commit partial state: {err}");
                        partial.commit_error = Some(err.to_string());
                    }
                }
                Err(KeelError::from(partial))
            }
        };

        release(store.as_ref(), &lock).await;
        outcome
    }
}

fn record(
    snapshot: &mut StateSnapshot,
    serial: u64,
    operation: CycleOperation,
    changed: Vec<String>,
    trigger: Option<String>,
    failure: Option<String>,
) {
    snapshot.serial = serial;
    snapshot.last_updated = chrono::Utc::now();
    let mut entry = CycleRecord::new(serial, operation, changed).triggered_by(trigger);
    if let Some(failure) = failure {
        entry = entry.failed(failure);
    }
    snapshot.add_history(entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DesiredModule, InputValue};
    use crate::error::{GraphError, ProvisionError, StateError};
    use crate::provision::{
        DestroyRequest, EchoProvisioner, MockProvisioner, ProvisionOutput, ProvisionRequest,
        Provisioner, StepResult,
    };
    use crate::state::MemoryStateStore;

    fn desired(cidr: &str) -> DesiredConfiguration {
        DesiredConfiguration::from_modules(
            "staging",
            vec![
                DesiredModule::new("network", "net")
                    .input("cidr", InputValue::literal(cidr))
                    .output("vpc_id"),
                DesiredModule::new("cluster", "k8s")
                    .input("vpc", InputValue::output("network", "vpc_id"))
                    .output("endpoint"),
            ],
        )
    }

    fn reconciler(store: &MemoryStateStore, registry: ProvisionerRegistry) -> Reconciler {
        Reconciler::new(Arc::new(store.clone()), registry)
    }

    fn echo() -> ProvisionerRegistry {
        ProvisionerRegistry::echo_for(["net", "k8s"])
    }

    #[tokio::test]
    async fn test_cycle_commits_and_releases() {
        let store = MemoryStateStore::new("staging");
        let reconciler = reconciler(&store, echo());

        let cycle = reconciler.prepare(&desired("10.0.0.0/16")).await.expect("prepares");
        assert!(store.is_locked().await.expect("lock state"));

        let outcome = cycle
            .apply(&CancellationToken::new(), Some(String::from("abc123")))
            .await
            .expect("applies");

        assert_eq!(outcome.committed_serial, Some(1));
        assert_eq!(outcome.applied.len(), 2);
        assert!(!store.is_locked().await.expect("lock state"));

        let stored = store.stored_snapshot().await.expect("committed");
        assert_eq!(stored.serial, 1);
        assert_eq!(stored.history.len(), 1);
        assert_eq!(stored.history[0].trigger.as_deref(), Some("abc123"));
        assert!(stored.history[0].success);
    }

    #[tokio::test]
    async fn test_converged_cycle_commits_nothing() {
        let store = MemoryStateStore::new("staging");
        let reconciler = reconciler(&store, echo());
        let cancel = CancellationToken::new();

        let first = reconciler.prepare(&desired("10.0.0.0/16")).await.expect("prepares");
        first.apply(&cancel, None).await.expect("applies");

        let second = reconciler.prepare(&desired("10.0.0.0/16")).await.expect("prepares");
        assert!(!second.plan().has_changes());
        let outcome = second.apply(&cancel, None).await.expect("applies");

        assert!(outcome.committed_serial.is_none());
        assert_eq!(store.commit_count().await, 1);
        assert!(!store.is_locked().await.expect("lock state"));
    }

    #[tokio::test]
    async fn test_cycle_in_graph_fails_before_locking() {
        let store = MemoryStateStore::new("staging");
        let reconciler = reconciler(&store, echo());
        let cyclic = DesiredConfiguration::from_modules(
            "staging",
            vec![
                DesiredModule::new("a", "net").depends_on("b"),
                DesiredModule::new("b", "net").depends_on("a"),
            ],
        );

        let err = reconciler.prepare(&cyclic).await.unwrap_err();
        assert!(matches!(err, KeelError::Graph(GraphError::Cycle { .. })));
        assert!(store.lock_info().await.expect("lock info").is_none());
    }

    #[tokio::test]
    async fn test_held_lock_leaves_state_untouched() {
        let store = MemoryStateStore::new("staging");
        let _held = store.acquire_lock("someone-else").await.expect("acquire");
        let reconciler = reconciler(&store, echo());

        let err = reconciler.prepare(&desired("10.0.0.0/16")).await.unwrap_err();
        assert!(matches!(err, KeelError::State(StateError::LockHeld { .. })));
        assert!(store.stored_snapshot().await.is_none());
    }

    struct FailOn(&'static str);

    #[async_trait]
    impl Provisioner for FailOn {
        async fn apply(&self, request: &ProvisionRequest) -> StepResult<ProvisionOutput> {
            if request.module == self.0 {
                return Err(ProvisionError::failed("quota exceeded"));
            }
            EchoProvisioner::new().apply(request).await
        }

        async fn destroy(&self, _request: &DestroyRequest) -> StepResult<()> {
            Ok(())
        }

        fn driver(&self) -> &'static str {
            "fail-on"
        }
    }

    #[tokio::test]
    async fn test_partial_apply_is_committed() {
        let store = MemoryStateStore::new("staging");
        let failing: Arc<dyn Provisioner> = Arc::new(FailOn("cluster"));
        let registry = ProvisionerRegistry::new()
            .with("net", Arc::clone(&failing))
            .with("k8s", failing);
        let reconciler = reconciler(&store, registry);

        let cycle = reconciler.prepare(&desired("10.0.0.0/16")).await.expect("prepares");
        let err = cycle.apply(&CancellationToken::new(), None).await.unwrap_err();

        let partial = err.partial_apply().expect("partial apply");
        assert_eq!(partial.failed_module(), Some("cluster"));
        assert!(partial.commit_error.is_none());

        let stored = store.stored_snapshot().await.expect("partial committed");
        assert!(stored.module("network").is_some());
        assert!(stored.module("cluster").is_none());
        assert!(!stored.history[0].success);
        assert!(!store.is_locked().await.expect("lock state"));
    }

    /// Breaks the environment lock while "provisioning".
    struct LockThief(MemoryStateStore);

    #[async_trait]
    impl Provisioner for LockThief {
        async fn apply(&self, request: &ProvisionRequest) -> StepResult<ProvisionOutput> {
            self.0
                .break_lock(true)
                .await
                .map_err(|e| ProvisionError::failed(e.to_string()))?;
            EchoProvisioner::new().apply(request).await
        }

        async fn destroy(&self, _request: &DestroyRequest) -> StepResult<()> {
            Ok(())
        }

        fn driver(&self) -> &'static str {
            "thief"
        }
    }

    #[tokio::test]
    async fn test_lost_lock_halts_and_reports_commit_failure() {
        let store = MemoryStateStore::new("staging");
        let thief: Arc<dyn Provisioner> = Arc::new(LockThief(store.clone()));
        let registry = ProvisionerRegistry::new()
            .with("net", Arc::clone(&thief))
            .with("k8s", thief);
        let reconciler = reconciler(&store, registry);

        let cycle = reconciler.prepare(&desired("10.0.0.0/16")).await.expect("prepares");
        let err = cycle.apply(&CancellationToken::new(), None).await.unwrap_err();

        let partial = err.partial_apply().expect("partial apply");
        assert_eq!(partial.applied.len(), 1);
        assert!(partial.commit_error.is_some());
        assert!(store.stored_snapshot().await.is_none());
    }

    fn short_lived() -> MemoryStateStore {
        MemoryStateStore::new("staging").with_lock_ttl(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_lock_outlives_a_wait_longer_than_its_ttl() {
        let store = short_lived();
        let reconciler = reconciler(&store, echo());

        let cycle = reconciler.prepare(&desired("10.0.0.0/16")).await.expect("prepares");
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(store.is_locked().await.expect("lock state"));

        let outcome = cycle.apply(&CancellationToken::new(), None).await.expect("applies");
        assert_eq!(outcome.committed_serial, Some(1));
        let stored = store.stored_snapshot().await.expect("committed");
        assert_eq!(stored.module_names(), vec!["cluster", "network"]);
        assert!(!store.is_locked().await.expect("lock state"));
    }

    /// Takes longer than a short-lived lock to provision.
    struct Slow(Duration);

    #[async_trait]
    impl Provisioner for Slow {
        async fn apply(&self, request: &ProvisionRequest) -> StepResult<ProvisionOutput> {
            tokio::time::sleep(self.0).await;
            EchoProvisioner::new().apply(request).await
        }

        async fn destroy(&self, _request: &DestroyRequest) -> StepResult<()> {
            Ok(())
        }

        fn driver(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_lock_outlives_a_step_longer_than_its_ttl() {
        let store = short_lived();
        let registry = ProvisionerRegistry::new()
            .with("net", Arc::new(Slow(Duration::from_millis(2100))))
            .with("k8s", Arc::new(EchoProvisioner::new()));
        let reconciler = reconciler(&store, registry);

        let cycle = reconciler.prepare(&desired("10.0.0.0/16")).await.expect("prepares");
        let outcome = cycle.apply(&CancellationToken::new(), None).await.expect("applies");

        assert_eq!(outcome.applied.len(), 2);
        let stored = store.stored_snapshot().await.expect("committed");
        assert!(stored.module("network").is_some());
        assert!(stored.module("cluster").is_some());
    }

    #[tokio::test]
    async fn test_lock_lost_before_apply_runs_nothing() {
        let store = MemoryStateStore::new("staging");
        let mut mock = MockProvisioner::new();
        mock.expect_driver().return_const("mock");
        mock.expect_apply().never();
        let mock: Arc<dyn Provisioner> = Arc::new(mock);
        let registry = ProvisionerRegistry::new()
            .with("net", Arc::clone(&mock))
            .with("k8s", mock);
        let reconciler = reconciler(&store, registry);

        let cycle = reconciler.prepare(&desired("10.0.0.0/16")).await.expect("prepares");
        store.break_lock(true).await.expect("force unlock");
        let other = store.acquire_lock("operator").await.expect("reacquire");

        let err = cycle.apply(&CancellationToken::new(), None).await.unwrap_err();
        assert!(matches!(err, KeelError::State(StateError::LockExpired { .. })));
        assert!(store.stored_snapshot().await.is_none());
        assert_eq!(store.lock_info().await.expect("lock info"), Some(other));
    }

    #[test]
    fn test_renewal_interval_is_a_third_of_the_ttl() {
        assert_eq!(renewal_interval(300), Duration::from_secs(100));
        assert_eq!(renewal_interval(1), Duration::from_millis(333));
        assert_eq!(renewal_interval(0), MIN_RENEWAL_INTERVAL);
    }

    #[tokio::test]
    async fn test_teardown_removes_state() {
        let store = MemoryStateStore::new("staging");
        let reconciler = reconciler(&store, echo());
        let cancel = CancellationToken::new();

        reconciler
            .prepare(&desired("10.0.0.0/16"))
            .await
            .expect("prepares")
            .apply(&cancel, None)
            .await
            .expect("applies");

        let teardown = reconciler.prepare_teardown().await.expect("prepares teardown");
        let modules: Vec<_> = teardown.plan().steps().map(|a| a.module.clone()).collect();
        assert_eq!(modules, vec!["cluster", "network"]);

        teardown.apply(&cancel, None).await.expect("tears down");
        assert!(store.stored_snapshot().await.is_none());
        assert!(!store.is_locked().await.expect("lock state"));
    }
}
