//! Reconciliation orchestrator
//!
//! Every instance of a desired set walks its own state machine:
//!
//! ```text
//! Idle -> Locking -> Validating -> Planning -> (Applying) -> Persisting -> Idle
//! ```
//!
//! with `Failed` reachable from any state. Instances run concurrently, bounded
//! by the configured pool size; an instance starts only after every instance
//! it depends on has finished successfully. Locks are never nested and are
//! released on every exit path once taken.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use iam_core::{
    Attributes, EngineConfig, EngineEvent, Error, EventSink, LockToken, Phase, ResourceInstance,
    ResourceType, ResourceTypeId, Result, StateRecord, TracingSink,
};
use iam_jsonrpc::ProviderClient;
use iam_state_store::{SchemaRegistry, StateStore, StateStoreError};
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::change::{ChangeAction, ChangePlan, PlannedChange};
use crate::diff::DiffEngine;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Whether a run stops after planning or goes on to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    PlanOnly,
    Apply,
}

/// How a single instance ended up
#[derive(Debug)]
pub enum InstanceStatus {
    /// Planned as no-op, nothing applied or persisted
    Unchanged,
    /// Plan-only run
    Planned,
    /// Applied and persisted; `None` after a delete
    Applied { version: Option<u64> },
    Failed { phase: Phase, error: Error },
    /// Not started because a dependency did not succeed
    DependencyFailed { dependency: String },
    /// Not started because the batch was halted by an integrity error
    Skipped,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Unchanged | InstanceStatus::Planned | InstanceStatus::Applied { .. }
        )
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            InstanceStatus::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Result for one instance; before/after are kept for inspection on failure
#[derive(Debug)]
pub struct InstanceOutcome {
    pub key: String,
    pub type_id: ResourceTypeId,
    pub action: ChangeAction,
    pub before: Option<Attributes>,
    pub after: Option<Attributes>,
    pub status: InstanceStatus,
}

impl InstanceOutcome {
    fn new(change: PlannedChange, status: InstanceStatus) -> Self {
        Self {
            key: change.instance_key,
            type_id: change.type_id,
            action: change.action,
            before: change.before,
            after: change.after,
            status,
        }
    }
}

/// Per-instance outcomes of one run, in execution order
#[derive(Debug)]
pub struct ReconcileReport {
    pub mode: Mode,
    /// Hash of the schedule computed before any lock was taken
    pub plan_hash: String,
    pub outcomes: Vec<InstanceOutcome>,
    /// Set when an integrity error stopped new instances from starting
    pub halted: bool,
}

impl ReconcileReport {
    pub fn get(&self, key: &str) -> Option<&InstanceOutcome> {
        self.outcomes.iter().find(|o| o.key == key)
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.is_success())
    }

    pub fn failures(&self) -> Vec<&InstanceOutcome> {
        self.outcomes
            .iter()
            .filter(|o| !o.status.is_success())
            .collect()
    }
}

/// Handle that cancels in-flight and future work of a reconciler
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Builder for [`Reconciler`]
pub struct ReconcilerBuilder {
    registry: SchemaRegistry,
    providers: HashMap<ResourceTypeId, ProviderClient>,
    store: Option<Arc<StateStore>>,
    sink: Option<Arc<dyn EventSink>>,
    config: EngineConfig,
    holder: Option<String>,
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconcilerBuilder {
    pub fn new() -> Self {
        Self {
            registry: SchemaRegistry::new(),
            providers: HashMap::new(),
            store: None,
            sink: None,
            config: EngineConfig::default(),
            holder: None,
        }
    }

    /// Pool size, lease, lock wait and call timeout. The call timeout is
    /// applied to every registered provider client.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Lock holder name; a random suffix is added per run
    pub fn holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = Some(holder.into());
        self
    }

    /// Register a provider together with the resource types it serves
    pub fn provider(
        mut self,
        client: ProviderClient,
        types: impl IntoIterator<Item = ResourceType>,
    ) -> Result<Self> {
        for resource_type in types {
            let id = resource_type.id.clone();
            self.registry.register(resource_type)?;
            debug!("Routing {} to provider {}", id, client.name());
            self.providers.insert(id, client.clone());
        }
        Ok(self)
    }

    pub fn build(self) -> Result<Reconciler> {
        let store = self
            .store
            .ok_or_else(|| Error::config("reconciler requires a state store"))?;
        let registry = self.registry.freeze();
        let call_timeout = self.config.call_timeout;
        let providers = self
            .providers
            .into_iter()
            .map(|(id, client)| (id, client.with_timeout(call_timeout)))
            .collect();
        let (cancel, _) = watch::channel(false);

        Ok(Reconciler {
            inner: Arc::new(Inner {
                diff: DiffEngine::new(Arc::clone(&registry)),
                registry,
                store,
                providers,
                sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
                holder: self.holder.unwrap_or_else(|| "iamctl".to_string()),
                config: self.config,
                cancel: Arc::new(cancel),
            }),
        })
    }
}

/// Drives desired configuration into providers and the state store
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<SchemaRegistry>,
    diff: DiffEngine,
    store: Arc<StateStore>,
    providers: HashMap<ResourceTypeId, ProviderClient>,
    sink: Arc<dyn EventSink>,
    config: EngineConfig,
    holder: String,
    cancel: Arc<watch::Sender<bool>>,
}

/// Work item for one instance of a run
struct Task {
    change: PlannedChange,
    desired: Option<ResourceInstance>,
    holder: String,
    mode: Mode,
    depends_on: Vec<(String, watch::Receiver<Option<bool>>)>,
    done: watch::Sender<Option<bool>>,
    permits: Arc<Semaphore>,
    halted: Arc<AtomicBool>,
}

impl Reconciler {
    pub fn builder() -> ReconcilerBuilder {
        ReconcilerBuilder::new()
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.inner.store
    }

    pub fn diff_engine(&self) -> &DiffEngine {
        &self.inner.diff
    }

    /// Cancelling is permanent for this reconciler and its clones
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.inner.cancel),
        }
    }

    /// Compute the change plan for `desired` against every stored record,
    /// without taking locks
    pub async fn plan(&self, desired: &[ResourceInstance]) -> Result<ChangePlan> {
        let prior = self.inner.store.list().await?;
        let plan = self.inner.diff.plan_all(desired, &prior)?;
        let summary = plan.summary();
        self.inner.sink.emit(&EngineEvent::BatchPlanned {
            instances: plan.len(),
            changes: summary.changes(),
            plan_hash: plan.hash.clone(),
        });
        info!("Plan: {}", summary);
        Ok(plan)
    }

    /// Reconcile the desired set against stored state.
    ///
    /// Fails as a whole only if the set cannot be scheduled (a reference
    /// cycle) or the stored records cannot be listed; every other problem is
    /// reported per instance.
    pub async fn reconcile(&self, desired: Vec<ResourceInstance>, mode: Mode) -> Result<ReconcileReport> {
        let inner = &self.inner;
        let prior = inner.store.list().await?;
        let schedule = inner.diff.schedule(&desired, &prior)?;
        inner.sink.emit(&EngineEvent::BatchPlanned {
            instances: schedule.len(),
            changes: schedule.summary().changes(),
            plan_hash: schedule.hash.clone(),
        });
        info!(
            instances = schedule.len(),
            mode = ?mode,
            "Starting reconciliation: {}",
            schedule.summary()
        );

        let holder = format!("{}/{}", inner.holder, Uuid::new_v4());
        let permits = Arc::new(Semaphore::new(inner.config.pool_size.max(1)));
        let halted = Arc::new(AtomicBool::new(false));
        let mut desired_by_key: HashMap<String, ResourceInstance> =
            desired.into_iter().map(|i| (i.key.clone(), i)).collect();

        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for change in &schedule.changes {
            let (tx, rx) = watch::channel(None);
            senders.insert(change.instance_key.clone(), tx);
            receivers.insert(change.instance_key.clone(), rx);
        }

        let mut handles = Vec::with_capacity(schedule.len());
        for change in &schedule.changes {
            let key = change.instance_key.clone();
            let Some(done) = senders.remove(&key) else {
                continue;
            };
            let depends_on = change
                .depends_on
                .iter()
                .filter_map(|dep| receivers.get(dep).map(|rx| (dep.clone(), rx.clone())))
                .collect();
            let task = Task {
                change: change.clone(),
                desired: desired_by_key.remove(&key),
                holder: holder.clone(),
                mode,
                depends_on,
                done,
                permits: Arc::clone(&permits),
                halted: Arc::clone(&halted),
            };
            let inner = Arc::clone(&self.inner);
            handles.push((change.clone(), tokio::spawn(async move { inner.run_task(task).await })));
        }

        let (changes, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let results = join_all(handles).await;
        let outcomes = changes
            .into_iter()
            .zip(results)
            .map(|(change, result)| match result {
                Ok(outcome) => outcome,
                Err(e) => InstanceOutcome::new(
                    change,
                    InstanceStatus::Failed {
                        phase: Phase::Idle,
                        error: Error::internal(format!("worker task failed: {e}")),
                    },
                ),
            })
            .collect::<Vec<_>>();

        let report = ReconcileReport {
            mode,
            plan_hash: schedule.hash,
            outcomes,
            halted: halted.load(Ordering::SeqCst),
        };
        info!(
            failed = report.failures().len(),
            total = report.outcomes.len(),
            halted = report.halted,
            "Reconciliation finished"
        );
        Ok(report)
    }

    /// Adopt an existing external resource as `key`.
    ///
    /// The imported state is persisted as version 1; fails if a record for
    /// `key` already exists.
    pub async fn import(
        &self,
        type_id: &ResourceTypeId,
        key: &str,
        external_id: &str,
    ) -> Result<StateRecord> {
        let inner = &self.inner;
        inner.registry.lookup(type_id)?;
        let client = inner.provider_for(type_id)?;
        let holder = format!("{}/{}", inner.holder, Uuid::new_v4());

        let token = inner.lock(key, &holder).await?;
        inner.sink.emit(&EngineEvent::LockAcquired {
            key: key.to_string(),
            holder: holder.clone(),
            token,
        });

        let result = inner.import_locked(client, type_id, key, external_id, &token).await;
        inner.release(key, &token).await;
        result
    }
}

impl Inner {
    fn provider_for(&self, type_id: &ResourceTypeId) -> Result<&ProviderClient> {
        self.providers
            .get(type_id)
            .ok_or_else(|| Error::UnknownType(type_id.to_string()))
    }

    async fn run_task(&self, task: Task) -> InstanceOutcome {
        let Task {
            change,
            desired,
            holder,
            mode,
            depends_on,
            done,
            permits,
            halted,
        } = task;

        let outcome = self
            .start(change, desired, &holder, mode, depends_on, permits, &halted)
            .await;
        done.send_replace(Some(outcome.status.is_success()));
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn start(
        &self,
        change: PlannedChange,
        desired: Option<ResourceInstance>,
        holder: &str,
        mode: Mode,
        depends_on: Vec<(String, watch::Receiver<Option<bool>>)>,
        permits: Arc<Semaphore>,
        halted: &AtomicBool,
    ) -> InstanceOutcome {
        for (dependency, mut rx) in depends_on {
            let succeeded = match rx.wait_for(Option::is_some).await {
                Ok(done) => *done == Some(true),
                Err(_) => false,
            };
            if !succeeded {
                debug!(key = %change.instance_key, %dependency, "Dependency did not succeed");
                return InstanceOutcome::new(change, InstanceStatus::DependencyFailed { dependency });
            }
        }

        let mut cancel = self.cancel.subscribe();
        let _permit = tokio::select! {
            permit = permits.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return InstanceOutcome::new(change, InstanceStatus::Cancelled),
            },
            _ = cancelled(&mut cancel) => return InstanceOutcome::new(change, InstanceStatus::Cancelled),
        };

        if *cancel.borrow() {
            return InstanceOutcome::new(change, InstanceStatus::Cancelled);
        }
        if halted.load(Ordering::SeqCst) {
            return InstanceOutcome::new(change, InstanceStatus::Skipped);
        }

        self.process(change, desired, holder, mode, halted).await
    }

    #[instrument(skip_all, fields(key = %change.instance_key))]
    async fn process(
        &self,
        change: PlannedChange,
        desired: Option<ResourceInstance>,
        holder: &str,
        mode: Mode,
        halted: &AtomicBool,
    ) -> InstanceOutcome {
        let key = change.instance_key.clone();
        let mut tracker = PhaseTracker::new(&key, self.sink.as_ref());

        tracker.enter(Phase::Locking);
        let token = match self.lock(&key, holder).await {
            Ok(token) => token,
            Err(e) => return self.fail(&mut tracker, change, e),
        };
        self.sink.emit(&EngineEvent::LockAcquired {
            key: key.clone(),
            holder: holder.to_string(),
            token,
        });

        let outcome = self
            .locked(&mut tracker, &token, change, desired.as_ref(), mode, halted)
            .await;

        self.release(&key, &token).await;
        if outcome.status.is_success() {
            tracker.enter(Phase::Idle);
        }
        outcome
    }

    async fn locked(
        &self,
        tracker: &mut PhaseTracker<'_>,
        token: &LockToken,
        mut change: PlannedChange,
        desired: Option<&ResourceInstance>,
        mode: Mode,
        halted: &AtomicBool,
    ) -> InstanceOutcome {
        let key = change.instance_key.clone();
        let record = match self.store.read(&key).await {
            Ok(record) => record,
            Err(e) => return self.fail(tracker, change, e.into()),
        };
        change.before = record.as_ref().map(|r| r.attributes.clone());

        if let Some(desired) = desired {
            tracker.enter(Phase::Validating);
            if let Err(e) = self.validate(desired).await {
                return self.fail(tracker, change, e);
            }
        }

        tracker.enter(Phase::Planning);
        let action = match self.plan_locked(&key, desired, record.as_ref()).await {
            Ok(action) => action,
            Err(e) => return self.fail(tracker, change, e),
        };
        change.after = match action {
            ChangeAction::Delete => None,
            _ => desired.map(|d| d.attributes.clone()),
        };
        change.action = action;
        self.sink.emit(&EngineEvent::PlanComputed {
            key: key.clone(),
            action: change.action.to_string(),
        });

        if change.action.is_noop() {
            return InstanceOutcome::new(change, InstanceStatus::Unchanged);
        }
        if mode == Mode::PlanOnly {
            return InstanceOutcome::new(change, InstanceStatus::Planned);
        }

        tracker.enter(Phase::Applying);
        self.sink.emit(&EngineEvent::ApplyStarted {
            key: key.clone(),
            action: change.action.name().to_string(),
        });

        let mut deleted = false;
        let mut cancel = self.cancel.subscribe();
        let applied = tokio::select! {
            result = self.apply(&change, record.as_ref(), &mut deleted) => result,
            _ = cancelled(&mut cancel) => Err(Error::Cancelled),
        };

        let expected = record.as_ref().map(|r| r.version).unwrap_or(0);
        let state = match applied {
            Ok(state) => state,
            Err(e) => {
                if deleted {
                    // the old resource is gone, so its record must go too
                    tracker.enter(Phase::Persisting);
                    if let Err(persist) = self.store.delete(&key, expected, token).await {
                        let persist: Error = persist.into();
                        if persist.is_fatal() {
                            halted.store(true, Ordering::SeqCst);
                        }
                        warn!(key = %key, error = %persist, "Failed to record partial delete");
                    }
                }
                return self.fail(tracker, change, e);
            }
        };

        tracker.enter(Phase::Persisting);
        let persisted = match state {
            Some(attributes) => {
                let record = StateRecord::new(key.clone(), change.type_id.clone(), attributes);
                self.store
                    .write(&key, record, expected, token)
                    .await
                    .map(|r| Some(r.version))
            }
            None => self.store.delete(&key, expected, token).await.map(|_| None),
        };

        match persisted {
            Ok(version) => {
                self.sink.emit(&EngineEvent::ApplyFinished {
                    key: key.clone(),
                    action: change.action.name().to_string(),
                    version: version.unwrap_or(0),
                });
                InstanceOutcome::new(change, InstanceStatus::Applied { version })
            }
            Err(e) => {
                let error: Error = e.into();
                if error.is_fatal() {
                    warn!(key = %key, "Integrity error, no further instances will start");
                    halted.store(true, Ordering::SeqCst);
                }
                self.fail(tracker, change, error)
            }
        }
    }

    /// Local schema validation, then provider validation
    async fn validate(&self, desired: &ResourceInstance) -> Result<()> {
        let errors = self.registry.validate(desired)?;
        if !errors.is_empty() {
            return Err(Error::Validation(errors));
        }

        let client = self.provider_for(&desired.type_id)?;
        let errors = client.validate(&desired.type_id, &desired.attributes).await?;
        if !errors.is_empty() {
            return Err(Error::Validation(errors));
        }
        Ok(())
    }

    async fn plan_locked(
        &self,
        key: &str,
        desired: Option<&ResourceInstance>,
        record: Option<&StateRecord>,
    ) -> Result<ChangeAction> {
        let action = self.diff.plan(desired, record)?;
        if !self.config.provider_plans || action.is_noop() {
            return Ok(action);
        }

        let type_id = match (desired, record) {
            (Some(d), _) => &d.type_id,
            (None, Some(r)) => &r.type_id,
            (None, None) => return Ok(action),
        };
        let client = self.provider_for(type_id)?;
        let advisory = client
            .plan(
                type_id,
                key,
                record.map(|r| &r.attributes),
                desired.map(|d| &d.attributes),
            )
            .await;
        match advisory {
            Ok(provider) => Ok(self.diff.reconcile_advisory(key, &action, &provider)),
            Err(Error::Provider { code, message }) => {
                debug!(key, code, %message, "Provider declined to plan");
                Ok(action)
            }
            Err(e) => Err(e),
        }
    }

    /// Returns the new attributes, or `None` once deleted
    async fn apply(
        &self,
        change: &PlannedChange,
        record: Option<&StateRecord>,
        deleted: &mut bool,
    ) -> Result<Option<Attributes>> {
        let key = change.instance_key.as_str();
        match &change.action {
            ChangeAction::NoOp => Ok(record.map(|r| r.attributes.clone())),
            ChangeAction::Delete => {
                if let Some(record) = record {
                    self.apply_delete(key, record).await?;
                }
                *deleted = true;
                Ok(None)
            }
            ChangeAction::Create | ChangeAction::Update { .. } => {
                self.apply_upsert(change, &change.action, change.before.as_ref())
                    .await
                    .map(Some)
            }
            ChangeAction::Replace { .. } => {
                if let Some(record) = record {
                    self.apply_delete(key, record).await?;
                    *deleted = true;
                }
                self.apply_upsert(change, &ChangeAction::Create, None)
                    .await
                    .map(Some)
            }
        }
    }

    async fn apply_delete(&self, key: &str, record: &StateRecord) -> Result<()> {
        let client = self.provider_for(&record.type_id)?;
        let state = client
            .apply(
                &record.type_id,
                key,
                &ChangeAction::Delete,
                Some(&record.attributes),
                None,
            )
            .await?;
        if !state.is_null() {
            debug!(key, "Ignoring state returned for a delete");
        }
        Ok(())
    }

    async fn apply_upsert(
        &self,
        change: &PlannedChange,
        action: &ChangeAction,
        before: Option<&Attributes>,
    ) -> Result<Attributes> {
        let key = change.instance_key.as_str();
        let client = self.provider_for(&change.type_id)?;
        let state = client
            .apply(&change.type_id, key, action, before, change.after.as_ref())
            .await?;
        if state.is_null() {
            return Err(Error::protocol(
                "result.state",
                format!("provider returned no state for {}", action.name()),
            ));
        }
        self.registry.decode_state(&change.type_id, &state)
    }

    async fn import_locked(
        &self,
        client: &ProviderClient,
        type_id: &ResourceTypeId,
        key: &str,
        external_id: &str,
        token: &LockToken,
    ) -> Result<StateRecord> {
        if let Some(existing) = self.store.read(key).await? {
            return Err(Error::VersionConflict {
                key: key.to_string(),
                expected: 0,
                actual: existing.version,
            });
        }

        let state = client.import(type_id, key, external_id).await?;
        let attributes = self.registry.decode_state(type_id, &state)?;
        let record = StateRecord::new(key, type_id.clone(), attributes);
        let record = self.store.write(key, record, 0, token).await?;
        info!(key, version = record.version, "Imported {} as {}", external_id, type_id);
        Ok(record)
    }

    /// Acquire the lock on `key`, polling until the configured wait runs out
    async fn lock(&self, key: &str, holder: &str) -> Result<LockToken> {
        let deadline = Instant::now() + self.config.lock_wait;
        let mut cancel = self.cancel.subscribe();
        let mut contended = false;

        loop {
            if *cancel.borrow() {
                return Err(Error::Cancelled);
            }
            match self
                .store
                .acquire_lock(key, holder, self.config.lease_duration)
                .await
            {
                Ok(token) => return Ok(token),
                Err(StateStoreError::Locked { holder: current, .. }) => {
                    if !contended {
                        self.sink.emit(&EngineEvent::LockContended {
                            key: key.to_string(),
                            holder: current.clone(),
                        });
                        contended = true;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Locked {
                            key: key.to_string(),
                            holder: current,
                        });
                    }
                    let pause = LOCK_POLL_INTERVAL.min(deadline - now);
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = cancelled(&mut cancel) => return Err(Error::Cancelled),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn release(&self, key: &str, token: &LockToken) {
        if let Err(e) = self.store.release_lock(key, token).await {
            warn!(key, error = %e, "Failed to release lock");
            return;
        }
        self.sink.emit(&EngineEvent::LockReleased {
            key: key.to_string(),
            token: *token,
        });
    }

    fn fail(&self, tracker: &mut PhaseTracker<'_>, change: PlannedChange, error: Error) -> InstanceOutcome {
        let phase = tracker.phase();
        if matches!(error, Error::Cancelled) {
            info!(key = %change.instance_key, %phase, "Instance cancelled");
            tracker.enter(Phase::Failed);
            return InstanceOutcome::new(change, InstanceStatus::Cancelled);
        }

        warn!(key = %change.instance_key, %phase, error = %error, "Instance failed");
        if let Some(after) = &change.after {
            debug!(
                key = %change.instance_key,
                attributes = ?self.registry.redact(&change.type_id, after),
                "Desired attributes of failed instance"
            );
        }
        self.sink.emit(&EngineEvent::Error {
            key: Some(change.instance_key.clone()),
            phase: Some(phase),
            message: error.to_string(),
        });
        tracker.enter(Phase::Failed);
        InstanceOutcome::new(change, InstanceStatus::Failed { phase, error })
    }
}

/// Emits a phase-changed event on every transition of one instance
struct PhaseTracker<'a> {
    key: &'a str,
    phase: Phase,
    sink: &'a dyn EventSink,
}

impl<'a> PhaseTracker<'a> {
    fn new(key: &'a str, sink: &'a dyn EventSink) -> Self {
        Self {
            key,
            phase: Phase::Idle,
            sink,
        }
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, to: Phase) {
        if self.phase == to {
            return;
        }
        self.sink.emit(&EngineEvent::PhaseChanged {
            key: self.key.to_string(),
            from: self.phase,
            to,
        });
        self.phase = to;
    }
}

/// Resolves once cancellation is signalled; never if the sender is gone
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}
