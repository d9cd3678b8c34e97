//! Reconciliation against a real provider server over an in-process channel

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use iam_core::{
    AttributeDescriptor, AttributeValue, Attributes, EngineConfig, EngineEvent, Error, FieldError,
    MemorySink, Phase, ResourceInstance, ResourceType, ResourceTypeId, StateRecord,
};
use iam_jsonrpc::prelude::*;
use iam_jsonrpc::{ChannelPool, Dispatcher, DEFAULT_MAX_FRAME_BYTES};
use iam_state::{ChangeAction, InstanceStatus, Mode, Reconciler};
use iam_state_store::{MemoryBackend, StateBackend, StateStore, StateStoreError};

/// In-memory directory with roles and role bindings
#[derive(Default)]
struct DirectoryProvider {
    resources: Mutex<BTreeMap<String, Attributes>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl DirectoryProvider {
    fn actions_for(&self, key: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, action)| action.clone())
            .collect()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for DirectoryProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            name: "directory".to_string(),
            version: "0.1.0".to_string(),
            author: None,
            repository: None,
            description: None,
        }
    }

    fn resource_types(&self) -> Vec<ResourceType> {
        vec![
            ResourceType::builder("iam", "role")
                .attribute(AttributeDescriptor::string("name").required().forces_replacement())
                .attribute(AttributeDescriptor::string("policy"))
                .attribute(AttributeDescriptor::string("arn").computed())
                .build(),
            ResourceType::builder("iam", "binding")
                .attribute(AttributeDescriptor::reference("role").required())
                .attribute(AttributeDescriptor::string("member"))
                .build(),
        ]
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supported_resources: self.resource_types().into_iter().map(|t| t.id).collect(),
            can_import: true,
            can_validate: true,
            can_plan: true,
        }
    }

    async fn validate(
        &self,
        _resource_type: &ResourceTypeId,
        config: &Attributes,
    ) -> anyhow::Result<Vec<FieldError>> {
        match config.get("policy") {
            Some(AttributeValue::String(policy)) if policy == "forbidden" => {
                Ok(vec![FieldError::new("policy", "policy is not allowed")])
            }
            _ => Ok(vec![]),
        }
    }

    async fn plan(
        &self,
        _resource_type: &ResourceTypeId,
        request: &PlanParams,
    ) -> anyhow::Result<ChangeAction> {
        Ok(match (&request.prior, &request.desired) {
            (Some(prior), Some(desired)) if prior.get("policy") != desired.get("policy") => {
                ChangeAction::Replace {
                    forced_by: vec!["policy".to_string()],
                }
            }
            (Some(_), Some(_)) => ChangeAction::NoOp,
            (None, Some(_)) => ChangeAction::Create,
            (Some(_), None) => ChangeAction::Delete,
            (None, None) => ChangeAction::NoOp,
        })
    }

    async fn apply(
        &self,
        resource_type: &ResourceTypeId,
        request: &ApplyParams,
    ) -> anyhow::Result<Option<Attributes>> {
        self.calls
            .lock()
            .unwrap()
            .push((request.key.clone(), request.action.name().to_string()));

        match request.key.as_str() {
            "doomed" => anyhow::bail!("quota exceeded"),
            "slow" => tokio::time::sleep(Duration::from_secs(60)).await,
            _ => {}
        }
        let stalled = request.after.as_ref().and_then(|a| a.get("policy"))
            == Some(&AttributeValue::string("stall"));
        if stalled && matches!(request.action, ChangeAction::Create) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }

        if matches!(request.action, ChangeAction::Delete) {
            self.resources.lock().unwrap().remove(&request.key);
            return Ok(None);
        }

        let mut state = request.after.clone().unwrap_or_default();
        if resource_type.kind == "role" {
            let name = match state.get("name") {
                Some(AttributeValue::String(name)) => name.clone(),
                _ => request.key.clone(),
            };
            state.insert(
                "arn".to_string(),
                AttributeValue::string(format!("arn:iam::role/{name}")),
            );
        }
        self.resources
            .lock()
            .unwrap()
            .insert(request.key.clone(), state.clone());
        Ok(Some(state))
    }

    async fn import(
        &self,
        _resource_type: &ResourceTypeId,
        request: &ImportParams,
    ) -> anyhow::Result<Attributes> {
        let name = request
            .external_id
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let mut state = Attributes::new();
        state.insert("name".to_string(), AttributeValue::string(name));
        state.insert("policy".to_string(), AttributeValue::string("ro"));
        state.insert(
            "arn".to_string(),
            AttributeValue::string(request.external_id.clone()),
        );
        Ok(state)
    }
}

/// Backend that reports a concurrent writer for one key
struct ConflictingBackend {
    inner: MemoryBackend,
    key: &'static str,
}

#[async_trait]
impl StateBackend for ConflictingBackend {
    fn kind(&self) -> &'static str {
        "conflicting"
    }

    async fn get(&self, key: &str) -> iam_state_store::error::Result<Option<StateRecord>> {
        self.inner.get(key).await
    }

    async fn list(&self) -> iam_state_store::error::Result<Vec<StateRecord>> {
        self.inner.list().await
    }

    async fn compare_and_put(
        &self,
        record: &StateRecord,
        expected: u64,
    ) -> iam_state_store::error::Result<()> {
        if record.instance_key == self.key {
            return Err(StateStoreError::VersionConflict {
                key: record.instance_key.clone(),
                expected,
                actual: expected + 1,
            });
        }
        self.inner.compare_and_put(record, expected).await
    }

    async fn compare_and_delete(&self, key: &str, expected: u64) -> iam_state_store::error::Result<()> {
        self.inner.compare_and_delete(key, expected).await
    }
}

struct Harness {
    reconciler: Reconciler,
    store: Arc<StateStore>,
    sink: Arc<MemorySink>,
    provider: Arc<DirectoryProvider>,
}

fn config() -> EngineConfig {
    EngineConfig {
        pool_size: 4,
        call_timeout: Duration::from_secs(5),
        lease_duration: Duration::from_secs(30),
        lock_wait: Duration::from_millis(200),
        ..EngineConfig::default()
    }
}

fn harness_with(config: EngineConfig, backend: Arc<dyn StateBackend>) -> Harness {
    let provider = Arc::new(DirectoryProvider::default());
    let (engine, provider_end) = FramedChannel::duplex(DEFAULT_MAX_FRAME_BYTES);
    let server = ProviderServer::from_arc(Arc::clone(&provider));
    tokio::spawn(async move { server.serve(provider_end).await });

    let sink = Arc::new(MemorySink::new());
    let dispatcher = Dispatcher::with_sink("directory", engine, sink.clone());
    let client = ProviderClient::new(
        Arc::new(ChannelPool::single(dispatcher)),
        Duration::from_secs(5),
    );

    let store = Arc::new(StateStore::new(backend));
    let reconciler = Reconciler::builder()
        .config(config)
        .store(Arc::clone(&store))
        .sink(sink.clone())
        .holder("test-engine")
        .provider(client, provider.resource_types())
        .unwrap()
        .build()
        .unwrap();

    Harness {
        reconciler,
        store,
        sink,
        provider,
    }
}

fn harness() -> Harness {
    harness_with(config(), Arc::new(MemoryBackend::new()))
}

fn role(key: &str, name: &str, policy: &str) -> ResourceInstance {
    ResourceInstance::new(ResourceTypeId::new("iam", "role"), key)
        .with_attribute("name", AttributeValue::string(name))
        .with_attribute("policy", AttributeValue::string(policy))
}

fn binding(key: &str, role: &str) -> ResourceInstance {
    ResourceInstance::new(ResourceTypeId::new("iam", "binding"), key)
        .with_attribute("role", AttributeValue::reference(role))
        .with_attribute("member", AttributeValue::string("alice"))
}

#[tokio::test]
async fn test_create_then_replan_is_noop() {
    let h = harness();
    let desired = vec![role("admin", "admin", "p0")];

    let report = h
        .reconciler
        .reconcile(desired.clone(), Mode::Apply)
        .await
        .unwrap();
    assert!(report.is_success());
    let outcome = report.get("admin").unwrap();
    assert_eq!(outcome.action, ChangeAction::Create);
    assert!(matches!(outcome.status, InstanceStatus::Applied { version: Some(1) }));

    let record = h.store.read("admin").await.unwrap().unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(
        record.attributes["arn"],
        AttributeValue::string("arn:iam::role/admin")
    );
    assert!(record.lock_token.is_none());

    let plan = h.reconciler.plan(&desired).await.unwrap();
    assert!(!plan.has_changes());

    let again = h.reconciler.reconcile(desired, Mode::Apply).await.unwrap();
    assert!(matches!(
        again.get("admin").unwrap().status,
        InstanceStatus::Unchanged
    ));
    assert_eq!(h.provider.actions_for("admin"), vec!["create"]);
    assert_eq!(h.store.read("admin").await.unwrap().unwrap().version, 1);
}

#[tokio::test]
async fn test_update_and_replace() {
    let h = harness();
    h.reconciler
        .reconcile(vec![role("admin", "admin", "p0")], Mode::Apply)
        .await
        .unwrap();

    let report = h
        .reconciler
        .reconcile(vec![role("admin", "admin", "p1")], Mode::Apply)
        .await
        .unwrap();
    assert_eq!(
        report.get("admin").unwrap().action,
        ChangeAction::Update {
            changed: vec!["policy".to_string()]
        }
    );
    assert_eq!(h.store.read("admin").await.unwrap().unwrap().version, 2);

    let report = h
        .reconciler
        .reconcile(vec![role("admin", "admin2", "p1")], Mode::Apply)
        .await
        .unwrap();
    let outcome = report.get("admin").unwrap();
    assert_eq!(
        outcome.action,
        ChangeAction::Replace {
            forced_by: vec!["name".to_string()]
        }
    );
    assert!(matches!(outcome.status, InstanceStatus::Applied { version: Some(3) }));
    assert_eq!(
        h.provider.actions_for("admin"),
        vec!["create", "update", "delete", "create"]
    );

    let record = h.store.read("admin").await.unwrap().unwrap();
    assert_eq!(
        record.attributes["arn"],
        AttributeValue::string("arn:iam::role/admin2")
    );
}

#[tokio::test]
async fn test_drifted_record_is_deleted() {
    let h = harness();
    h.reconciler
        .reconcile(
            vec![role("admin", "admin", "p0"), role("viewer", "viewer", "ro")],
            Mode::Apply,
        )
        .await
        .unwrap();

    let report = h
        .reconciler
        .reconcile(vec![role("admin", "admin", "p0")], Mode::Apply)
        .await
        .unwrap();
    let viewer = report.get("viewer").unwrap();
    assert_eq!(viewer.action, ChangeAction::Delete);
    assert!(matches!(viewer.status, InstanceStatus::Applied { version: None }));
    assert!(viewer.after.is_none());
    assert!(h.store.read("viewer").await.unwrap().is_none());
    assert!(h.store.read("admin").await.unwrap().is_some());
}

#[tokio::test]
async fn test_plan_only_applies_nothing() {
    let h = harness();
    let report = h
        .reconciler
        .reconcile(vec![role("admin", "admin", "p0")], Mode::PlanOnly)
        .await
        .unwrap();
    assert!(matches!(
        report.get("admin").unwrap().status,
        InstanceStatus::Planned
    ));
    assert_eq!(h.provider.call_count(), 0);
    assert!(h.store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_dependency_blocks_dependents() {
    let h = harness();
    let report = h
        .reconciler
        .reconcile(
            vec![
                binding("ops-binding", "doomed"),
                role("doomed", "doomed", "p0"),
                role("admin", "admin", "p0"),
            ],
            Mode::Apply,
        )
        .await
        .unwrap();

    let doomed = report.get("doomed").unwrap();
    match &doomed.status {
        InstanceStatus::Failed { phase, error } => {
            assert_eq!(*phase, Phase::Applying);
            assert!(matches!(error, Error::Provider { code: -32000, .. }));
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert!(doomed.after.is_some());

    match &report.get("ops-binding").unwrap().status {
        InstanceStatus::DependencyFailed { dependency } => assert_eq!(dependency, "doomed"),
        other => panic!("unexpected status {other:?}"),
    }
    assert!(h.provider.actions_for("ops-binding").is_empty());
    assert!(report.get("admin").unwrap().status.is_success());
    assert!(h.store.read("doomed").await.unwrap().is_none());
}

#[tokio::test]
async fn test_binding_runs_after_its_role() {
    let h = harness();
    let report = h
        .reconciler
        .reconcile(
            vec![binding("ops-binding", "ops"), role("ops", "ops", "p0")],
            Mode::Apply,
        )
        .await
        .unwrap();
    assert!(report.is_success());
    let order: Vec<_> = report.outcomes.iter().map(|o| o.key.as_str()).collect();
    assert_eq!(order, vec!["ops", "ops-binding"]);
}

#[tokio::test]
async fn test_validation_failures_are_per_instance() {
    let h = harness();
    let missing_name = ResourceInstance::new(ResourceTypeId::new("iam", "role"), "nameless")
        .with_attribute("policy", AttributeValue::string("p0"));
    let unknown_type = ResourceInstance::new(ResourceTypeId::new("iam", "group"), "ops");

    let report = h
        .reconciler
        .reconcile(
            vec![
                role("bad", "bad", "forbidden"),
                missing_name,
                unknown_type,
                role("good", "good", "p0"),
            ],
            Mode::Apply,
        )
        .await
        .unwrap();

    match &report.get("bad").unwrap().status {
        InstanceStatus::Failed { phase, error } => {
            assert_eq!(*phase, Phase::Validating);
            assert_eq!(
                error.field_errors(),
                &[FieldError::new("policy", "policy is not allowed")]
            );
        }
        other => panic!("unexpected status {other:?}"),
    }
    match &report.get("nameless").unwrap().status {
        InstanceStatus::Failed { error, .. } => {
            assert_eq!(error.field_errors()[0].field, "name");
        }
        other => panic!("unexpected status {other:?}"),
    }
    match &report.get("ops").unwrap().status {
        InstanceStatus::Failed { phase, error } => {
            assert_eq!(*phase, Phase::Validating);
            assert!(matches!(error, Error::UnknownType(_)));
        }
        other => panic!("unexpected status {other:?}"),
    }

    assert!(report.get("good").unwrap().status.is_success());
    assert_eq!(report.failures().len(), 3);
    assert!(h.provider.actions_for("bad").is_empty());
}

#[tokio::test]
async fn test_reference_cycle_fails_the_run() {
    let h = harness();
    let err = h
        .reconciler
        .reconcile(vec![binding("a", "b"), binding("b", "a")], Mode::Apply)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CyclicDependency { .. }));
    assert!(err.is_fatal());
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test]
async fn test_contended_lock_fails_only_that_instance() {
    let h = harness();
    let token = h
        .store
        .acquire_lock("admin", "other-engine", Duration::from_secs(30))
        .await
        .unwrap();

    let report = h
        .reconciler
        .reconcile(
            vec![role("admin", "admin", "p0"), role("viewer", "viewer", "ro")],
            Mode::Apply,
        )
        .await
        .unwrap();

    match &report.get("admin").unwrap().status {
        InstanceStatus::Failed { phase, error } => {
            assert_eq!(*phase, Phase::Locking);
            assert!(error.is_retryable());
            assert!(error.to_string().contains("other-engine"));
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert!(report.get("viewer").unwrap().status.is_success());
    assert!(h
        .sink
        .events_for("admin")
        .iter()
        .any(|e| matches!(e, EngineEvent::LockContended { .. })));

    // The foreign lock is untouched
    assert_eq!(
        h.store.lock_holder("admin").await.as_deref(),
        Some("other-engine")
    );
    h.store.release_lock("admin", &token).await.unwrap();
}

#[tokio::test]
async fn test_events_follow_the_state_machine() {
    let h = harness();
    h.reconciler
        .reconcile(vec![role("admin", "admin", "p0")], Mode::Apply)
        .await
        .unwrap();

    let events = h.sink.events_for("admin");
    let phases: Vec<Phase> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::PhaseChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            Phase::Locking,
            Phase::Validating,
            Phase::Planning,
            Phase::Applying,
            Phase::Persisting,
            Phase::Idle,
        ]
    );

    assert!(events.iter().any(|e| matches!(e, EngineEvent::LockAcquired { .. })));
    assert!(events.iter().any(|e| matches!(e, EngineEvent::LockReleased { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::ApplyFinished { version: 1, .. })));
    assert!(h
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, EngineEvent::BatchPlanned { instances: 1, changes: 1, .. })));
    assert!(h.store.lock_holder("admin").await.is_none());
}

#[tokio::test]
async fn test_import_persists_version_one() {
    let h = harness();
    let role_type = ResourceTypeId::new("iam", "role");

    let record = h
        .reconciler
        .import(&role_type, "legacy", "arn:iam::role/legacy")
        .await
        .unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(record.attributes["name"], AttributeValue::string("legacy"));

    let err = h
        .reconciler
        .import(&role_type, "legacy", "arn:iam::role/legacy")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::VersionConflict { expected: 0, actual: 1, .. }));

    // Imported state matches its declaration
    let plan = h
        .reconciler
        .plan(&[role("legacy", "legacy", "ro")])
        .await
        .unwrap();
    assert!(!plan.has_changes());
}

#[tokio::test]
async fn test_cancelled_reconciler_starts_nothing() {
    let h = harness();
    let cancel = h.reconciler.cancel_handle();
    cancel.cancel();
    assert!(cancel.is_cancelled());

    let report = h
        .reconciler
        .reconcile(vec![role("admin", "admin", "p0")], Mode::Apply)
        .await
        .unwrap();
    assert!(matches!(
        report.get("admin").unwrap().status,
        InstanceStatus::Cancelled
    ));
    assert_eq!(h.provider.call_count(), 0);
}

/// Wait until the provider has seen `count` apply calls for `key`
async fn wait_for_applies(provider: &DirectoryProvider, key: &str, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while provider.actions_for(key).len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_cancel_during_create_releases_lock() {
    let h = harness();
    let cancel = h.reconciler.cancel_handle();
    let provider = Arc::clone(&h.provider);
    let canceller = tokio::spawn(async move {
        wait_for_applies(&provider, "slow", 1).await;
        cancel.cancel();
    });

    let report = h
        .reconciler
        .reconcile(vec![role("slow", "slow", "p0")], Mode::Apply)
        .await
        .unwrap();
    canceller.await.unwrap();

    let outcome = report.get("slow").unwrap();
    assert_eq!(outcome.action, ChangeAction::Create);
    assert!(matches!(outcome.status, InstanceStatus::Cancelled));
    assert!(h.store.read("slow").await.unwrap().is_none());
    assert!(h.store.lock_holder("slow").await.is_none());
}

#[tokio::test]
async fn test_cancel_after_replace_delete_drops_record() {
    let h = harness();
    h.reconciler
        .reconcile(vec![role("admin", "admin", "p0")], Mode::Apply)
        .await
        .unwrap();
    assert!(h.store.read("admin").await.unwrap().is_some());

    let cancel = h.reconciler.cancel_handle();
    let provider = Arc::clone(&h.provider);
    let canceller = tokio::spawn(async move {
        // create, then the replacement's delete and create
        wait_for_applies(&provider, "admin", 3).await;
        cancel.cancel();
    });

    let report = h
        .reconciler
        .reconcile(vec![role("admin", "admin2", "stall")], Mode::Apply)
        .await
        .unwrap();
    canceller.await.unwrap();

    let outcome = report.get("admin").unwrap();
    assert!(matches!(outcome.action, ChangeAction::Replace { .. }));
    assert!(matches!(outcome.status, InstanceStatus::Cancelled));
    assert_eq!(
        h.provider.actions_for("admin"),
        vec!["create", "delete", "create"]
    );
    assert!(h.store.read("admin").await.unwrap().is_none());
    assert!(h.store.lock_holder("admin").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_apply_timeout_keeps_before_and_after() {
    let h = harness_with(
        EngineConfig {
            call_timeout: Duration::from_secs(1),
            ..config()
        },
        Arc::new(MemoryBackend::new()),
    );

    let report = h
        .reconciler
        .reconcile(vec![role("slow", "slow", "p0")], Mode::Apply)
        .await
        .unwrap();
    let outcome = report.get("slow").unwrap();
    match &outcome.status {
        InstanceStatus::Failed { phase, error } => {
            assert_eq!(*phase, Phase::Applying);
            assert!(matches!(error, Error::Timeout(_)));
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert!(outcome.after.is_some());
    assert!(h.store.read("slow").await.unwrap().is_none());
    assert!(h.store.lock_holder("slow").await.is_none());
}

#[tokio::test]
async fn test_version_conflict_halts_the_batch() {
    let backend = ConflictingBackend {
        inner: MemoryBackend::new(),
        key: "admin",
    };
    let h = harness_with(
        EngineConfig {
            pool_size: 1,
            ..config()
        },
        Arc::new(backend),
    );

    let report = h
        .reconciler
        .reconcile(
            vec![role("admin", "admin", "p0"), role("zeta", "zeta", "p0")],
            Mode::Apply,
        )
        .await
        .unwrap();
    assert!(report.halted);
    match &report.get("admin").unwrap().status {
        InstanceStatus::Failed { phase, error } => {
            assert_eq!(*phase, Phase::Persisting);
            assert!(error.is_fatal());
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert!(matches!(
        report.get("zeta").unwrap().status,
        InstanceStatus::Skipped
    ));
    assert!(h.provider.actions_for("zeta").is_empty());
}

#[tokio::test]
async fn test_provider_plan_can_escalate_to_replace() {
    let h = harness_with(
        EngineConfig {
            provider_plans: true,
            ..config()
        },
        Arc::new(MemoryBackend::new()),
    );
    h.reconciler
        .reconcile(vec![role("admin", "admin", "p0")], Mode::Apply)
        .await
        .unwrap();

    let report = h
        .reconciler
        .reconcile(vec![role("admin", "admin", "p1")], Mode::Apply)
        .await
        .unwrap();
    assert_eq!(
        report.get("admin").unwrap().action,
        ChangeAction::Replace {
            forced_by: vec!["policy".to_string()]
        }
    );
    assert_eq!(
        h.provider.actions_for("admin"),
        vec!["create", "delete", "create"]
    );
    assert_eq!(h.store.read("admin").await.unwrap().unwrap().version, 2);
}
