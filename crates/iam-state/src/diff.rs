//! Diff engine
//!
//! Compares desired instances with last-known state record by record, then
//! orders the resulting changes over the reference graph.
//!
//! Ordering rules:
//! - an instance runs after every desired instance it references
//! - an instance whose last-known state references a key that is being
//!   deleted runs before that delete
//! - otherwise deletes go first, then replaces, updates, creates and no-ops,
//!   ties broken by key

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::sync::Arc;

use iam_core::{Attributes, Error, ResourceInstance, ResourceTypeId, Result, StateRecord};
use iam_state_store::SchemaRegistry;
use tracing::{debug, warn};

use crate::change::{ChangeAction, ChangePlan, PlannedChange};

pub struct DiffEngine {
    registry: Arc<SchemaRegistry>,
}

impl DiffEngine {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Action that turns `prior` into `desired`.
    ///
    /// Only non-computed attributes declared by the descriptor are compared.
    /// A desired `unknown` value always counts as a change.
    pub fn plan(
        &self,
        desired: Option<&ResourceInstance>,
        prior: Option<&StateRecord>,
    ) -> Result<ChangeAction> {
        let (desired, prior) = match (desired, prior) {
            (None, None) => return Ok(ChangeAction::NoOp),
            (None, Some(_)) => return Ok(ChangeAction::Delete),
            (Some(desired), prior) => (desired, prior),
        };

        let resource_type = self.registry.lookup(&desired.type_id)?;
        if let Some(name) = desired
            .attributes
            .keys()
            .find(|name| resource_type.attribute(name).is_none())
        {
            return Err(Error::UnknownAttribute {
                type_id: desired.type_id.to_string(),
                attribute: name.clone(),
            });
        }

        let Some(prior) = prior else {
            return Ok(ChangeAction::Create);
        };

        if prior.type_id != desired.type_id {
            return Ok(ChangeAction::Replace {
                forced_by: Vec::new(),
            });
        }

        let mut forced_by = Vec::new();
        let mut changed = Vec::new();
        for descriptor in resource_type.attributes.iter().filter(|a| !a.computed) {
            let wanted = desired.attributes.get(&descriptor.name);
            let current = prior.attributes.get(&descriptor.name);
            let differs = match wanted {
                Some(value) if value.is_unknown() => true,
                _ => wanted != current,
            };
            if !differs {
                continue;
            }
            if descriptor.forces_replacement {
                forced_by.push(descriptor.name.clone());
            } else {
                changed.push(descriptor.name.clone());
            }
        }

        Ok(if !forced_by.is_empty() {
            ChangeAction::Replace { forced_by }
        } else if !changed.is_empty() {
            ChangeAction::Update { changed }
        } else {
            ChangeAction::NoOp
        })
    }

    /// Plan one instance; falls back to the prior snapshot carried by the instance
    pub fn plan_instance(
        &self,
        key: &str,
        desired: Option<&ResourceInstance>,
        prior: Option<&StateRecord>,
    ) -> Result<PlannedChange> {
        let prior = prior.or_else(|| desired.and_then(|d| d.prior.as_ref()));
        let action = self.plan(desired, prior)?;
        Ok(planned(key, action, desired, prior))
    }

    /// Plan a whole desired set against the prior set.
    ///
    /// Records without a desired instance are planned as deletes. Any
    /// per-instance error or a reference cycle fails the whole plan.
    pub fn plan_all(&self, desired: &[ResourceInstance], prior: &[StateRecord]) -> Result<ChangePlan> {
        self.build(desired, prior, true)
    }

    /// Like [`plan_all`](Self::plan_all), but an instance that cannot be
    /// planned keeps a provisional action instead of failing the batch.
    /// Only reference cycles are fatal. Used to schedule reconciliation,
    /// where each instance is re-planned and validated under its own lock.
    pub fn schedule(&self, desired: &[ResourceInstance], prior: &[StateRecord]) -> Result<ChangePlan> {
        self.build(desired, prior, false)
    }

    /// Reconcile a provider-supplied plan with the engine's own.
    ///
    /// The engine's action stands unless the provider escalates an update
    /// into a replace forced by some of the attributes the engine found changed.
    pub fn reconcile_advisory(
        &self,
        key: &str,
        engine: &ChangeAction,
        provider: &ChangeAction,
    ) -> ChangeAction {
        if engine == provider {
            return engine.clone();
        }
        if let (ChangeAction::Update { changed }, ChangeAction::Replace { forced_by }) = (engine, provider) {
            if !forced_by.is_empty() && forced_by.iter().all(|name| changed.contains(name)) {
                debug!(key, "Provider escalated update to replace");
                return provider.clone();
            }
        }
        warn!(
            key,
            engine = %engine,
            provider = %provider,
            "Ignoring provider plan that disagrees with the diff engine"
        );
        engine.clone()
    }

    fn build(&self, desired: &[ResourceInstance], prior: &[StateRecord], strict: bool) -> Result<ChangePlan> {
        let mut desired_by_key: BTreeMap<&str, &ResourceInstance> = BTreeMap::new();
        for instance in desired {
            if desired_by_key.insert(instance.key.as_str(), instance).is_some() {
                warn!(key = %instance.key, "Duplicate instance key in desired set, last declaration wins");
            }
        }
        let prior_by_key: BTreeMap<&str, &StateRecord> =
            prior.iter().map(|r| (r.instance_key.as_str(), r)).collect();

        let keys: BTreeSet<&str> = desired_by_key
            .keys()
            .chain(prior_by_key.keys())
            .copied()
            .collect();

        let mut changes = BTreeMap::new();
        for key in keys {
            let wanted = desired_by_key.get(key).copied();
            let current = prior_by_key.get(key).copied();
            let change = match self.plan_instance(key, wanted, current) {
                Ok(change) => change,
                Err(e) if !strict => {
                    debug!(key, error = %e, "Instance not plannable, scheduling provisionally");
                    let current = current.or_else(|| wanted.and_then(|d| d.prior.as_ref()));
                    planned(key, provisional_action(wanted, current), wanted, current)
                }
                Err(e) => return Err(e),
            };
            changes.insert(key.to_string(), (change, wanted, current));
        }

        let ordered = order(changes)?;
        Ok(ChangePlan::new(ordered))
    }
}

fn planned(
    key: &str,
    action: ChangeAction,
    desired: Option<&ResourceInstance>,
    prior: Option<&StateRecord>,
) -> PlannedChange {
    let type_id = desired
        .map(|d| d.type_id.clone())
        .or_else(|| prior.map(|p| p.type_id.clone()))
        .unwrap_or_else(|| ResourceTypeId::new("unknown", "unknown"));
    let after: Option<Attributes> = match action {
        ChangeAction::Delete => None,
        _ => desired.map(|d| d.attributes.clone()),
    };
    PlannedChange {
        instance_key: key.to_string(),
        type_id,
        action,
        before: prior.map(|p| p.attributes.clone()),
        after,
        depends_on: Vec::new(),
    }
}

fn provisional_action(desired: Option<&ResourceInstance>, prior: Option<&StateRecord>) -> ChangeAction {
    match (desired, prior) {
        (Some(_), None) => ChangeAction::Create,
        (None, Some(_)) => ChangeAction::Delete,
        (Some(_), Some(_)) => ChangeAction::Update { changed: Vec::new() },
        (None, None) => ChangeAction::NoOp,
    }
}

fn rank(action: &ChangeAction) -> u8 {
    match action {
        ChangeAction::Delete => 0,
        ChangeAction::Replace { .. } => 1,
        ChangeAction::Update { .. } => 2,
        ChangeAction::Create => 3,
        ChangeAction::NoOp => 4,
    }
}

type Entry<'a> = (PlannedChange, Option<&'a ResourceInstance>, Option<&'a StateRecord>);

/// Topological order over the reference graph
fn order(mut entries: BTreeMap<String, Entry<'_>>) -> Result<Vec<PlannedChange>> {
    // predecessor -> successors
    let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for (key, (change, desired, prior)) in &entries {
        if !matches!(change.action, ChangeAction::Delete) {
            if let Some(desired) = desired {
                for target in desired.references() {
                    let Some((target_change, _, _)) = entries.get(&target) else {
                        continue;
                    };
                    if !matches!(target_change.action, ChangeAction::Delete) {
                        edges.entry(target).or_default().insert(key.clone());
                    }
                }
            }
        }
        if let Some(prior) = prior {
            for target in prior.references() {
                if &target == key {
                    continue;
                }
                if let Some((target_change, _, _)) = entries.get(&target) {
                    if matches!(target_change.action, ChangeAction::Delete) {
                        edges.entry(key.clone()).or_default().insert(target);
                    }
                }
            }
        }
    }

    let mut in_degree: BTreeMap<String, usize> = entries.keys().map(|k| (k.clone(), 0)).collect();
    for successors in edges.values() {
        for successor in successors {
            if let Some(degree) = in_degree.get_mut(successor) {
                *degree += 1;
            }
        }
    }

    let mut ready = BinaryHeap::new();
    for (key, degree) in &in_degree {
        if *degree == 0 {
            if let Some((change, _, _)) = entries.get(key) {
                ready.push(Reverse((rank(&change.action), key.clone())));
            }
        }
    }

    let mut ordered = Vec::with_capacity(entries.len());
    while let Some(Reverse((_, key))) = ready.pop() {
        if let Some(successors) = edges.get(&key) {
            for successor in successors {
                let Some(degree) = in_degree.get_mut(successor) else {
                    continue;
                };
                *degree -= 1;
                if *degree == 0 {
                    if let Some((change, _, _)) = entries.get(successor) {
                        ready.push(Reverse((rank(&change.action), successor.clone())));
                    }
                }
            }
        }
        ordered.push(key);
    }

    if ordered.len() < entries.len() {
        let placed: BTreeSet<&String> = ordered.iter().collect();
        let remaining: BTreeSet<String> = entries
            .keys()
            .filter(|k| !placed.contains(k))
            .cloned()
            .collect();
        return Err(Error::CyclicDependency {
            keys: cycle_members(remaining, &edges),
        });
    }

    let mut predecessors: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (from, successors) in &edges {
        for to in successors {
            predecessors.entry(to.clone()).or_default().push(from.clone());
        }
    }

    Ok(ordered
        .into_iter()
        .filter_map(|key| {
            let (mut change, _, _) = entries.remove(&key)?;
            change.depends_on = predecessors.remove(&key).unwrap_or_default();
            Some(change)
        })
        .collect())
}

/// Strip nodes that merely hang off a cycle, leaving its participants
fn cycle_members(mut remaining: BTreeSet<String>, edges: &BTreeMap<String, BTreeSet<String>>) -> Vec<String> {
    loop {
        let prunable: Vec<String> = remaining
            .iter()
            .filter(|key| {
                let has_out = edges
                    .get(*key)
                    .map(|s| s.iter().any(|t| remaining.contains(t)))
                    .unwrap_or(false);
                let has_in = edges
                    .iter()
                    .any(|(from, s)| remaining.contains(from) && s.contains(*key));
                !has_out || !has_in
            })
            .cloned()
            .collect();
        if prunable.is_empty() {
            break;
        }
        for key in prunable {
            remaining.remove(&key);
        }
    }
    remaining.into_iter().collect()
}
