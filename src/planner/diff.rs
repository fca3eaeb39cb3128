//! Diff between desired configuration and last-applied state.

use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::config::{DesiredConfiguration, DesiredModule, Fingerprinter};
use crate::error::{PlanError, Result};
use crate::graph::{ExecutionOrder, ResourceGraph};
use crate::state::{ModuleState, StateSnapshot};

use super::plan::{ActionType, ChangePlan, PlannedAction};

/// Computes change plans.
#[derive(Debug, Default, Clone, Copy)]
pub struct Planner {
    fingerprinter: Fingerprinter,
}

impl Planner {
    /// Creates a new planner.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fingerprinter: Fingerprinter::new(),
        }
    }

    /// Computes the plan that reconciles `snapshot` with `desired`.
    ///
    /// `order` must be the execution order of `desired`'s graph. Creates and
    /// updates follow it; modules that are in the snapshot but no longer
    /// desired are deleted afterwards, dependents first.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::OrderMismatch`] if `order` and `desired` disagree,
    /// [`PlanError::UnresolvedOutput`] if an unchanged dependency never
    /// produced a referenced output, or a graph error if the snapshot's
    /// recorded dependencies are inconsistent.
    pub fn plan(
        &self,
        desired: &DesiredConfiguration,
        snapshot: &StateSnapshot,
        order: &ExecutionOrder,
    ) -> Result<ChangePlan> {
        if let Some(missing) = desired.modules().iter().find(|m| !order.contains(&m.name)) {
            return Err(PlanError::OrderMismatch {
                module: missing.name.clone(),
            }
            .into());
        }

        let mut actions = Vec::with_capacity(order.len());
        let mut changed: HashSet<&str> = HashSet::new();

        for name in order.iter() {
            let module = desired.module(name).ok_or_else(|| PlanError::OrderMismatch {
                module: name.to_string(),
            })?;
            let prior = snapshot.module(name);

            let action = self.plan_module(module, prior, snapshot, &changed)?;
            debug!(module = name, action = %action.action, reason = %action.reason, "Planned");

            if matches!(action.action, ActionType::Create | ActionType::Update) {
                changed.insert(name);
            }
            actions.push(action);
        }

        let removed: HashSet<&str> = snapshot
            .modules
            .keys()
            .map(String::as_str)
            .filter(|name| !desired.contains(name))
            .collect();
        if !removed.is_empty() {
            let teardown_order = ResourceGraph::from_snapshot(snapshot).build()?.reversed();
            actions.extend(
                teardown_order
                    .iter()
                    .filter(|name| removed.contains(name))
                    .filter_map(|name| {
                        snapshot.module(name).map(|state| {
                            delete_action(name, state, "Removed from configuration")
                        })
                    }),
            );
        }

        Ok(ChangePlan::new(desired.environment(), actions))
    }

    /// Computes a plan that deletes every module in `snapshot`, dependents first.
    ///
    /// # Errors
    ///
    /// Returns a graph error if the snapshot's recorded dependencies contain a cycle.
    pub fn plan_teardown(&self, snapshot: &StateSnapshot) -> Result<ChangePlan> {
        let order = ResourceGraph::from_snapshot(snapshot).build()?.reversed();
        let actions = order
            .iter()
            .filter_map(|name| {
                snapshot
                    .module(name)
                    .map(|state| delete_action(name, state, "Environment teardown"))
            })
            .collect();
        Ok(ChangePlan::new(&snapshot.environment, actions))
    }

    fn plan_module(
        &self,
        module: &DesiredModule,
        prior: Option<&ModuleState>,
        snapshot: &StateSnapshot,
        changed: &HashSet<&str>,
    ) -> Result<PlannedAction> {
        let changed_dependency = module
            .depends_on
            .iter()
            .find(|dep| changed.contains(dep.as_str()));

        let (action, desired_fingerprint, reason) = if let Some(dep) = changed_dependency {
            let action = if prior.is_some() {
                ActionType::Update
            } else {
                ActionType::Create
            };
            (action, None, format!("Dependency '{dep}' changes"))
        } else {
            let resolved = module
                .resolve_inputs(|m, o| snapshot.output(m, o).cloned())
                .map_err(|r| PlanError::UnresolvedOutput {
                    module: module.name.clone(),
                    input: r.input,
                    reference: r.reference,
                })?;
            let fingerprint = self.fingerprinter.fingerprint(&module.kind, &resolved);

            let (action, reason) = match prior {
                None => (ActionType::Create, String::from("Not yet provisioned")),
                Some(state) if state.fingerprint != fingerprint => {
                    (ActionType::Update, String::from("Inputs changed"))
                }
                Some(state) if module.outputs.iter().any(|o| !state.outputs.contains_key(o)) => {
                    (ActionType::Update, String::from("Declared outputs changed"))
                }
                Some(_) => (ActionType::Noop, String::from("Up to date")),
            };
            (action, Some(fingerprint), reason)
        };

        Ok(PlannedAction {
            module: module.name.clone(),
            kind: module.kind.clone(),
            action,
            prior_fingerprint: prior.map(|s| s.fingerprint.clone()),
            desired_fingerprint,
            inputs: module.inputs.clone(),
            depends_on: module.depends_on.clone(),
            outputs: module.outputs.clone(),
            reason,
        })
    }
}

fn delete_action(name: &str, state: &ModuleState, reason: &str) -> PlannedAction {
    PlannedAction {
        module: name.to_string(),
        kind: state.kind.clone(),
        action: ActionType::Delete,
        prior_fingerprint: Some(state.fingerprint.clone()),
        desired_fingerprint: None,
        inputs: BTreeMap::new(),
        depends_on: state.depends_on.clone(),
        outputs: state.outputs.keys().cloned().collect(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputValue;
    use crate::error::KeelError;
    use serde_json::json;

    fn network() -> DesiredModule {
        DesiredModule::new("network", "network")
            .input("cidr", InputValue::literal("10.0.0.0/16"))
            .output("vpc_id")
    }

    fn cluster() -> DesiredModule {
        DesiredModule::new("cluster", "cluster")
            .input("vpc", InputValue::output("network", "vpc_id"))
            .input("size", InputValue::literal(3))
            .output("endpoint")
    }

    fn plan(desired: &DesiredConfiguration, snapshot: &StateSnapshot) -> ChangePlan {
        let order = ResourceGraph::from_desired(desired).build().expect("acyclic");
        Planner::new().plan(desired, snapshot, &order).expect("plans")
    }

    /// Records every module of `desired` as applied with its planned fingerprint.
    fn applied(desired: &DesiredConfiguration) -> StateSnapshot {
        let mut snapshot = StateSnapshot::empty(desired.environment());
        let order = ResourceGraph::from_desired(desired).build().expect("acyclic");
        let fingerprinter = Fingerprinter::new();
        for name in order.iter() {
            let module = desired.module(name).expect("module");
            let inputs = module
                .resolve_inputs(|m, o| snapshot.output(m, o).cloned())
                .expect("resolves");
            let outputs = module
                .outputs
                .iter()
                .map(|o| (o.clone(), json!(format!("{name}-{o}"))))
                .collect();
            let fingerprint = fingerprinter.fingerprint(&module.kind, &inputs);
            snapshot.set_module(
                name,
                ModuleState::new(&module.kind, &fingerprint, outputs)
                    .with_dependencies(module.depends_on.clone()),
            );
        }
        snapshot
    }

    #[test]
    fn test_empty_state_creates_everything_in_order() {
        let desired = DesiredConfiguration::from_modules("dev", vec![cluster(), network()]);
        let plan = plan(&desired, &StateSnapshot::empty("dev"));

        let modules: Vec<_> = plan.actions.iter().map(|a| a.module.as_str()).collect();
        assert_eq!(modules, vec!["network", "cluster"]);
        assert_eq!(plan.count(ActionType::Create), 2);
        // cluster consumes an output network has not produced yet
        assert!(plan.action("cluster").expect("cluster").desired_fingerprint.is_none());
    }

    #[test]
    fn test_identical_configuration_is_all_noop() {
        let desired = DesiredConfiguration::from_modules("dev", vec![network(), cluster()]);
        let snapshot = applied(&desired);

        let plan = plan(&desired, &snapshot);
        assert!(!plan.has_changes());
        assert!(plan.actions.iter().all(|a| a.action == ActionType::Noop));
    }

    #[test]
    fn test_changed_dependency_cascades() {
        let desired = DesiredConfiguration::from_modules("dev", vec![network(), cluster()]);
        let snapshot = applied(&desired);

        let changed = DesiredConfiguration::from_modules(
            "dev",
            vec![
                network().input("cidr", InputValue::literal("10.1.0.0/16")),
                cluster(),
            ],
        );
        let plan = plan(&changed, &snapshot);

        assert_eq!(plan.action("network").map(|a| a.action), Some(ActionType::Update));
        let cluster = plan.action("cluster").expect("cluster planned");
        assert_eq!(cluster.action, ActionType::Update);
        assert!(cluster.desired_fingerprint.is_none());
        assert!(cluster.reason.contains("network"));
    }

    #[test]
    fn test_removed_modules_deleted_last_dependents_first() {
        let storage = DesiredModule::new("storage", "csi").depends_on("cluster");
        let desired =
            DesiredConfiguration::from_modules("dev", vec![network(), cluster(), storage]);
        let snapshot = applied(&desired);

        let remaining = DesiredConfiguration::from_modules(
            "dev",
            vec![network().input("cidr", InputValue::literal("10.2.0.0/16"))],
        );
        let plan = plan(&remaining, &snapshot);

        let sequence: Vec<_> = plan
            .actions
            .iter()
            .map(|a| (a.module.as_str(), a.action))
            .collect();
        assert_eq!(
            sequence,
            vec![
                ("network", ActionType::Update),
                ("storage", ActionType::Delete),
                ("cluster", ActionType::Delete),
            ]
        );
    }

    #[test]
    fn test_missing_output_of_unchanged_dependency() {
        let desired = DesiredConfiguration::from_modules("dev", vec![network()]);
        let snapshot = applied(&desired);

        let consumer = DesiredModule::new("dns", "dns")
            .input("zone", InputValue::output("network", "zone_id"));
        let changed = DesiredConfiguration::from_modules("dev", vec![network(), consumer]);
        let order = ResourceGraph::from_desired(&changed).build().expect("acyclic");

        let err = Planner::new().plan(&changed, &snapshot, &order).unwrap_err();
        assert!(matches!(
            err,
            KeelError::Plan(PlanError::UnresolvedOutput { ref module, .. }) if module == "dns"
        ));
    }

    #[test]
    fn test_order_must_cover_desired() {
        let desired = DesiredConfiguration::from_modules("dev", vec![network(), cluster()]);
        let partial = DesiredConfiguration::from_modules("dev", vec![network()]);
        let order = ResourceGraph::from_desired(&partial).build().expect("acyclic");

        let err = Planner::new()
            .plan(&desired, &StateSnapshot::empty("dev"), &order)
            .unwrap_err();
        assert!(matches!(err, KeelError::Plan(PlanError::OrderMismatch { .. })));
    }

    #[test]
    fn test_teardown_reverses_dependency_order() {
        let desired = DesiredConfiguration::from_modules("dev", vec![network(), cluster()]);
        let snapshot = applied(&desired);

        let plan = Planner::new().plan_teardown(&snapshot).expect("plans");
        let modules: Vec<_> = plan.actions.iter().map(|a| a.module.as_str()).collect();
        assert_eq!(modules, vec!["cluster", "network"]);
        assert!(plan.actions.iter().all(|a| a.action == ActionType::Delete));
    }
}
