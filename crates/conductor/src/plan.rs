//! Flow declarations and the run plan.
//!
//! Flows are declared (built-in or from config), validated as DAGs, and
//! rendered as the plan view the CLI and the status server expose.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::types::{FlowSpec, MicroloopSpec, StepSpec, StepTier};

/// Named flows available to runs.
#[derive(Debug, Clone, Default)]
pub struct FlowRegistry {
    flows: BTreeMap<String, FlowSpec>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in signal → plan → build → gate pipeline.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for flow in builtin_flows() {
            registry.flows.insert(flow.flow_key.clone(), flow);
        }
        registry
    }

    pub fn insert(&mut self, flow: FlowSpec) -> Result<()> {
        validate_flow(&flow)?;
        self.flows.insert(flow.flow_key.clone(), flow);
        Ok(())
    }

    pub fn get(&self, flow_key: &str) -> Option<&FlowSpec> {
        self.flows.get(flow_key)
    }

    pub fn resolve(&self, flow_key: &str) -> Result<&FlowSpec> {
        self.flows
            .get(flow_key)
            .with_context(|| format!("unknown flow: {flow_key}"))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.flows.keys().map(|k| k.as_str())
    }

    /// Plan view for the CLI and the `/plan` endpoint.
    pub fn plan_view(&self, flow_order: &[String]) -> Result<PlanView> {
        let mut flows = Vec::new();
        for key in flow_order {
            let flow = self.resolve(key)?;
            flows.push(PlanFlow {
                flow_key: flow.flow_key.clone(),
                goal: flow.goal.clone(),
                steps: flow
                    .steps
                    .iter()
                    .map(|s| PlanStep {
                        step_id: s.step_id.clone(),
                        agent_key: s.agent_key.clone(),
                        tier: s.tier,
                        depends_on: s.depends_on.clone(),
                        microloop: s.microloop.is_some(),
                        skill: s.skill.clone(),
                        ac_ids: s.ac_ids.clone(),
                    })
                    .collect(),
            });
        }
        Ok(PlanView { flows })
    }
}

/// The declared plan, as exposed read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanView {
    pub flows: Vec<PlanFlow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFlow {
    pub flow_key: String,
    pub goal: String,
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_id: String,
    pub agent_key: String,
    pub tier: StepTier,
    pub depends_on: Vec<String>,
    pub microloop: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    pub ac_ids: Vec<String>,
}

/// Validate a flow graph: unique step IDs, dependencies on earlier steps
/// only. Listing order is the topological order; forward references are
/// rejected, which also rules out cycles.
pub fn validate_flow(flow: &FlowSpec) -> Result<()> {
    if flow.steps.is_empty() {
        bail!("flow {} declares no steps", flow.flow_key);
    }

    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for step in &flow.steps {
        if !seen.insert(step.step_id.as_str()) {
            bail!(
                "flow {} declares duplicate step id {}",
                flow.flow_key,
                step.step_id
            );
        }
    }

    let mut earlier: BTreeSet<&str> = BTreeSet::new();
    for step in &flow.steps {
        for dep in &step.depends_on {
            if dep == &step.step_id {
                bail!(
                    "flow {} step {} depends on itself",
                    flow.flow_key,
                    step.step_id
                );
            }
            if !earlier.contains(dep.as_str()) {
                bail!(
                    "flow {} step {} depends on {}, which is not an earlier step",
                    flow.flow_key,
                    step.step_id,
                    dep
                );
            }
        }
        earlier.insert(step.step_id.as_str());
    }

    Ok(())
}

/// Steps whose dependencies are all in `completed` and which are not
/// completed themselves, in declaration order.
pub fn ready_steps<'a>(flow: &'a FlowSpec, completed: &BTreeSet<String>) -> Vec<&'a StepSpec> {
    flow.steps
        .iter()
        .filter(|s| !completed.contains(&s.step_id))
        .filter(|s| s.depends_on.iter().all(|d| completed.contains(d)))
        .collect()
}

/// Greedy parallel group from the ready set: steps are added while their
/// declared `writes` sets stay pairwise disjoint. A step that declares no
/// writes cannot prove disjointness and runs solo.
pub fn parallel_group<'a>(ready: &[&'a StepSpec]) -> Vec<&'a StepSpec> {
    let Some(first) = ready.first() else {
        return Vec::new();
    };
    if first.writes.is_empty() {
        return vec![first];
    }

    let mut group: Vec<&StepSpec> = Vec::new();
    let mut claimed: BTreeSet<String> = BTreeSet::new();

    for step in ready {
        if step.writes.is_empty() {
            continue;
        }
        if step.writes.iter().any(|w| claimed.contains(w)) {
            continue;
        }
        claimed.extend(step.writes.iter().cloned());
        group.push(step);
    }
    group
}

fn agent_step(step_id: &str, agent_key: &str, depends_on: &[&str]) -> StepSpec {
    StepSpec {
        step_id: step_id.to_string(),
        agent_key: agent_key.to_string(),
        tier: StepTier::Kernel,
        timeout_override_ms: None,
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        microloop: None,
        writes: vec![],
        skill: None,
        ac_ids: vec![],
    }
}

/// The built-in four-flow pipeline from signal to gated merge.
pub fn builtin_flows() -> Vec<FlowSpec> {
    let mut triage = agent_step("triage", "analyst", &[]);
    triage.writes = vec!["signal_report".to_string()];

    let signal = FlowSpec {
        flow_key: "signal".to_string(),
        goal: "turn the input signal into a scoped problem statement".to_string(),
        exit_criteria: vec!["problem statement verified".to_string()],
        non_goals: vec!["solution design".to_string()],
        steps: vec![triage, {
            let mut s = agent_step("scope", "analyst", &["triage"]);
            s.writes = vec!["scope_statement".to_string()];
            s
        }],
    };

    let plan = FlowSpec {
        flow_key: "plan".to_string(),
        goal: "produce an acceptance-criteria-backed implementation plan".to_string(),
        exit_criteria: vec!["plan verified by critic".to_string()],
        non_goals: vec![],
        steps: vec![
            {
                let mut s = agent_step("draft_plan", "planner", &[]);
                s.microloop = Some(MicroloopSpec {
                    partner_agent_key: "plan_critic".to_string(),
                    max_iter: 3,
                });
                s
            },
            agent_step("bind_acceptance", "planner", &["draft_plan"]),
        ],
    };

    let build = FlowSpec {
        flow_key: "build".to_string(),
        goal: "implement the plan with verified tests".to_string(),
        exit_criteria: vec!["tests pass".to_string(), "lint clean".to_string()],
        non_goals: vec![],
        steps: vec![
            {
                let mut s = agent_step("author_tests", "implementer", &[]);
                s.microloop = Some(MicroloopSpec {
                    partner_agent_key: "critic".to_string(),
                    max_iter: 3,
                });
                s.writes = vec!["tests".to_string()];
                s
            },
            {
                let mut s = agent_step("implement", "implementer", &["author_tests"]);
                s.microloop = Some(MicroloopSpec {
                    partner_agent_key: "critic".to_string(),
                    max_iter: 5,
                });
                s.writes = vec!["src".to_string()];
                s
            },
            {
                let mut s = agent_step("verify", "implementer", &["implement"]);
                s.skill = Some("test-runner".to_string());
                s.tier = StepTier::Governance;
                s
            },
        ],
    };

    let gate = FlowSpec {
        flow_key: "gate".to_string(),
        goal: "hold the boundary before any external mutation".to_string(),
        exit_criteria: vec!["no secrets".to_string(), "evidence fresh".to_string()],
        non_goals: vec![],
        steps: vec![{
            let mut s = agent_step("publish_check", "publisher", &[]);
            s.tier = StepTier::Governance;
            s
        }],
    };

    let reset = FlowSpec {
        flow_key: "reset".to_string(),
        goal: "re-baseline the workspace after drift".to_string(),
        exit_criteria: vec!["workspace rebased".to_string()],
        non_goals: vec![],
        steps: vec![agent_step("rebase", "integrator", &[])],
    };

    vec![signal, plan, build, gate, reset]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str], writes: &[&str]) -> StepSpec {
        let mut s = agent_step(id, "implementer", deps);
        s.writes = writes.iter().map(|w| w.to_string()).collect();
        s
    }

    fn flow(steps: Vec<StepSpec>) -> FlowSpec {
        FlowSpec {
            flow_key: "test".to_string(),
            goal: "test".to_string(),
            exit_criteria: vec![],
            non_goals: vec![],
            steps,
        }
    }

    #[test]
    fn builtin_flows_validate() {
        for f in builtin_flows() {
            validate_flow(&f).expect("builtin flow must validate");
        }
        let registry = FlowRegistry::builtin();
        assert!(registry.get("signal").is_some());
        assert!(registry.get("gate").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let f = flow(vec![step("a", &[], &[]), step("a", &[], &[])]);
        assert!(validate_flow(&f).is_err());
    }

    #[test]
    fn validate_rejects_forward_and_self_dependencies() {
        let forward = flow(vec![step("a", &["b"], &[]), step("b", &[], &[])]);
        assert!(validate_flow(&forward).is_err());

        let selfish = flow(vec![step("a", &["a"], &[])]);
        assert!(validate_flow(&selfish).is_err());
    }

    #[test]
    fn validate_rejects_empty_flows() {
        assert!(validate_flow(&flow(vec![])).is_err());
    }

    #[test]
    fn ready_steps_respect_dependencies() {
        let f = flow(vec![
            step("a", &[], &[]),
            step("b", &["a"], &[]),
            step("c", &["a"], &[]),
        ]);

        let none_done = BTreeSet::new();
        let ready = ready_steps(&f, &none_done);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].step_id, "a");

        let a_done = BTreeSet::from(["a".to_string()]);
        let ready = ready_steps(&f, &a_done);
        let ids: Vec<&str> = ready.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn parallel_group_requires_disjoint_writes() {
        let a = step("a", &[], &["src"]);
        let b = step("b", &[], &["src"]);
        let c = step("c", &[], &["docs"]);
        let ready = vec![&a, &b, &c];

        let group = parallel_group(&ready);
        let ids: Vec<&str> = group.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn steps_without_declared_writes_run_solo() {
        let a = step("a", &[], &[]);
        let b = step("b", &[], &[]);
        let ready = vec![&a, &b];
        let group = parallel_group(&ready);
        assert_eq!(group.len(), 1);
        assert_eq!(group[0].step_id, "a");

        // A declared step after an undeclared head still waits its turn.
        let c = step("c", &[], &["src"]);
        let mixed = vec![&a, &c];
        assert_eq!(parallel_group(&mixed).len(), 1);
    }

    #[test]
    fn plan_view_lists_flows_in_run_order() {
        let registry = FlowRegistry::builtin();
        let view = registry
            .plan_view(&["signal".to_string(), "build".to_string()])
            .expect("plan");
        assert_eq!(view.flows.len(), 2);
        assert_eq!(view.flows[0].flow_key, "signal");
        let implement = view.flows[1]
            .steps
            .iter()
            .find(|s| s.step_id == "implement")
            .expect("step");
        assert!(implement.microloop);
        assert_eq!(implement.depends_on, vec!["author_tests".to_string()]);

        assert!(registry.plan_view(&["nope".to_string()]).is_err());
    }
}
