//! Execution planner - diffs the graph against prior state and orders it
//!
//! Nodes are grouped into batches by dependency depth: a node's batch is one
//! past the deepest of its dependencies, so everything in batch *k* only
//! needs outputs from batches before it and can be applied in parallel.
//! Within a batch, steps keep declaration order. Deletions of resources no
//! longer declared run last, dependents before their dependencies.

use crate::graph::Graph;
use crate::spec::{AttrRef, Attributes, ResourceId, spec_hash};
use crate::state::{ResourceRecord, StateSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// What the applier will do with a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// No prior state
    Create,
    /// Prior state exists but the spec changed (or may have)
    Update,
    /// Spec identical to what was last applied
    Unchanged,
    /// In prior state but no longer declared
    Delete,
}

impl Action {
    /// Terraform-style marker
    pub fn symbol(&self) -> &'static str {
        match self {
            Action::Create => "+",
            Action::Update => "~",
            Action::Unchanged => " ",
            Action::Delete => "-",
        }
    }

    pub fn is_change(&self) -> bool {
        !matches!(self, Action::Unchanged)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Unchanged => "unchanged",
            Action::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A change to one top-level input attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub attribute: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// One planned operation
#[derive(Debug, Clone)]
pub struct Step {
    pub id: ResourceId,
    pub action: Action,
    /// Index into the plan's graph; `None` for deletions
    pub node: Option<usize>,
    /// What was recorded for this resource on the last run
    pub prior: Option<ResourceRecord>,
    /// False when some input depends on a resource that changes in this run
    pub inputs_known: bool,
    /// Input changes against the prior record, when inputs are known
    pub changes: Vec<AttributeChange>,
    /// For deletions: removed resources that depended on this one
    pub dependents: Vec<String>,
}

/// Counts per action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub unchanged: usize,
    pub delete: usize,
}

impl PlanSummary {
    pub fn total_changes(&self) -> usize {
        self.create + self.update + self.delete
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.unchanged
        )
    }
}

/// Ordered, diffed set of steps
#[derive(Debug, Clone)]
pub struct Plan {
    pub(crate) graph: Arc<Graph>,
    pub(crate) batches: Vec<Vec<Step>>,
}

struct Unknown;

/// Compute the plan reconciling `graph` with `prior`
pub fn plan(graph: Arc<Graph>, prior: &StateSnapshot) -> Plan {
    let mut batches = plan_nodes(&graph, prior);
    batches.extend(plan_deletions(&graph, prior));

    let plan = Plan { graph, batches };
    log::debug!("planned {} steps: {}", plan.len(), plan.summary());
    plan
}

fn plan_nodes(graph: &Graph, prior: &StateSnapshot) -> Vec<Vec<Step>> {
    if graph.is_empty() {
        return Vec::new();
    }

    let mut levels = vec![0usize; graph.len()];
    // Attributes of nodes that will not change, usable to resolve inputs now
    let mut known: HashMap<usize, &Attributes> = HashMap::new();
    let mut steps: Vec<Option<Step>> = vec![None; graph.len()];

    for &idx in graph.topological_order() {
        levels[idx] = graph
            .dependencies(idx)
            .iter()
            .map(|&dep| levels[dep] + 1)
            .max()
            .unwrap_or(0);

        let spec = graph.node(idx).spec();
        let record = prior.get(&spec.id);
        let resolved = spec.resolve_inputs(&mut |r: &AttrRef| {
            graph
                .index_of(&r.source)
                .and_then(|src| known.get(&src))
                .and_then(|attrs| r.lookup(attrs))
                .cloned()
                .ok_or(Unknown)
        });

        let (action, inputs_known, changes) = match (record, resolved) {
            (None, Ok(inputs)) => (
                Action::Create,
                true,
                diff_attributes(&Attributes::new(), &inputs),
            ),
            (None, Err(Unknown)) => (Action::Create, false, Vec::new()),
            (Some(record), Ok(inputs)) => {
                if spec_hash(&spec.provider, &inputs) == record.spec_hash {
                    known.insert(idx, &record.attributes);
                    (Action::Unchanged, true, Vec::new())
                } else {
                    (
                        Action::Update,
                        true,
                        diff_attributes(&record.inputs, &inputs),
                    )
                }
            }
            (Some(_), Err(Unknown)) => (Action::Update, false, Vec::new()),
        };

        steps[idx] = Some(Step {
            id: spec.id.clone(),
            action,
            node: Some(idx),
            prior: record.cloned(),
            inputs_known,
            changes,
            dependents: Vec::new(),
        });
    }

    let depth = levels.iter().max().map_or(0, |max| max + 1);
    let mut batches: Vec<Vec<Step>> = vec![Vec::new(); depth];
    // Declaration order within a batch
    for (idx, step) in steps.into_iter().enumerate() {
        if let Some(step) = step {
            batches[levels[idx]].push(step);
        }
    }
    batches
}

fn plan_deletions(graph: &Graph, prior: &StateSnapshot) -> Vec<Vec<Step>> {
    let orphans: Vec<&ResourceRecord> = prior
        .resources
        .values()
        .filter(|record| !graph.contains(&record.id()))
        .collect();
    if orphans.is_empty() {
        return Vec::new();
    }

    let position: HashMap<String, usize> = orphans
        .iter()
        .enumerate()
        .map(|(i, record)| (record.id().key(), i))
        .collect();

    // dependents[i]: orphans that depended on orphan i
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); orphans.len()];
    for (i, record) in orphans.iter().enumerate() {
        for dep in &record.dependencies {
            if let Some(&j) = position.get(dep)
                && j != i
            {
                dependents[j].push(i);
            }
        }
    }

    let levels = deletion_levels(&dependents);

    let depth = levels.iter().max().map_or(0, |max| max + 1);
    let mut batches: Vec<Vec<Step>> = vec![Vec::new(); depth];
    for (i, record) in orphans.iter().enumerate() {
        batches[levels[i]].push(Step {
            id: record.id(),
            action: Action::Delete,
            node: None,
            prior: Some((*record).clone()),
            inputs_known: true,
            changes: Vec::new(),
            dependents: dependents[i]
                .iter()
                .map(|&j| orphans[j].id().key())
                .collect(),
        });
    }
    // A cycle in old state can leave a level empty
    batches.retain(|batch| !batch.is_empty());
    batches
}

/// Dependents are deleted first, so a resource goes one batch after the
/// latest of its dependents. State written by older runs may hold a cycle;
/// an edge back into the current path counts as a leaf.
fn deletion_levels(dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut memo: Vec<Option<usize>> = vec![None; dependents.len()];
    let mut visiting = vec![false; dependents.len()];
    // (resource, next dependent to look at, level so far)
    let mut stack: Vec<(usize, usize, usize)> = Vec::new();

    for root in 0..dependents.len() {
        if memo[root].is_some() {
            continue;
        }
        visiting[root] = true;
        stack.push((root, 0, 0));

        while let Some(frame) = stack.last_mut() {
            let (i, next) = (frame.0, frame.1);
            if let Some(&j) = dependents[i].get(next) {
                frame.1 += 1;
                if let Some(done) = memo[j] {
                    frame.2 = frame.2.max(done + 1);
                } else if visiting[j] {
                    frame.2 = frame.2.max(1);
                } else {
                    visiting[j] = true;
                    stack.push((j, 0, 0));
                }
                continue;
            }

            let level = frame.2;
            stack.pop();
            visiting[i] = false;
            memo[i] = Some(level);
            if let Some(parent) = stack.last_mut() {
                parent.2 = parent.2.max(level + 1);
            }
        }
    }
    memo.into_iter().map(Option::unwrap_or_default).collect()
}

fn diff_attributes(before: &Attributes, after: &Attributes) -> Vec<AttributeChange> {
    let mut changes = Vec::new();
    for (attribute, value) in after {
        let old = before.get(attribute);
        if old != Some(value) {
            changes.push(AttributeChange {
                attribute: attribute.clone(),
                before: old.cloned(),
                after: Some(value.clone()),
            });
        }
    }
    for (attribute, value) in before {
        if !after.contains_key(attribute) {
            changes.push(AttributeChange {
                attribute: attribute.clone(),
                before: Some(value.clone()),
                after: None,
            });
        }
    }
    changes
}

impl Plan {
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Batches in apply order
    pub fn batches(&self) -> &[Vec<Step>] {
        &self.batches
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.batches.iter().flatten()
    }

    pub fn step(&self, id: &ResourceId) -> Option<&Step> {
        self.steps().find(|step| &step.id == id)
    }

    /// Batch index holding `id`
    pub fn batch_of(&self, id: &ResourceId) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|step| &step.id == id))
    }

    pub fn len(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for step in self.steps() {
            match step.action {
                Action::Create => summary.create += 1,
                Action::Update => summary.update += 1,
                Action::Unchanged => summary.unchanged += 1,
                Action::Delete => summary.delete += 1,
            }
        }
        summary
    }

    pub fn has_changes(&self) -> bool {
        self.summary().total_changes() > 0
    }

    /// Restrict the plan to resources matching a target pattern
    ///
    /// Target format: `type` or `type::name`. Matching resources keep
    /// everything they depend on so their inputs can still be resolved.
    /// Matching deletions keep every removed resource that depends on them,
    /// since those go first.
    pub fn filter_by_target(self, target: Option<&str>) -> Self {
        let Some(target) = target else {
            return self;
        };

        let matched: Vec<usize> = self
            .graph
            .nodes()
            .iter()
            .enumerate()
            .filter(|(_, node)| matches_target(node.id(), target))
            .map(|(idx, _)| idx)
            .collect();
        let mut keep = vec![false; self.graph.len()];
        for idx in self.graph.with_dependencies(&matched) {
            keep[idx] = true;
        }
        let doomed = deletions_with_dependents(&self.batches, target);

        let batches = self
            .batches
            .into_iter()
            .map(|batch| {
                batch
                    .into_iter()
                    .filter(|step| match step.node {
                        Some(idx) => keep[idx],
                        None => doomed.contains(&step.id.key()),
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|batch| !batch.is_empty())
            .collect();

        Self {
            graph: self.graph,
            batches,
        }
    }
}

/// Keys of deletions matching `target` and, transitively, of the removed
/// resources that depend on them
fn deletions_with_dependents(batches: &[Vec<Step>], target: &str) -> HashSet<String> {
    let deletions: Vec<&Step> = batches
        .iter()
        .flatten()
        .filter(|step| step.node.is_none())
        .collect();
    let dependents: HashMap<String, &[String]> = deletions
        .iter()
        .map(|step| (step.id.key(), step.dependents.as_slice()))
        .collect();

    let mut doomed = HashSet::new();
    let mut pending: Vec<String> = deletions
        .iter()
        .filter(|step| matches_target(&step.id, target))
        .map(|step| step.id.key())
        .collect();
    while let Some(key) = pending.pop() {
        if doomed.contains(&key) {
            continue;
        }
        if let Some(keys) = dependents.get(&key) {
            pending.extend(keys.iter().cloned());
        }
        doomed.insert(key);
    }
    doomed
}

fn matches_target(id: &ResourceId, target: &str) -> bool {
    if target.contains("::") {
        id.key() == target
    } else {
        id.resource_type == target || id.name == target
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, batch) in self.batches.iter().enumerate() {
            writeln!(f, "batch {index}:")?;
            for step in batch {
                write!(f, "  {} {}", step.action.symbol(), step.id)?;
                if step.action == Action::Update && !step.inputs_known {
                    write!(f, " (inputs known after apply)")?;
                }
                writeln!(f)?;
                if step.action == Action::Update {
                    for change in &step.changes {
                        writeln!(
                            f,
                            "      {}: {} -> {}",
                            change.attribute,
                            render(change.before.as_ref()),
                            render(change.after.as_ref())
                        )?;
                    }
                }
            }
        }
        write!(f, "Plan: {}", self.summary())
    }
}

fn render(value: Option<&Value>) -> String {
    value.map_or_else(|| "(none)".to_string(), ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::spec::ResourceSpec;
    use chrono::Utc;
    use serde_json::json;

    const NS: &str = "kubernetes:core/v1:Namespace";
    const SA: &str = "kubernetes:core/v1:ServiceAccount";

    fn namespace_graph() -> Arc<Graph> {
        let mut builder = GraphBuilder::new();
        let ns = builder
            .declare(ResourceSpec::new(NS, "ns").input("name", "mlflow"))
            .unwrap();
        builder
            .declare(ResourceSpec::new(SA, "sa").input("namespace", ns.attr::<String>("name")))
            .unwrap();
        Arc::new(builder.build().unwrap())
    }

    fn record(id: &ResourceId, inputs: Attributes, attributes: Attributes) -> ResourceRecord {
        ResourceRecord {
            resource_type: id.resource_type.clone(),
            name: id.name.clone(),
            provider: "default".into(),
            spec_hash: spec_hash("default", &inputs),
            inputs,
            attributes,
            dependencies: Vec::new(),
            parent: None,
            last_applied: Utc::now(),
        }
    }

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn insert(snapshot: &mut StateSnapshot, record: ResourceRecord) {
        snapshot.resources.insert(record.id().key(), record);
    }

    #[test]
    fn test_first_run_creates_in_dependency_batches() {
        let plan = plan(namespace_graph(), &StateSnapshot::new());

        assert_eq!(plan.batches().len(), 2);
        assert_eq!(plan.batch_of(&ResourceId::new(NS, "ns")), Some(0));
        assert_eq!(plan.batch_of(&ResourceId::new(SA, "sa")), Some(1));
        assert!(plan.steps().all(|s| s.action == Action::Create));

        let ns = plan.step(&ResourceId::new(NS, "ns")).unwrap();
        assert!(ns.inputs_known);
        let sa = plan.step(&ResourceId::new(SA, "sa")).unwrap();
        assert!(!sa.inputs_known);
    }

    #[test]
    fn test_unchanged_resolves_downstream_from_prior_attributes() {
        let ns_id = ResourceId::new(NS, "ns");
        let sa_id = ResourceId::new(SA, "sa");
        let mut prior = StateSnapshot::new();
        insert(
            &mut prior,
            record(
                &ns_id,
                attrs(&[("name", json!("mlflow"))]),
                attrs(&[("name", json!("mlflow")), ("id", json!("ns-1"))]),
            ),
        );
        insert(
            &mut prior,
            record(
                &sa_id,
                attrs(&[("namespace", json!("mlflow"))]),
                attrs(&[("namespace", json!("mlflow"))]),
            ),
        );

        let plan = plan(namespace_graph(), &prior);
        assert_eq!(plan.step(&ns_id).unwrap().action, Action::Unchanged);
        assert_eq!(plan.step(&sa_id).unwrap().action, Action::Unchanged);
        assert!(!plan.has_changes());
    }

    #[test]
    fn test_changed_input_is_update_and_downstream_unknown() {
        let ns_id = ResourceId::new(NS, "ns");
        let sa_id = ResourceId::new(SA, "sa");
        let mut prior = StateSnapshot::new();
        insert(
            &mut prior,
            record(
                &ns_id,
                attrs(&[("name", json!("old"))]),
                attrs(&[("name", json!("old"))]),
            ),
        );
        insert(
            &mut prior,
            record(
                &sa_id,
                attrs(&[("namespace", json!("old"))]),
                Attributes::new(),
            ),
        );

        let plan = plan(namespace_graph(), &prior);
        let ns = plan.step(&ns_id).unwrap();
        assert_eq!(ns.action, Action::Update);
        assert_eq!(
            ns.changes,
            vec![AttributeChange {
                attribute: "name".into(),
                before: Some(json!("old")),
                after: Some(json!("mlflow")),
            }]
        );

        let sa = plan.step(&sa_id).unwrap();
        assert_eq!(sa.action, Action::Update);
        assert!(!sa.inputs_known);
    }

    #[test]
    fn test_deletions_run_last_dependents_first() {
        let mut prior = StateSnapshot::new();
        let role = ResourceId::new("aws:iam/role:Role", "old-role");
        let attachment = ResourceId::new(
            "aws:iam/rolePolicyAttachment:RolePolicyAttachment",
            "old-role",
        );
        insert(&mut prior, record(&role, Attributes::new(), Attributes::new()));
        let mut attachment_record = record(&attachment, Attributes::new(), Attributes::new());
        attachment_record.dependencies = vec![role.key()];
        insert(&mut prior, attachment_record);

        let plan = plan(namespace_graph(), &prior);
        assert_eq!(plan.batches().len(), 4);
        assert_eq!(plan.batch_of(&attachment), Some(2));
        assert_eq!(plan.batch_of(&role), Some(3));
        assert_eq!(
            plan.step(&role).unwrap().dependents,
            vec![attachment.key()]
        );
        assert_eq!(plan.summary().delete, 2);
    }

    #[test]
    fn test_long_deletion_chain() {
        const LINKS: usize = 20_000;
        let link = |i: usize| ResourceId::new("t", format!("link-{i:05}"));
        let mut prior = StateSnapshot::new();
        for i in 0..LINKS {
            let mut rec = record(&link(i), Attributes::new(), Attributes::new());
            if i > 0 {
                rec.dependencies = vec![link(i - 1).key()];
            }
            insert(&mut prior, rec);
        }

        let empty = Arc::new(GraphBuilder::new().build().unwrap());
        let plan = plan(empty, &prior);
        assert_eq!(plan.batches().len(), LINKS);
        assert_eq!(plan.batches()[0][0].id, link(LINKS - 1));
        assert_eq!(plan.batches()[LINKS - 1][0].id, link(0));
    }

    #[test]
    fn test_deletion_cycle_in_old_state_still_plans() {
        let a = ResourceId::new("t", "a");
        let b = ResourceId::new("t", "b");
        let mut prior = StateSnapshot::new();
        let mut rec_a = record(&a, Attributes::new(), Attributes::new());
        rec_a.dependencies = vec![b.key()];
        let mut rec_b = record(&b, Attributes::new(), Attributes::new());
        rec_b.dependencies = vec![a.key()];
        insert(&mut prior, rec_a);
        insert(&mut prior, rec_b);

        let empty = Arc::new(GraphBuilder::new().build().unwrap());
        let plan = plan(empty, &prior);
        assert_eq!(plan.summary().delete, 2);
        assert_eq!(plan.batch_of(&b), Some(0));
        assert_eq!(plan.batch_of(&a), Some(1));
    }

    #[test]
    fn test_every_node_gets_exactly_one_step() {
        let mut builder = GraphBuilder::new();
        let a = builder.declare(ResourceSpec::new("t", "a")).unwrap();
        let b = builder
            .declare(ResourceSpec::new("t", "b").input("a", a.attr::<String>("id")))
            .unwrap();
        builder
            .declare(ResourceSpec::new("t", "c").input("a", a.attr::<String>("id")))
            .unwrap();
        builder
            .declare(
                ResourceSpec::new("t", "d")
                    .input("b", b.attr::<String>("id"))
                    .depends_on(ResourceId::new("t", "c")),
            )
            .unwrap();
        builder.declare(ResourceSpec::new("t", "e")).unwrap();
        let graph = Arc::new(builder.build().unwrap());

        let plan = plan(graph, &StateSnapshot::new());
        assert_eq!(plan.len(), 5);
        let names: Vec<Vec<&str>> = plan
            .batches()
            .iter()
            .map(|b| b.iter().map(|s| s.id.name.as_str()).collect())
            .collect();
        assert_eq!(names, vec![vec!["a", "e"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let first = plan(namespace_graph(), &StateSnapshot::new());
        let second = plan(namespace_graph(), &StateSnapshot::new());
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn test_filter_by_target_keeps_dependencies() {
        let plan = plan(namespace_graph(), &StateSnapshot::new());
        let filtered = plan.clone().filter_by_target(Some(format!("{SA}::sa").as_str()));
        assert_eq!(filtered.len(), 2);

        let only_ns = plan.clone().filter_by_target(Some(NS));
        assert_eq!(only_ns.len(), 1);
        assert_eq!(only_ns.batches().len(), 1);

        assert_eq!(plan.clone().filter_by_target(None).len(), 2);
    }

    #[test]
    fn test_targeted_deletion_takes_its_dependents() {
        let mut prior = StateSnapshot::new();
        let role = ResourceId::new("aws:iam/role:Role", "r");
        let attachment =
            ResourceId::new("aws:iam/rolePolicyAttachment:RolePolicyAttachment", "att");
        let policy = ResourceId::new("aws:iam/policy:Policy", "p");
        insert(&mut prior, record(&role, Attributes::new(), Attributes::new()));
        insert(&mut prior, record(&policy, Attributes::new(), Attributes::new()));
        let mut attachment_record = record(&attachment, Attributes::new(), Attributes::new());
        attachment_record.dependencies = vec![role.key()];
        insert(&mut prior, attachment_record);

        let empty = Arc::new(GraphBuilder::new().build().unwrap());
        let targeted = plan(empty, &prior).filter_by_target(Some("aws:iam/role:Role"));

        assert_eq!(targeted.len(), 2);
        assert!(targeted.step(&policy).is_none());
        assert!(targeted.batch_of(&attachment).unwrap() < targeted.batch_of(&role).unwrap());
    }

    #[test]
    fn test_display() {
        let plan = plan(namespace_graph(), &StateSnapshot::new());
        let text = plan.to_string();
        assert!(text.contains("  + kubernetes:core/v1:Namespace::ns"));
        assert!(text.ends_with("Plan: 2 to create, 0 to update, 0 to delete, 0 unchanged"));
    }
}
