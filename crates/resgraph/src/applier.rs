//! Execution engine - applies a plan batch by batch with bounded parallelism
//!
//! Batches run one after another. Inside a batch, steps run on a rayon pool
//! sized by [`ApplyOptions::parallelism`]. Every node settles its output
//! exactly once: resolved with the provider's attributes, or failed so that
//! dependents fail with an upstream error instead of waiting forever.

use crate::error::{Error, ProviderError, UpstreamFailure};
use crate::graph::{Graph, NodeState, ResourceNode};
use crate::planner::{Action, Plan, Step};
use crate::provider::ProviderRegistry;
use crate::retry::{RetryConfig, with_retry};
use crate::spec::{AttrRef, Attributes, ComponentId, ResourceId, spec_hash};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Options for one apply run
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Maximum number of provider calls in flight
    pub parallelism: usize,
    /// Stop starting new batches after the first failure
    pub fail_fast: bool,
    pub retry: RetryConfig,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            parallelism: 4,
            fail_fast: false,
            retry: RetryConfig::default(),
        }
    }
}

/// Shared flag asking a running apply to stop
///
/// Steps already talking to a provider finish; nothing new starts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a single step ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Created,
    Updated,
    /// Spec matched the prior record, provider not called
    Unchanged,
    Deleted,
    Failed { error: String },
    /// Never started
    Skipped { reason: String },
}

impl ApplyOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Check if the outcome represents a change
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted)
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Updated => f.write_str("updated"),
            Self::Unchanged => f.write_str("unchanged"),
            Self::Deleted => f.write_str("deleted"),
            Self::Failed { error } => write!(f, "failed: {error}"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

/// Everything known about one step after it ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub id: ResourceId,
    /// What the plan asked for
    pub action: Action,
    pub outcome: ApplyOutcome,
    /// Resolved inputs, when resolution got that far
    pub inputs: Option<Attributes>,
    /// Attributes the resource now has
    pub attributes: Option<Attributes>,
    pub spec_hash: Option<String>,
    pub provider: String,
    /// State keys of this resource's dependencies
    pub dependencies: Vec<String>,
    pub parent: Option<ComponentId>,
    /// Provider calls made, retries included
    pub attempts: u32,
}

/// Counts per outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ApplySummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn add_outcome(&mut self, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Created => self.created += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::Unchanged => self.unchanged += 1,
            ApplyOutcome::Deleted => self.deleted += 1,
            ApplyOutcome::Failed { .. } => self.failed += 1,
            ApplyOutcome::Skipped { .. } => self.skipped += 1,
        }
    }
}

impl fmt::Display for ApplySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} deleted, {} unchanged, {} failed, {} skipped",
            self.created, self.updated, self.deleted, self.unchanged, self.failed, self.skipped
        )
    }
}

/// Per-step results of a run, in plan order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    results: Vec<NodeResult>,
}

impl ApplyReport {
    pub fn new(results: Vec<NodeResult>) -> Self {
        Self { results }
    }

    pub fn results(&self) -> &[NodeResult] {
        &self.results
    }

    pub fn get(&self, id: &ResourceId) -> Option<&NodeResult> {
        self.results.iter().find(|r| &r.id == id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &NodeResult> {
        self.results.iter().filter(|r| r.outcome.is_failure())
    }

    pub fn summary(&self) -> ApplySummary {
        let mut summary = ApplySummary::default();
        for result in &self.results {
            summary.add_outcome(&result.outcome);
        }
        summary
    }

    pub fn is_success(&self) -> bool {
        self.summary().is_success()
    }
}

/// Receives progress while a plan is applied
///
/// Completion events for a batch are delivered once the whole batch is done,
/// in plan order.
pub trait ApplyObserver: Send {
    fn on_batch_start(&mut self, index: usize, steps: &[Step]);

    fn on_node_complete(&mut self, result: &NodeResult);

    fn on_batch_complete(&mut self, index: usize);
}

/// No-op observer
pub struct NoObserver;

impl ApplyObserver for NoObserver {
    fn on_batch_start(&mut self, _index: usize, _steps: &[Step]) {}
    fn on_node_complete(&mut self, _result: &NodeResult) {}
    fn on_batch_complete(&mut self, _index: usize) {}
}

/// Drives providers through a plan
#[derive(Debug, Clone)]
pub struct Applier {
    providers: ProviderRegistry,
    options: ApplyOptions,
}

impl Applier {
    pub fn new(providers: ProviderRegistry, options: ApplyOptions) -> Self {
        Self { providers, options }
    }

    pub fn options(&self) -> &ApplyOptions {
        &self.options
    }

    /// Apply every step of `plan`
    ///
    /// Per-resource failures are recorded in the report; the `Err` case is
    /// reserved for failing to set up the worker pool.
    pub fn apply(&self, plan: &Plan) -> Result<ApplyReport, Error> {
        self.apply_with(plan, &CancelToken::new(), &mut NoObserver)
    }

    pub fn apply_with<O: ApplyObserver>(
        &self,
        plan: &Plan,
        cancel: &CancelToken,
        observer: &mut O,
    ) -> Result<ApplyReport, Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.parallelism.max(1))
            .build()
            .map_err(|e| Error::Other(format!("Failed to create thread pool: {e}")))?;

        let graph = plan.graph();
        let mut results = Vec::with_capacity(plan.len());
        // Keys removed by this run; a delete waits for all of its dependents
        let mut deleted: HashSet<String> = HashSet::new();
        let mut halted: Option<String> = None;

        for (index, batch) in plan.batches().iter().enumerate() {
            if halted.is_none() && cancel.is_cancelled() {
                log::warn!("apply cancelled before batch {index}");
                halted = Some("cancelled".to_string());
            }

            observer.on_batch_start(index, batch);
            let batch_results: Vec<NodeResult> = match &halted {
                Some(reason) => batch
                    .iter()
                    .map(|step| skip(graph, step, reason))
                    .collect(),
                None => pool.install(|| {
                    batch
                        .par_iter()
                        .map(|step| self.run_step(graph, step, cancel, &deleted))
                        .collect()
                }),
            };

            for result in &batch_results {
                observer.on_node_complete(result);
                if result.outcome == ApplyOutcome::Deleted {
                    deleted.insert(result.id.key());
                }
            }
            observer.on_batch_complete(index);

            if self.options.fail_fast
                && halted.is_none()
                && batch_results.iter().any(|r| r.outcome.is_failure())
            {
                log::warn!("batch {index} had failures, skipping the remaining batches");
                halted = Some("an earlier batch failed".to_string());
            }
            results.extend(batch_results);
        }

        let report = ApplyReport::new(results);
        log::info!("apply finished: {}", report.summary());
        Ok(report)
    }

    fn run_step(
        &self,
        graph: &Graph,
        step: &Step,
        cancel: &CancelToken,
        deleted: &HashSet<String>,
    ) -> NodeResult {
        if cancel.is_cancelled() {
            return skip(graph, step, "cancelled");
        }
        match step.node {
            Some(idx) => self.apply_node(graph, idx, step),
            None => self.delete(step, deleted),
        }
    }

    fn apply_node(&self, graph: &Graph, idx: usize, step: &Step) -> NodeResult {
        let node = graph.node(idx);
        let spec = node.spec();
        let mut result = base_result(graph, step);
        node.set_state(NodeState::Resolving);

        let inputs =
            match spec.resolve_inputs(&mut |r: &AttrRef| resolve_reference(graph, r)) {
                Ok(inputs) => inputs,
                Err(e) => return fail(node, result, &e),
            };
        let hash = spec_hash(&spec.provider, &inputs);
        result.inputs = Some(inputs.clone());
        result.spec_hash = Some(hash.clone());

        if let Some(prior) = &step.prior
            && prior.spec_hash == hash
        {
            log::debug!("{} unchanged", spec.id);
            settle(node, prior.attributes.clone());
            result.attributes = Some(prior.attributes.clone());
            result.outcome = ApplyOutcome::Unchanged;
            return result;
        }

        let Some(provider) = self.providers.get(&spec.provider) else {
            let error = Error::ProviderNotFound {
                binding: spec.provider.clone(),
                id: spec.id.clone(),
            };
            return fail(node, result, &error);
        };

        let id = &spec.id;
        let mut attempts = 0;
        let applied = with_retry(
            &self.options.retry,
            |e: &ProviderError| provider.retryable(e),
            || {
                attempts += 1;
                match &step.prior {
                    Some(prior) => provider.update(
                        &id.resource_type,
                        &id.name,
                        &inputs,
                        &prior.attributes,
                    ),
                    None => provider.create(&id.resource_type, &id.name, &inputs),
                }
            },
        );
        result.attempts = attempts;

        match applied {
            Ok(attributes) => {
                result.outcome = if step.prior.is_some() {
                    ApplyOutcome::Updated
                } else {
                    ApplyOutcome::Created
                };
                log::debug!("{id} {}", result.outcome);
                settle(node, attributes.clone());
                result.attributes = Some(attributes);
                result
            }
            Err(e) => fail(node, result, &Error::Provider(e)),
        }
    }

    /// Remove a resource once every recorded dependent is gone
    ///
    /// A dependent that is not part of this plan (a targeted run) or that
    /// failed to delete keeps this resource alive.
    fn delete(&self, step: &Step, deleted: &HashSet<String>) -> NodeResult {
        let mut result = base_result_for_removed(step);

        if let Some(blocker) = step.dependents.iter().find(|key| !deleted.contains(*key)) {
            result.outcome = ApplyOutcome::Skipped {
                reason: format!("dependent {blocker} was not deleted"),
            };
            return result;
        }
        let Some(prior) = &step.prior else {
            result.outcome = ApplyOutcome::Deleted;
            return result;
        };
        let Some(provider) = self.providers.get(&prior.provider) else {
            let error = Error::ProviderNotFound {
                binding: prior.provider.clone(),
                id: step.id.clone(),
            };
            log::error!("{error}");
            result.outcome = ApplyOutcome::Failed {
                error: error.to_string(),
            };
            return result;
        };

        let mut attempts = 0;
        let deleted = with_retry(
            &self.options.retry,
            |e: &ProviderError| provider.retryable(e),
            || {
                attempts += 1;
                provider.delete(&step.id.resource_type, &step.id.name, &prior.attributes)
            },
        );
        result.attempts = attempts;

        result.outcome = match deleted {
            Ok(()) => {
                log::debug!("{} deleted", step.id);
                ApplyOutcome::Deleted
            }
            Err(e) => {
                log::error!("failed to delete {}: {e}", step.id);
                ApplyOutcome::Failed {
                    error: Error::Provider(e).to_string(),
                }
            }
        };
        result
    }
}

/// Value of a reference, waiting on the producing node's output
fn resolve_reference(graph: &Graph, r: &AttrRef) -> Result<Value, Error> {
    let source = graph
        .get(&r.source)
        .ok_or_else(|| Error::Other(format!("{} is not part of this graph", r.source)))?;
    let attributes = source.output().get()?;
    r.lookup(&attributes)
        .cloned()
        .ok_or_else(|| Error::MissingAttribute {
            id: r.source.clone(),
            attribute: r.attribute.clone(),
        })
}

fn base_result(graph: &Graph, step: &Step) -> NodeResult {
    let Some(idx) = step.node else {
        return base_result_for_removed(step);
    };
    let spec = graph.node(idx).spec();
    NodeResult {
        id: step.id.clone(),
        action: step.action,
        outcome: ApplyOutcome::Unchanged,
        inputs: None,
        attributes: None,
        spec_hash: None,
        provider: spec.provider.clone(),
        dependencies: graph
            .dependencies(idx)
            .iter()
            .map(|&dep| graph.node(dep).id().key())
            .collect(),
        parent: spec.parent.clone(),
        attempts: 0,
    }
}

fn base_result_for_removed(step: &Step) -> NodeResult {
    let prior = step.prior.as_ref();
    NodeResult {
        id: step.id.clone(),
        action: step.action,
        outcome: ApplyOutcome::Deleted,
        inputs: None,
        attributes: None,
        spec_hash: None,
        provider: prior.map(|p| p.provider.clone()).unwrap_or_default(),
        dependencies: prior.map(|p| p.dependencies.clone()).unwrap_or_default(),
        parent: prior.and_then(|p| p.parent.clone()),
        attempts: 0,
    }
}

fn settle(node: &ResourceNode, attributes: Attributes) {
    if let Err(e) = node.output().resolve(attributes) {
        log::warn!("{}: {e}", node.id());
    }
    node.set_state(NodeState::Resolved);
}

fn fail(node: &ResourceNode, mut result: NodeResult, error: &Error) -> NodeResult {
    let failure = match error {
        Error::UpstreamFailure(failure) => {
            log::warn!("{}: {failure}", node.id());
            failure.clone()
        }
        other => {
            log::error!("{} failed: {other}", node.id());
            UpstreamFailure::new(node.id().clone(), other.to_string())
        }
    };
    if let Err(e) = node.output().fail(failure) {
        log::warn!("{}: {e}", node.id());
    }
    node.set_state(NodeState::Failed);
    result.outcome = ApplyOutcome::Failed {
        error: error.to_string(),
    };
    result
}

fn skip(graph: &Graph, step: &Step, reason: &str) -> NodeResult {
    let mut result = base_result(graph, step);
    if let Some(idx) = step.node {
        let node = graph.node(idx);
        let failure = UpstreamFailure::new(node.id().clone(), format!("skipped ({reason})"));
        if let Err(e) = node.output().fail(failure) {
            log::warn!("{}: {e}", node.id());
        }
        node.set_state(NodeState::Skipped);
    }
    result.outcome = ApplyOutcome::Skipped {
        reason: reason.to_string(),
    };
    result
}
