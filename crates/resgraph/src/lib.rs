//! # resgraph
//!
//! A declarative resource graph engine.
//!
//! Resources are declared against a [`GraphBuilder`]; references between
//! them become dependency edges. The [`planner`] diffs the graph against the
//! state recorded by the previous run, and the [`Applier`] converges the
//! difference through pluggable [`Provider`]s, batch by batch, in parallel
//! where dependencies allow.
//!
//! ## Core Concepts
//!
//! - **Output**: A single-assignment value that becomes known once its
//!   producing resource has been applied
//! - **Resource**: A [`ResourceSpec`] (type, name, inputs, provider binding)
//!   declared into the graph
//! - **Plan**: Create / update / unchanged / delete steps grouped into
//!   dependency batches
//! - **State**: What was actually applied, persisted by a [`StateStore`]
//!
//! ## Example
//!
//! ```no_run
//! use resgraph::{
//!     Applier, ApplyOptions, FileStateStore, GraphBuilder, NullProvider, ProviderRegistry,
//!     ResourceSpec, StateStore, plan,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> resgraph::Result<()> {
//! let mut builder = GraphBuilder::new();
//! let ns = builder.declare(
//!     ResourceSpec::new("kubernetes:core/v1:Namespace", "mlflow-namespace")
//!         .input("name", "mlflow"),
//! )?;
//! builder.declare(
//!     ResourceSpec::new("kubernetes:core/v1:ServiceAccount", "mlflow")
//!         .input("namespace", ns.attr::<String>("name")),
//! )?;
//! let graph = Arc::new(builder.build()?);
//!
//! let store = FileStateStore::for_stack(Path::new(".state"), "mlplatform");
//! let prior = store.load()?;
//! let plan = plan(graph, &prior);
//! println!("{plan}");
//!
//! let applier = Applier::new(
//!     ProviderRegistry::with_default(Arc::new(NullProvider)),
//!     ApplyOptions::default(),
//! );
//! let report = applier.apply(&plan)?;
//! store.save(&prior.reconcile(&report))?;
//! # Ok(())
//! # }
//! ```

pub mod applier;
pub mod components;
pub mod error;
pub mod graph;
pub mod output;
pub mod planner;
pub mod provider;
pub mod retry;
pub mod spec;
pub mod state;

// Re-export main types at crate root
pub use applier::{
    Applier, ApplyObserver, ApplyOptions, ApplyOutcome, ApplyReport, ApplySummary, CancelToken,
    NoObserver, NodeResult,
};
pub use error::{Error, ProviderError, Result, UpstreamFailure};
pub use graph::{Graph, GraphBuilder, NodeHandle, NodeState, ResourceNode};
pub use output::{Output, Ref};
pub use planner::{Action, AttributeChange, Plan, PlanSummary, Step, plan};
pub use provider::{NullProvider, Provider, ProviderRegistry};
pub use retry::{RetryConfig, with_retry};
pub use spec::{
    AttrRef, Attributes, ComponentId, DEFAULT_PROVIDER, Input, ResourceId, ResourceSpec,
    lookup_attribute, spec_hash,
};
pub use state::{FileStateStore, MemoryStateStore, ResourceRecord, StateSnapshot, StateStore};
