//! Error types for graph construction, apply and state persistence.
//!
//! Graph construction errors (duplicates, cycles, dangling references) abort a
//! run before anything is applied. Apply-time errors are reported per node in
//! an [`ApplyReport`](crate::ApplyReport) instead of surfacing as a single
//! error. State corruption is always fatal.

use crate::spec::ResourceId;
use thiserror::Error;

/// A producing resource failed, so the values it would have produced never
/// will be.
///
/// This is what every transitively dependent output settles to, carrying the
/// resource where the failure originated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("upstream {resource} failed: {reason}")]
pub struct UpstreamFailure {
    /// The resource whose failure caused this one
    pub resource: ResourceId,
    /// Human-readable cause
    pub reason: String,
}

impl UpstreamFailure {
    /// Create a failure rooted at `resource`.
    pub fn new(resource: ResourceId, reason: impl Into<String>) -> Self {
        Self {
            resource,
            reason: reason.into(),
        }
    }
}

/// Error returned by a provider operation.
///
/// Providers tag transient failures (throttling, timeouts, eventual
/// consistency) as retryable; the applier retries those with backoff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProviderError {
    /// Error message from the provider
    pub message: String,
    /// Whether the operation is worth retrying
    pub retryable: bool,
}

impl ProviderError {
    /// A transient error that should be retried.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A terminal error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Errors produced by the resource graph engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A resource with the same (type, name) was already declared
    #[error("duplicate resource: {id}")]
    DuplicateResource {
        /// The colliding identifier
        id: ResourceId,
    },

    /// The dependency graph contains a cycle
    #[error("dependency cycle: {}", format_cycle(path))]
    Cycle {
        /// The back-edge path, first and last element are the same resource
        path: Vec<ResourceId>,
    },

    /// A resource references something that was never declared
    #[error("{from} depends on undeclared resource {to}")]
    UnknownDependency {
        /// The dependent resource
        from: ResourceId,
        /// The missing dependency
        to: ResourceId,
    },

    /// A resource identifier string could not be parsed
    #[error("invalid resource id '{0}', expected 'type::name'")]
    InvalidResourceId(String),

    /// An output was settled twice
    #[error("output already resolved")]
    AlreadyResolved,

    /// A value could not be produced because its producer failed
    #[error(transparent)]
    UpstreamFailure(#[from] UpstreamFailure),

    /// A provider operation failed
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// No provider is registered for a resource's binding
    #[error("no provider registered as '{binding}' (needed by {id})")]
    ProviderNotFound {
        /// Provider binding name
        binding: String,
        /// Resource that needed it
        id: ResourceId,
    },

    /// A referenced attribute was not produced by its resource
    #[error("{id} did not produce attribute '{attribute}'")]
    MissingAttribute {
        /// Producing resource
        id: ResourceId,
        /// Attribute path that was requested
        attribute: String,
    },

    /// An attribute could not be converted to the requested type
    #[error("attribute '{attribute}' of {id} has an unexpected shape: {source}")]
    Deserialize {
        /// Producing resource
        id: ResourceId,
        /// Attribute path that was requested
        attribute: String,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },

    /// The state document could not be read back
    #[error("state file {path} is corrupted: {message}")]
    StateCorruption {
        /// Location of the state document
        path: String,
        /// What was wrong with it
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Provider(e) if e.retryable)
    }

    /// Whether this error was caused by a failure further up the graph.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Error::UpstreamFailure(_))
    }
}

fn format_cycle(path: &[ResourceId]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Result type for resource graph operations.
pub type Result<T> = std::result::Result<T, Error>;
