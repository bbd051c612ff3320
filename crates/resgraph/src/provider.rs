//! Provider interface
//!
//! Providers translate resource operations into calls against a real
//! platform. The engine never talks to a cloud directly; everything goes
//! through [`Provider`] implementations registered by name in a
//! [`ProviderRegistry`].

use crate::error::ProviderError;
use crate::spec::{Attributes, DEFAULT_PROVIDER};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Operations a provider must support
///
/// Implementations must be safe to call concurrently: nodes within a batch
/// are applied in parallel.
pub trait Provider: Send + Sync {
    /// Create a resource, returning its attributes
    fn create(
        &self,
        resource_type: &str,
        name: &str,
        inputs: &Attributes,
    ) -> Result<Attributes, ProviderError>;

    /// Update an existing resource towards `inputs`
    fn update(
        &self,
        resource_type: &str,
        name: &str,
        inputs: &Attributes,
        prior: &Attributes,
    ) -> Result<Attributes, ProviderError>;

    /// Delete a resource
    fn delete(&self, resource_type: &str, name: &str, prior: &Attributes)
    -> Result<(), ProviderError>;

    /// Whether an error is transient
    ///
    /// Default trusts the tag the provider put on the error.
    fn retryable(&self, error: &ProviderError) -> bool {
        error.retryable
    }
}

/// Providers by binding name
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a single provider bound as `default`
    pub fn with_default(provider: Arc<dyn Provider>) -> Self {
        let mut registry = Self::new();
        registry.register(DEFAULT_PROVIDER, provider);
        registry
    }

    /// Bind a provider to a name, replacing any previous binding
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Provider that records inputs as attributes without touching anything
///
/// Every resource gets a stable `id` derived from its type and name. Useful
/// for dry exercising a stack and as a stand-in during tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProvider;

impl NullProvider {
    fn stable_id(resource_type: &str, name: &str) -> String {
        let hash = blake3::hash(format!("{resource_type}::{name}").as_bytes());
        format!("{name}-{}", &hash.to_hex()[..8])
    }
}

impl Provider for NullProvider {
    fn create(
        &self,
        resource_type: &str,
        name: &str,
        inputs: &Attributes,
    ) -> Result<Attributes, ProviderError> {
        let mut attributes = inputs.clone();
        attributes.insert(
            "id".to_string(),
            Value::String(Self::stable_id(resource_type, name)),
        );
        Ok(attributes)
    }

    fn update(
        &self,
        resource_type: &str,
        name: &str,
        inputs: &Attributes,
        prior: &Attributes,
    ) -> Result<Attributes, ProviderError> {
        let mut attributes = inputs.clone();
        let id = prior
            .get("id")
            .cloned()
            .unwrap_or_else(|| Value::String(Self::stable_id(resource_type, name)));
        attributes.insert("id".to_string(), id);
        Ok(attributes)
    }

    fn delete(
        &self,
        _resource_type: &str,
        _name: &str,
        _prior: &Attributes,
    ) -> Result<(), ProviderError> {
        Ok(())
    }
}
