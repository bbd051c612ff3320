//! Stack file loading
//!
//! A stack file declares the resources of one stack and the providers that
//! manage them. TOML and JSON are supported, picked by file extension:
//!
//! ```toml
//! stack = "mlplatform"
//!
//! [providers.aws]
//! command = "strata-aws"
//!
//! [[resource]]
//! type = "aws:s3/bucket:Bucket"
//! name = "mlflow-bucket"
//! provider = "aws"
//! inputs = { acl = "private" }
//!
//! [[resource]]
//! type = "kubernetes:core/v1:ConfigMap"
//! name = "mlflow"
//! inputs.data.bucket = { from = "aws:s3/bucket:Bucket::mlflow-bucket", attribute = "bucket" }
//! ```
//!
//! A table holding exactly `from` and `attribute` is a reference to another
//! resource's attribute; everything else is a literal.

use crate::runner::ProcessProvider;
use anyhow::{Context, Result, bail};
use resgraph::{
    AttrRef, DEFAULT_PROVIDER, GraphBuilder, Input, NullProvider, ProviderRegistry, ResourceId,
    ResourceSpec,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Binding name of the built-in provider that only records inputs
pub const NULL_PROVIDER: &str = "null";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackFormat {
    Toml,
    Json,
}

impl StackFormat {
    /// Detect format from file extension, TOML unless it ends in `.json`
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::Json,
            _ => Self::Toml,
        }
    }
}

/// External provider executable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// `type::name` of resources to apply first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFile {
    pub stack: String,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceConfig>,
}

impl StackFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read stack file {}", path.display()))?;
        let stack = Self::parse(&content, StackFormat::from_path(path))
            .with_context(|| format!("Invalid stack file {}", path.display()))?;
        log::debug!(
            "Loaded stack '{}' with {} resources from {}",
            stack.stack,
            stack.resources.len(),
            path.display()
        );
        Ok(stack)
    }

    pub fn parse(content: &str, format: StackFormat) -> Result<Self> {
        let stack: Self = match format {
            StackFormat::Toml => toml::from_str(content)?,
            StackFormat::Json => serde_json::from_str(content)?,
        };
        let name = stack.stack.trim();
        if name.is_empty() {
            bail!("'stack' must not be empty");
        }
        // The name becomes the state file name
        if name.contains(['/', '\\']) || name.contains("..") || name == "." {
            bail!("'stack' must be a plain name, got '{}'", stack.stack);
        }
        Ok(stack)
    }

    /// Declare every resource on `builder`, in file order
    pub fn declare(&self, builder: &mut GraphBuilder) -> Result<()> {
        for resource in &self.resources {
            let mut spec = ResourceSpec::new(&resource.resource_type, &resource.name);
            if let Some(provider) = &resource.provider {
                spec = spec.provider(provider);
            }
            for (name, value) in &resource.inputs {
                let input = to_input(value)
                    .with_context(|| format!("input '{name}' of {}", spec.id))?;
                spec = spec.input(name, input);
            }
            for dep in &resource.depends_on {
                let id: ResourceId = dep
                    .parse()
                    .with_context(|| format!("depends_on of {}", spec.id))?;
                spec = spec.depends_on(id);
            }
            builder.declare(spec)?;
        }
        Ok(())
    }

    /// Providers for this stack
    ///
    /// `default` and `null` are the built-in null provider unless the stack
    /// configures them.
    pub fn registry(&self) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register(DEFAULT_PROVIDER, Arc::new(NullProvider));
        registry.register(NULL_PROVIDER, Arc::new(NullProvider));
        for (name, config) in &self.providers {
            registry.register(
                name.clone(),
                Arc::new(ProcessProvider::new(&config.command, config.args.clone())),
            );
        }
        registry
    }
}

/// Convert a stack file value into an input
fn to_input(value: &Value) -> Result<Input> {
    match value {
        Value::Object(map) if is_reference(map) => {
            let (Some(Value::String(from)), Some(Value::String(attribute))) =
                (map.get("from"), map.get("attribute"))
            else {
                bail!("reference needs string 'from' and 'attribute'");
            };
            let source: ResourceId = from.parse()?;
            Ok(Input::Ref(AttrRef::new(source, attribute.clone())))
        }
        Value::Object(map) => {
            let mut fields = BTreeMap::new();
            for (key, value) in map {
                fields.insert(key.clone(), to_input(value)?);
            }
            Ok(Input::Object(fields))
        }
        Value::Array(items) => Ok(Input::List(
            items.iter().map(to_input).collect::<Result<_>>()?,
        )),
        literal => Ok(Input::Literal(literal.clone())),
    }
}

fn is_reference(map: &serde_json::Map<String, Value>) -> bool {
    map.len() == 2 && map.contains_key("from") && map.contains_key("attribute")
}
