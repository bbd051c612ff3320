//! Resource specifications and their typed inputs
//!
//! A [`ResourceSpec`] is the desired state of one resource: an identity, a
//! provider binding and a tree of [`Input`] values. References to other
//! resources' attributes are explicit [`Input::Ref`] nodes, so dependency
//! edges are read straight off the tree.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Resolved attribute values, keyed by attribute name
pub type Attributes = BTreeMap<String, Value>;

/// Provider binding used when a spec does not name one
pub const DEFAULT_PROVIDER: &str = "default";

/// Identity of a resource within a graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    /// Provider-specific type token, e.g. `aws:s3/bucket:Bucket`
    pub resource_type: String,
    /// Logical name, unique per type
    pub name: String,
}

impl ResourceId {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Key used for state records: `type::name`
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.resource_type, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once("::") {
            Some((resource_type, name)) if !resource_type.is_empty() && !name.is_empty() => {
                Ok(Self::new(resource_type, name))
            }
            _ => Err(Error::InvalidResourceId(s.to_string())),
        }
    }
}

/// Identity of a component, a named group of resources declared together
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId {
    pub component_type: String,
    pub name: String,
}

impl ComponentId {
    pub fn new(component_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            component_type: component_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.component_type, self.name)
    }
}

/// Untyped reference to an attribute produced by another resource
///
/// `attribute` is a path: segments separated by `.`, numeric segments index
/// into arrays (`status.loadBalancer.ingress.0.hostname`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttrRef {
    pub source: ResourceId,
    pub attribute: String,
}

impl AttrRef {
    pub fn new(source: ResourceId, attribute: impl Into<String>) -> Self {
        Self {
            source,
            attribute: attribute.into(),
        }
    }

    /// Look this reference up in a set of resolved attributes
    pub fn lookup<'a>(&self, attributes: &'a Attributes) -> Option<&'a Value> {
        lookup_attribute(attributes, &self.attribute)
    }
}

impl fmt::Display for AttrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.source, self.attribute)
    }
}

/// Pure function computing a value from resolved arguments
pub type ApplyFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// A desired-state input value
#[derive(Clone)]
pub enum Input {
    /// A value known at declaration time
    Literal(Value),
    /// An attribute of another resource
    Ref(AttrRef),
    /// A nested object whose fields may hold references
    Object(BTreeMap<String, Input>),
    /// A list whose items may hold references
    List(Vec<Input>),
    /// A value computed from other inputs once they are all known
    Apply { args: Vec<Input>, func: ApplyFn },
}

impl Input {
    /// Build an object input from `(key, value)` pairs
    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Input)>,
    {
        Input::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build a list input
    pub fn list(items: impl IntoIterator<Item = Input>) -> Self {
        Input::List(items.into_iter().collect())
    }

    /// Compute a value from `args` once every one of them is resolved
    pub fn apply<F>(args: Vec<Input>, func: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        Input::Apply {
            args,
            func: Arc::new(func),
        }
    }

    /// All attribute references contained in this input, in tree order
    pub fn references(&self) -> Vec<&AttrRef> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, refs: &mut Vec<&'a AttrRef>) {
        match self {
            Input::Literal(_) => {}
            Input::Ref(r) => refs.push(r),
            Input::Object(fields) => {
                for value in fields.values() {
                    value.collect_references(refs);
                }
            }
            Input::List(items) => {
                for item in items {
                    item.collect_references(refs);
                }
            }
            Input::Apply { args, .. } => {
                for arg in args {
                    arg.collect_references(refs);
                }
            }
        }
    }

    /// Resolve to a concrete value, asking `lookup` for every reference
    pub fn resolve_with<E>(
        &self,
        lookup: &mut dyn FnMut(&AttrRef) -> Result<Value, E>,
    ) -> Result<Value, E> {
        match self {
            Input::Literal(value) => Ok(value.clone()),
            Input::Ref(r) => lookup(r),
            Input::Object(fields) => {
                let mut object = serde_json::Map::new();
                for (key, value) in fields {
                    object.insert(key.clone(), value.resolve_with(lookup)?);
                }
                Ok(Value::Object(object))
            }
            Input::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(item.resolve_with(lookup)?);
                }
                Ok(Value::Array(values))
            }
            Input::Apply { args, func } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(arg.resolve_with(lookup)?);
                }
                Ok(func(&values))
            }
        }
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Input::Literal(value) => write!(f, "{value}"),
            Input::Ref(r) => write!(f, "ref({r})"),
            Input::Object(fields) => f.debug_map().entries(fields.iter()).finish(),
            Input::List(items) => f.debug_list().entries(items.iter()).finish(),
            Input::Apply { args, .. } => f.debug_tuple("apply").field(args).finish(),
        }
    }
}

impl From<Value> for Input {
    fn from(value: Value) -> Self {
        Input::Literal(value)
    }
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Input::Literal(Value::String(value.to_string()))
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Input::Literal(Value::String(value))
    }
}

impl From<bool> for Input {
    fn from(value: bool) -> Self {
        Input::Literal(Value::Bool(value))
    }
}

impl From<i64> for Input {
    fn from(value: i64) -> Self {
        Input::Literal(Value::from(value))
    }
}

impl From<u64> for Input {
    fn from(value: u64) -> Self {
        Input::Literal(Value::from(value))
    }
}

impl From<u16> for Input {
    fn from(value: u16) -> Self {
        Input::Literal(Value::from(value))
    }
}

impl From<AttrRef> for Input {
    fn from(value: AttrRef) -> Self {
        Input::Ref(value)
    }
}

impl From<Vec<Input>> for Input {
    fn from(items: Vec<Input>) -> Self {
        Input::List(items)
    }
}

impl From<BTreeMap<String, Input>> for Input {
    fn from(fields: BTreeMap<String, Input>) -> Self {
        Input::Object(fields)
    }
}

/// Desired state of a single resource
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    pub id: ResourceId,
    pub inputs: BTreeMap<String, Input>,
    /// Name of the provider this resource is bound to
    pub provider: String,
    /// Ordering hints beyond what the inputs reference
    pub depends_on: Vec<ResourceId>,
    pub parent: Option<ComponentId>,
}

impl ResourceSpec {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(resource_type, name),
            inputs: BTreeMap::new(),
            provider: DEFAULT_PROVIDER.to_string(),
            depends_on: Vec::new(),
            parent: None,
        }
    }

    /// Set an input attribute
    pub fn input(mut self, name: impl Into<String>, value: impl Into<Input>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    /// Bind to a named provider
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Add an explicit ordering dependency
    pub fn depends_on(mut self, id: ResourceId) -> Self {
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }

    /// Mark this resource as part of a component
    pub fn parent(mut self, component: ComponentId) -> Self {
        self.parent = Some(component);
        self
    }

    /// Every resource this spec depends on, references first, deduplicated
    pub fn dependency_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = Vec::new();
        let referenced = self
            .inputs
            .values()
            .flat_map(Input::references)
            .map(|r| &r.source);
        for id in referenced.chain(self.depends_on.iter()) {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// Resolve every input through `lookup`
    pub fn resolve_inputs<E>(
        &self,
        lookup: &mut dyn FnMut(&AttrRef) -> Result<Value, E>,
    ) -> Result<Attributes, E> {
        let mut resolved = Attributes::new();
        for (name, input) in &self.inputs {
            resolved.insert(name.clone(), input.resolve_with(lookup)?);
        }
        Ok(resolved)
    }
}

/// Walk an attribute path through resolved attributes
pub fn lookup_attribute<'a>(attributes: &'a Attributes, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = attributes.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Content hash of resolved inputs and provider binding
///
/// Two specs with the same hash are considered identical; `serde_json` keeps
/// object keys sorted so the encoding is canonical.
pub fn spec_hash(provider: &str, inputs: &Attributes) -> String {
    let document = serde_json::json!({
        "provider": provider,
        "inputs": inputs,
    });
    blake3::hash(document.to_string().as_bytes())
        .to_hex()
        .to_string()
}
