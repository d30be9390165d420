//! Operator kind contracts and the type registry
//!
//! A leaf operator kind is described by an [`OperatorMetadata`] (ports,
//! category, cacheability) and behaves through a [`Transform`]. The
//! [`OperatorRegistry`] maps a type tag to both, so new leaf kinds
//! register a variant and never touch the engine.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::field::FieldType;
use crate::operator::Operator;
use crate::query::QueryBackend;
use crate::scope::ScopeContext;
use crate::OperatorId;

/// Category of an operator kind, used for palette grouping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorCategory {
    /// Data sources (literals, queries, clocks)
    Source,
    /// Value transforms (math, color ramps)
    Transform,
    /// Geometry helpers
    Geometry,
    /// Map layer construction
    Layer,
    /// Control flow (loop machinery)
    Control,
    /// Scene outputs
    Output,
}

/// Definition of a single input or output port
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    /// Port identifier (field name on the operator)
    pub id: String,
    /// Human-readable label
    pub label: String,
    /// Data type of the port
    pub field_type: FieldType,
    /// Whether this input must be connected or set
    pub required: bool,
    /// Whether this port accepts multiple connections
    pub multiple: bool,
    /// Default value for optional inputs
    pub default_value: Option<Value>,
}

impl PortSpec {
    /// Create a required port
    pub fn required(id: impl Into<String>, label: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            field_type,
            required: true,
            multiple: false,
            default_value: None,
        }
    }

    /// Create an optional port
    pub fn optional(id: impl Into<String>, label: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            field_type,
            required: false,
            multiple: false,
            default_value: None,
        }
    }

    /// Allow multiple connections into this port
    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    /// Set a default value for this port
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }
}

/// Complete metadata for an operator kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorMetadata {
    /// Unique type tag (e.g. "color-ramp")
    pub type_tag: String,
    /// Category for grouping
    pub category: OperatorCategory,
    /// Human-readable label
    pub label: String,
    /// Description of what the operator does
    pub description: String,
    /// Input port definitions
    pub inputs: Vec<PortSpec>,
    /// Output port definitions
    pub outputs: Vec<PortSpec>,
    /// Whether pulls may reuse a memoized output. Time/random/external
    /// sources set this to `false` and re-run on every pull.
    pub cacheable: bool,
}

/// Trait for operator kinds that can describe their own metadata
pub trait OperatorDescriptor {
    /// Get the static metadata for this operator kind
    fn descriptor() -> OperatorMetadata
    where
        Self: Sized;
}

/// Link-time collected descriptor entry.
///
/// Operator kind crates submit their descriptors with
/// `inventory::submit!(flow_engine::DescriptorFn(MyKind::descriptor))`.
pub struct DescriptorFn(pub fn() -> OperatorMetadata);

inventory::collect!(DescriptorFn);

/// Read-only cross-operator lookup capability.
///
/// Injected into transforms that need to resolve other operators by id
/// (container output search), replacing the original editor's implicit
/// global registry.
pub trait OperatorLookup: Send + Sync {
    /// Resolve an operator by id
    fn lookup_by_id(&self, id: &str) -> Option<Arc<Operator>>;
    /// All registered operators, in insertion order
    fn list_all(&self) -> Vec<Arc<Operator>>;
}

/// Per-invocation context handed to a transform
pub struct ExecuteContext<'a> {
    /// Id of the operator being computed
    pub operator_id: &'a str,
    /// Cross-operator lookup capability
    pub lookup: &'a dyn OperatorLookup,
    /// Iteration-local scope, present inside a ForLoop pass
    pub scope: Option<&'a ScopeContext>,
}

impl ExecuteContext<'_> {
    /// The shared embedded analytical query backend
    pub fn query_backend(&self) -> &'static QueryBackend {
        QueryBackend::shared()
    }
}

/// The transform function of an operator kind.
///
/// `execute` must be referentially transparent in its declared inputs
/// for caching correctness, unless the kind is flagged non-cacheable.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Compute output port values from resolved input values
    async fn execute(
        &self,
        ctx: &ExecuteContext<'_>,
        inputs: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>>;
}

/// Factory for creating or sharing a [`Transform`]
pub trait TransformFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Transform>;
}

struct SharedTransformFactory {
    transform: Arc<dyn Transform>,
}

impl TransformFactory for SharedTransformFactory {
    fn create(&self) -> Arc<dyn Transform> {
        self.transform.clone()
    }
}

/// Synchronous closure-based transform, for tests and simple kinds
pub struct SyncCallbackTransform {
    callback: Box<
        dyn Fn(HashMap<String, Value>) -> Result<HashMap<String, Value>> + Send + Sync,
    >,
}

impl SyncCallbackTransform {
    pub fn new(
        callback: impl Fn(HashMap<String, Value>) -> Result<HashMap<String, Value>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl Transform for SyncCallbackTransform {
    async fn execute(
        &self,
        _ctx: &ExecuteContext<'_>,
        inputs: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        (self.callback)(inputs)
    }
}

/// Async closure-based transform
pub struct CallbackTransform {
    #[allow(clippy::type_complexity)]
    callback: Box<
        dyn Fn(
                HashMap<String, Value>,
            ) -> Pin<
                Box<dyn std::future::Future<Output = Result<HashMap<String, Value>>> + Send>,
            > + Send
            + Sync,
    >,
}

impl CallbackTransform {
    pub fn from_fn<F, Fut>(callback: F) -> Self
    where
        F: Fn(HashMap<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<HashMap<String, Value>>> + Send + 'static,
    {
        Self {
            callback: Box::new(move |inputs| Box::pin(callback(inputs))),
        }
    }
}

#[async_trait]
impl Transform for CallbackTransform {
    async fn execute(
        &self,
        _ctx: &ExecuteContext<'_>,
        inputs: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        (self.callback)(inputs).await
    }
}

struct RegistryEntry {
    metadata: OperatorMetadata,
    factory: Option<Arc<dyn TransformFactory>>,
}

/// Registry of operator kinds: type tag -> metadata + transform factory
pub struct OperatorRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl OperatorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Create a registry seeded with every inventory-collected
    /// descriptor (metadata only; factories are registered by the kind
    /// crates' setup functions).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for entry in inventory::iter::<DescriptorFn> {
            registry.register_metadata((entry.0)());
        }
        registry
    }

    /// Register a kind with metadata and a transform factory
    pub fn register(&mut self, metadata: OperatorMetadata, factory: Arc<dyn TransformFactory>) {
        self.entries.insert(
            metadata.type_tag.clone(),
            RegistryEntry {
                metadata,
                factory: Some(factory),
            },
        );
    }

    /// Register a kind backed by a shared transform instance
    pub fn register_transform(&mut self, metadata: OperatorMetadata, transform: Arc<dyn Transform>) {
        self.register(metadata, Arc::new(SharedTransformFactory { transform }));
    }

    /// Register a kind backed by a synchronous closure
    pub fn register_fn(
        &mut self,
        metadata: OperatorMetadata,
        callback: impl Fn(HashMap<String, Value>) -> Result<HashMap<String, Value>>
            + Send
            + Sync
            + 'static,
    ) {
        self.register_transform(metadata, Arc::new(SyncCallbackTransform::new(callback)));
    }

    /// Register a kind backed by an async closure
    pub fn register_async_fn<F, Fut>(&mut self, metadata: OperatorMetadata, callback: F)
    where
        F: Fn(HashMap<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<HashMap<String, Value>>> + Send + 'static,
    {
        self.register_transform(
            metadata,
            Arc::new(CallbackTransform {
                callback: Box::new(move |inputs| Box::pin(callback(inputs))),
            }),
        );
    }

    /// Register metadata only (e.g. UI palette listing)
    pub fn register_metadata(&mut self, metadata: OperatorMetadata) {
        self.entries.insert(
            metadata.type_tag.clone(),
            RegistryEntry {
                metadata,
                factory: None,
            },
        );
    }

    /// Get metadata for a type tag
    pub fn get_metadata(&self, type_tag: &str) -> Option<&OperatorMetadata> {
        self.entries.get(type_tag).map(|e| &e.metadata)
    }

    /// All registered metadata
    pub fn all_metadata(&self) -> Vec<&OperatorMetadata> {
        self.entries.values().map(|e| &e.metadata).collect()
    }

    /// Whether a type tag is registered
    pub fn has_type(&self, type_tag: &str) -> bool {
        self.entries.contains_key(type_tag)
    }

    /// All registered type tags
    pub fn type_tags(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Merge another registry into this one; `other` wins on conflicts
    pub fn merge(&mut self, other: OperatorRegistry) {
        self.entries.extend(other.entries);
    }

    /// Instantiate an operator of a registered kind.
    ///
    /// Builds the operator's input/output fields from the kind's port
    /// specs. Fails if the tag is unknown or has no transform factory.
    pub fn instantiate(&self, id: impl Into<OperatorId>, type_tag: &str) -> Result<Arc<Operator>> {
        let id = id.into();
        let entry = self.entries.get(type_tag).ok_or_else(|| {
            EngineError::execution(&id, format!("no operator kind registered for '{}'", type_tag))
        })?;
        let factory = entry.factory.as_ref().ok_or_else(|| {
            EngineError::execution(
                &id,
                format!("operator kind '{}' has metadata but no transform", type_tag),
            )
        })?;
        Ok(Operator::from_metadata(
            id,
            entry.metadata.clone(),
            factory.create(),
        ))
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
