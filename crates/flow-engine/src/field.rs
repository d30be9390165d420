//! Typed, observable value containers
//!
//! A [`Field`] is the unit of data carried between operators: a single
//! `serde_json::Value` tagged with a [`FieldType`], an ordered subscriber
//! list, and optional chained connections to upstream fields. Subscribers
//! are notified only when the stored value actually changes.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::OperatorId;

/// The data type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Accepts any value
    Any,
    /// Text string
    String,
    /// Numeric value
    Number,
    /// Boolean value
    Boolean,
    /// Arbitrary JSON object
    Json,
    /// JSON array
    Array,
    /// GeoJSON FeatureCollection
    FeatureCollection,
    /// Single GeoJSON geometry
    Geometry,
    /// Tabular rows (array of objects)
    Table,
    /// CSS-style hex color string
    Color,
    /// Interpolated color ramp definition
    ColorRamp,
    /// Rendered map layer specification
    LayerSpec,
}

impl FieldType {
    /// Check whether a value from a field of type `other` may flow into
    /// a field of this type.
    pub fn is_compatible_with(&self, other: &FieldType) -> bool {
        // Any is a wildcard on either side
        if matches!(self, FieldType::Any) || matches!(other, FieldType::Any) {
            return true;
        }

        // Structured geo/tabular values degrade into plain Json
        if matches!(self, FieldType::Json)
            && matches!(
                other,
                FieldType::FeatureCollection | FieldType::Geometry | FieldType::Table
            )
        {
            return true;
        }

        // Tables are arrays of rows
        if matches!(self, FieldType::Array) && matches!(other, FieldType::Table) {
            return true;
        }

        self == other
    }

    /// Check a concrete value against this type's contract.
    ///
    /// `Null` is accepted everywhere (absent value).
    pub fn validate(&self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }
        match self {
            FieldType::Any | FieldType::Json => true,
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::FeatureCollection => {
                value.get("type").and_then(Value::as_str) == Some("FeatureCollection")
            }
            FieldType::Geometry => {
                value.is_object() && value.get("type").and_then(Value::as_str).is_some()
            }
            FieldType::Table => value
                .as_array()
                .is_some_and(|rows| rows.iter().all(Value::is_object)),
            FieldType::Color => value.as_str().is_some_and(|s| s.starts_with('#')),
            FieldType::ColorRamp => value.is_object() || value.is_array(),
            FieldType::LayerSpec => value.is_object(),
        }
    }

    /// Validate `value`, applying cheap coercions where the intent is
    /// unambiguous (numeric strings into numbers, boolean strings into
    /// booleans). Returns `None` for an incompatible value.
    pub fn coerce(&self, value: Value) -> Option<Value> {
        if self.validate(&value) {
            return Some(value);
        }
        match (self, &value) {
            (FieldType::Number, Value::String(s)) => {
                s.trim().parse::<f64>().ok().and_then(|n| {
                    serde_json::Number::from_f64(n).map(Value::Number)
                })
            }
            (FieldType::Boolean, Value::String(s)) => match s.trim() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            (FieldType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
            _ => None,
        }
    }
}

/// Token identifying one subscriber on a field
pub type SubscriberId = u64;

type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

struct UpstreamLink {
    source: Weak<Field>,
    /// Subscriber token registered on the source field
    token: SubscriberId,
}

#[derive(Default)]
struct FieldInner {
    value: Value,
    subscribers: Vec<(SubscriberId, Callback)>,
    next_subscriber: SubscriberId,
    upstream: Vec<UpstreamLink>,
    closed: bool,
}

/// A typed, observable single-value container.
///
/// The owner reference is a non-owning id used for lookups and error
/// messages; the operator exclusively owns its fields.
pub struct Field {
    name: String,
    owner: OperatorId,
    field_type: FieldType,
    default_value: Option<Value>,
    inner: Mutex<FieldInner>,
}

impl Field {
    /// Create a new field owned by `owner`
    pub fn new(owner: impl Into<OperatorId>, name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            field_type,
            default_value: None,
            inner: Mutex::new(FieldInner::default()),
        }
    }

    /// Set a default value; also seeds the current value
    pub fn with_default(mut self, value: Value) -> Self {
        self.inner.get_mut().value = value.clone();
        self.default_value = Some(value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default_value.as_ref()
    }

    /// Current value (cloned)
    pub fn value(&self) -> Value {
        self.inner.lock().value.clone()
    }

    /// Validate, coerce and store a value; notify subscribers if it changed.
    ///
    /// Returns `true` when the stored value changed. Fails with
    /// [`EngineError::Validation`] on an incompatible value. A completed
    /// field silently ignores writes.
    pub fn set_value(&self, value: Value) -> Result<bool> {
        let coerced = self.field_type.coerce(value).ok_or_else(|| {
            EngineError::validation(
                format!("{}.{}", self.owner, self.name),
                format!("value does not satisfy {:?}", self.field_type),
            )
        })?;

        let callbacks: Vec<Callback>;
        {
            let mut inner = self.inner.lock();
            if inner.closed || inner.value == coerced {
                return Ok(false);
            }
            inner.value = coerced.clone();
            callbacks = inner.subscribers.iter().map(|(_, cb)| cb.clone()).collect();
        }
        // Notify outside the lock so chained fields can re-enter
        for cb in callbacks {
            cb(&coerced);
        }
        Ok(true)
    }

    /// Register a change subscriber; the callback fires after each
    /// actual value change.
    pub fn subscribe(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> SubscriberId {
        let mut inner = self.inner.lock();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscriber registered with [`Field::subscribe`]
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner.lock().subscribers.retain(|(sid, _)| *sid != id);
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Connect this field to a single upstream source.
    ///
    /// Any existing connections are dropped; the source's current value
    /// is adopted immediately and subsequent source changes chain through.
    pub fn connect(self: &Arc<Self>, source: &Arc<Field>) -> Result<()> {
        self.check_compat(source)?;
        self.disconnect();
        self.link(source);
        let _ = self.set_value(source.value());
        Ok(())
    }

    /// Append an upstream connection to a list-typed aggregate field.
    ///
    /// The field's value becomes the array of all connected sources'
    /// values, in connection order.
    pub fn connect_append(self: &Arc<Self>, source: &Arc<Field>) -> Result<()> {
        if !matches!(self.field_type, FieldType::Array | FieldType::Any) {
            return Err(EngineError::validation(
                format!("{}.{}", self.owner, self.name),
                "multiple connections require a list-typed field",
            ));
        }
        self.link_aggregate(source);
        self.refresh_aggregate();
        Ok(())
    }

    /// Drop every upstream connection; no further propagation.
    pub fn disconnect(&self) {
        let links = std::mem::take(&mut self.inner.lock().upstream);
        for link in links {
            if let Some(source) = link.source.upgrade() {
                source.unsubscribe(link.token);
            }
        }
    }

    /// Drop the connection from one specific source field
    pub fn disconnect_from(&self, source: &Arc<Field>) {
        let mut removed = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.upstream.retain(|link| {
                let matches = link
                    .source
                    .upgrade()
                    .is_some_and(|s| Arc::ptr_eq(&s, source));
                if matches {
                    removed.push(link.token);
                }
                !matches
            });
        }
        for token in removed {
            source.unsubscribe(token);
        }
        if self.upstream_count() > 0 {
            self.refresh_aggregate();
        }
    }

    /// Number of upstream connections
    pub fn upstream_count(&self) -> usize {
        self.inner.lock().upstream.len()
    }

    /// Reorder aggregate connections; `order` holds the current indices
    /// in their new positions.
    pub fn reorder_upstream(&self, order: &[usize]) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if order.len() != inner.upstream.len() {
                return Err(EngineError::validation(
                    format!("{}.{}", self.owner, self.name),
                    "reorder index list does not match connection count",
                ));
            }
            let mut links: Vec<Option<UpstreamLink>> =
                std::mem::take(&mut inner.upstream).into_iter().map(Some).collect();
            let mut reordered = Vec::with_capacity(links.len());
            for &idx in order {
                let link = links.get_mut(idx).and_then(Option::take).ok_or_else(|| {
                    EngineError::validation(
                        format!("{}.{}", self.owner, self.name),
                        "invalid reorder index",
                    )
                })?;
                reordered.push(link);
            }
            inner.upstream = reordered;
        }
        self.refresh_aggregate();
        Ok(())
    }

    /// Tear the field down: drop subscribers and upstream connections.
    /// Called when the owning operator is removed from the graph.
    pub fn complete(&self) {
        self.disconnect();
        let mut inner = self.inner.lock();
        inner.subscribers.clear();
        inner.closed = true;
    }

    fn check_compat(&self, source: &Field) -> Result<()> {
        if !self.field_type.is_compatible_with(&source.field_type) {
            return Err(EngineError::validation(
                format!("{}.{}", self.owner, self.name),
                format!(
                    "cannot connect {:?} source '{}.{}'",
                    source.field_type, source.owner, source.name
                ),
            ));
        }
        Ok(())
    }

    fn link(self: &Arc<Self>, source: &Arc<Field>) {
        let target = Arc::clone(self);
        let token = source.subscribe(move |value| {
            if let Err(err) = target.set_value(value.clone()) {
                log::warn!("field propagation into '{}.{}' rejected: {}", target.owner, target.name, err);
            }
        });
        self.inner.lock().upstream.push(UpstreamLink {
            source: Arc::downgrade(source),
            token,
        });
    }

    fn link_aggregate(self: &Arc<Self>, source: &Arc<Field>) {
        let target = Arc::clone(self);
        let token = source.subscribe(move |_| {
            target.refresh_aggregate();
        });
        self.inner.lock().upstream.push(UpstreamLink {
            source: Arc::downgrade(source),
            token,
        });
    }

    /// Recompute an aggregate value from the ordered upstream list
    fn refresh_aggregate(&self) {
        let sources: Vec<Arc<Field>> = self
            .inner
            .lock()
            .upstream
            .iter()
            .filter_map(|link| link.source.upgrade())
            .collect();
        if sources.is_empty() {
            return;
        }
        let values: Vec<Value> = sources.iter().map(|s| s.value()).collect();
        if let Err(err) = self.set_value(Value::Array(values)) {
            log::warn!("aggregate refresh of '{}.{}' rejected: {}", self.owner, self.name, err);
        }
    }
}

impl std::fmt::Debug for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("owner", &self.owner)
            .field("name", &self.name)
            .field("field_type", &self.field_type)
            .field("value", &self.inner.lock().value)
            .finish()
    }
}
