//! Iteration-local state passed alongside a pull
//!
//! A [`ScopeContext`] carries namespaced key/value state (loop index,
//! accumulator) through a pull without mutating any operator. Transforms
//! read it through [`crate::kind::ExecuteContext::scope`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use crate::graph::Graph;
use crate::OperatorId;

/// Namespaced key/value context for iteration-local state
pub struct ScopeContext {
    id: String,
    /// Owning container operator, flagged dirty on scope-state changes
    container: Option<OperatorId>,
    graph: Weak<Graph>,
    values: Mutex<HashMap<String, Value>>,
}

impl ScopeContext {
    pub fn new(id: impl Into<String>, graph: &Arc<Graph>) -> Self {
        Self {
            id: id.into(),
            container: None,
            graph: Arc::downgrade(graph),
            values: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the owning container for [`ScopeContext::mark_parent_dirty`]
    pub fn with_container(mut self, container: impl Into<OperatorId>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.values.lock().insert(key.into(), value);
    }

    /// Flag the owning container dirty (its scope-local state changed)
    pub fn mark_parent_dirty(&self) {
        let Some(container) = &self.container else { return };
        if let Some(graph) = self.graph.upgrade() {
            graph.mark_dirty(std::slice::from_ref(container));
        }
    }
}

/// An independent copy: later writes to either side are not shared
impl Clone for ScopeContext {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            container: self.container.clone(),
            graph: self.graph.clone(),
            values: Mutex::new(self.values.lock().clone()),
        }
    }
}

impl std::fmt::Debug for ScopeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeContext")
            .field("id", &self.id)
            .field("container", &self.container)
            .field("values", &*self.values.lock())
            .finish()
    }
}
