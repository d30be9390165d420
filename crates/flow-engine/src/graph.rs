//! Graph registry: operator arena, edge CRUD, dirty propagation
//!
//! Operators are held in an arena keyed by id; dependency sets on each
//! operator hold ids rather than pointers, so ownership stays acyclic
//! while the logical dependency graph is validated before commit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::kind::OperatorLookup;
use crate::operator::{Operator, OutputMap};
use crate::{EdgeId, OperatorId, PortId};

/// A directed connection from a source output port to a target input port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: EdgeId,
    pub source: OperatorId,
    pub source_port: PortId,
    pub target: OperatorId,
    pub target_port: PortId,
}

#[derive(Default)]
struct GraphInner {
    /// Insertion-ordered arena
    order: Vec<OperatorId>,
    operators: HashMap<OperatorId, Arc<Operator>>,
    edges: Vec<Edge>,
}

/// The mutable operator graph.
///
/// All mutation is synchronous and validated up front: a rejected
/// `add_edge` leaves the graph exactly as it was.
pub struct Graph {
    inner: RwLock<GraphInner>,
}

impl Graph {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(GraphInner::default()),
        })
    }

    /// Add an operator to the registry. Fails if the id is taken.
    pub fn add_operator(&self, operator: Arc<Operator>) -> Result<()> {
        let mut inner = self.inner.write();
        let id = operator.id().to_string();
        if inner.operators.contains_key(&id) {
            return Err(EngineError::validation(
                &id,
                "an operator with this id is already registered",
            ));
        }
        inner.order.push(id.clone());
        inner.operators.insert(id, operator);
        Ok(())
    }

    /// Remove an operator and every edge touching it. The operator's
    /// fields are completed and its downstream is marked dirty.
    pub fn remove_operator(&self, id: &str) -> Result<()> {
        let (operator, downstream) = {
            let mut inner = self.inner.write();
            let operator = inner
                .operators
                .remove(id)
                .ok_or_else(|| EngineError::OperatorNotFound(id.to_string()))?;
            inner.order.retain(|oid| oid != id);
            // Capture before the dependency arcs are torn down below
            let downstream = operator.downstream_ids();

            let touching: Vec<Edge> = inner
                .edges
                .iter()
                .filter(|e| e.source == id || e.target == id)
                .cloned()
                .collect();
            inner.edges.retain(|e| e.source != id && e.target != id);

            // The removed operator no longer resolves through the arena,
            // so fall back to the handle we just took out.
            let resolve = |oid: &str| -> Option<Arc<Operator>> {
                if oid == id {
                    Some(Arc::clone(&operator))
                } else {
                    inner.operators.get(oid).cloned()
                }
            };
            for edge in &touching {
                if let (Some(source), Some(target)) = (resolve(&edge.source), resolve(&edge.target))
                {
                    target.remove_dependency(&source);
                    Self::unlink_fields(&source, &target, edge);
                }
            }
            (operator, downstream)
        };
        operator.teardown();
        self.mark_dirty(&downstream);
        Ok(())
    }

    pub fn operator(&self, id: &str) -> Option<Arc<Operator>> {
        self.inner.read().operators.get(id).cloned()
    }

    /// All operators, in insertion order
    pub fn operators(&self) -> Vec<Arc<Operator>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.operators.get(id).cloned())
            .collect()
    }

    pub fn operator_count(&self) -> usize {
        self.inner.read().operators.len()
    }

    pub fn edges(&self) -> Vec<Edge> {
        self.inner.read().edges.clone()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.read().edges.len()
    }

    /// Edges feeding a given input port, in creation order
    pub fn edges_into(&self, target: &str, target_port: &str) -> Vec<Edge> {
        self.inner
            .read()
            .edges
            .iter()
            .filter(|e| e.target == target && e.target_port == target_port)
            .cloned()
            .collect()
    }

    /// Connect `source.source_port -> target.target_port`.
    ///
    /// Every check runs before any mutation: both operators and ports
    /// must exist, the port types must be compatible, a non-multiple
    /// input must be free, and the edge must not close a cycle. On
    /// success the arc is recorded in both operators' dependency sets,
    /// the fields are chained, and the target's downstream closure is
    /// marked dirty.
    pub fn add_edge(
        &self,
        source: &str,
        source_port: &str,
        target: &str,
        target_port: &str,
    ) -> Result<Edge> {
        let (edge, source_field, target_field, multiple, dirty_root) = {
            let mut inner = self.inner.write();
            let source_op = inner
                .operators
                .get(source)
                .cloned()
                .ok_or_else(|| EngineError::OperatorNotFound(source.to_string()))?;
            let target_op = inner
                .operators
                .get(target)
                .cloned()
                .ok_or_else(|| EngineError::OperatorNotFound(target.to_string()))?;

            let source_field = source_op.output(source_port).ok_or_else(|| {
                EngineError::FieldNotFound {
                    operator: source.to_string(),
                    field: source_port.to_string(),
                }
            })?;
            let target_field = target_op.input(target_port).ok_or_else(|| {
                EngineError::FieldNotFound {
                    operator: target.to_string(),
                    field: target_port.to_string(),
                }
            })?;

            if !target_field
                .field_type()
                .is_compatible_with(&source_field.field_type())
            {
                return Err(EngineError::validation(
                    format!("{}.{}", target, target_port),
                    format!(
                        "cannot accept {:?} output '{}.{}'",
                        source_field.field_type(),
                        source,
                        source_port
                    ),
                ));
            }

            let port_spec = target_op
                .metadata()
                .inputs
                .iter()
                .find(|p| p.id == target_port);
            let multiple = port_spec.is_some_and(|p| p.multiple);
            if !multiple
                && inner
                    .edges
                    .iter()
                    .any(|e| e.target == target && e.target_port == target_port)
            {
                return Err(EngineError::validation(
                    format!("{}.{}", target, target_port),
                    "input is already connected",
                ));
            }

            // The accumulator feedback wire into a loop-meta operator is
            // resolved per iteration by the loop runner, not by ordering;
            // it carries no dependency arc and is exempt from the cycle
            // check.
            let feedback = target_op.type_tag() == crate::forloop::LOOP_META
                && target_port == crate::forloop::PORT_CURRENT;

            // Self-edge is the one-node cycle
            if !feedback && (source == target || Self::reaches(&inner, target, source)) {
                return Err(EngineError::Cycle {
                    from: source.to_string(),
                    to: target.to_string(),
                });
            }

            let edge = Edge {
                id: uuid::Uuid::new_v4().to_string(),
                source: source.to_string(),
                source_port: source_port.to_string(),
                target: target.to_string(),
                target_port: target_port.to_string(),
            };
            inner.edges.push(edge.clone());
            if !feedback {
                target_op.add_dependency(&source_op);
            }
            (
                edge,
                source_field,
                target_field,
                multiple,
                target.to_string(),
            )
        };

        // Field chaining happens outside the registry lock: connect
        // adopts the source value, which may fire subscriber callbacks
        // that re-enter the graph.
        let linked = if multiple {
            target_field.connect_append(&source_field)
        } else {
            target_field.connect(&source_field)
        };
        if let Err(err) = linked {
            self.remove_edge(&edge.id)?;
            return Err(err);
        }

        self.mark_dirty(std::slice::from_ref(&dirty_root));
        Ok(edge)
    }

    /// Remove an edge by id. The target's downstream closure is marked
    /// dirty; the operator-level dependency arc is dropped only when no
    /// other edge still connects the same pair.
    pub fn remove_edge(&self, edge_id: &str) -> Result<()> {
        let dirty_root = {
            let mut inner = self.inner.write();
            let idx = inner
                .edges
                .iter()
                .position(|e| e.id == edge_id)
                .ok_or_else(|| EngineError::OperatorNotFound(format!("edge {}", edge_id)))?;
            let edge = inner.edges.remove(idx);

            let pair_remains = inner
                .edges
                .iter()
                .any(|e| e.source == edge.source && e.target == edge.target);
            if let (Some(source), Some(target)) = (
                inner.operators.get(&edge.source),
                inner.operators.get(&edge.target),
            ) {
                if !pair_remains {
                    target.remove_dependency(source);
                }
                Self::unlink_fields(source, target, &edge);
            }
            edge.target
        };
        self.mark_dirty(std::slice::from_ref(&dirty_root));
        Ok(())
    }

    fn unlink_fields(source: &Arc<Operator>, target: &Arc<Operator>, edge: &Edge) {
        if let (Some(source_field), Some(target_field)) =
            (source.output(&edge.source_port), target.input(&edge.target_port))
        {
            target_field.disconnect_from(&source_field);
        }
    }

    /// Whether `to` is reachable from `from` over dependency arcs
    fn reaches(inner: &GraphInner, from: &str, to: &str) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from.to_string()]);
        while let Some(id) = queue.pop_front() {
            if id == to {
                return true;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(op) = inner.operators.get(&id) {
                queue.extend(op.downstream_ids());
            }
        }
        false
    }

    /// Flip the given operators and their transitive downstream closure
    /// to Dirty. Already-dirty operators stop the walk (their downstream
    /// was dirtied when they were).
    pub fn mark_dirty(&self, ids: &[OperatorId]) {
        let mut queue: VecDeque<OperatorId> = ids.iter().cloned().collect();
        let mut seen: HashSet<OperatorId> = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(op) = self.operator(&id) else { continue };
            if op.mark_dirty() {
                queue.extend(op.downstream_ids());
            }
        }
    }

    /// Resolve an operator's input values for one transform invocation.
    ///
    /// Precedence per input port: freshly pulled upstream outputs, then
    /// the upstream operator's memoized cache, then the field's own
    /// current value (which already carries the port default). Pull
    /// never writes into fields; resolution is read-only.
    pub fn resolve_inputs(
        &self,
        operator: &Operator,
        pulled: &HashMap<OperatorId, OutputMap>,
    ) -> Result<HashMap<String, Value>> {
        let mut resolved = HashMap::new();
        for port in &operator.metadata().inputs {
            let edges = self.edges_into(operator.id(), &port.id);
            let value = if edges.is_empty() {
                self.field_value(operator, &port.id)
            } else if port.multiple {
                let mut values = Vec::with_capacity(edges.len());
                for edge in &edges {
                    values.push(self.edge_value(edge, pulled));
                }
                Value::Array(values)
            } else {
                self.edge_value(&edges[0], pulled)
            };

            if value.is_null() && port.required {
                return Err(EngineError::execution(
                    operator.id(),
                    format!("missing required input '{}'", port.id),
                ));
            }
            resolved.insert(port.id.clone(), value);
        }
        Ok(resolved)
    }

    fn edge_value(&self, edge: &Edge, pulled: &HashMap<OperatorId, OutputMap>) -> Value {
        if let Some(outputs) = pulled.get(&edge.source) {
            if let Some(value) = outputs.get(&edge.source_port) {
                return value.clone();
            }
        }
        if let Some(source) = self.operator(&edge.source) {
            if let Some(cache) = source.cached_output() {
                if let Some(value) = cache.get(&edge.source_port) {
                    return value.clone();
                }
            }
            if let Some(field) = source.output(&edge.source_port) {
                let value = field.value();
                if !value.is_null() {
                    return value;
                }
            }
        }
        Value::Null
    }

    fn field_value(&self, operator: &Operator, port: &str) -> Value {
        operator
            .input(port)
            .map(|f| f.value())
            .unwrap_or(Value::Null)
    }
}

impl OperatorLookup for Graph {
    fn lookup_by_id(&self, id: &str) -> Option<Arc<Operator>> {
        self.operator(id)
    }

    fn list_all(&self) -> Vec<Arc<Operator>> {
        self.operators()
    }
}
