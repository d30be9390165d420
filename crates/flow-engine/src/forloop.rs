//! ForLoop scope detection and iteration
//!
//! A ForLoop is a begin/end-delimited span of the graph re-run once per
//! element of the begin operator's array input. The runner primes the
//! begin (and optional meta) operator's cache with the iteration values,
//! clears the intermediates, pulls them in order, and collects the end
//! operator's input into a results array. Input changes anywhere in the
//! span re-trigger a coalesced pass.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{EngineError, Result};
use crate::field::{Field, SubscriberId};
use crate::graph::Graph;
use crate::operator::{Operator, OutputMap};
use crate::scope::ScopeContext;
use crate::topo::topological_sort;
use crate::OperatorId;

/// Type tag of the loop begin operator kind
pub const LOOP_BEGIN: &str = "loop-begin";
/// Type tag of the loop end operator kind
pub const LOOP_END: &str = "loop-end";
/// Type tag of the loop meta (accumulator) operator kind
pub const LOOP_META: &str = "loop-meta";

pub const PORT_DATA: &str = "data";
pub const PORT_ITEM: &str = "item";
pub const PORT_INDEX: &str = "index";
pub const PORT_TOTAL: &str = "total";
pub const PORT_ITEMS: &str = "items";
pub const PORT_ACCUMULATOR: &str = "accumulator";
pub const PORT_CURRENT: &str = "current";
pub const PORT_INITIAL: &str = "initial";
pub const PORT_IS_FIRST: &str = "is_first";
pub const PORT_IS_LAST: &str = "is_last";

/// Scope keys visible to transforms during an iteration
pub const SCOPE_INDEX: &str = "index";
pub const SCOPE_TOTAL: &str = "total";
pub const SCOPE_ACCUMULATOR: &str = "accumulator";

/// A detected begin/end span with its execution-ordered intermediates
#[derive(Debug, Clone)]
pub struct ForLoopScope {
    pub begin: OperatorId,
    pub end: OperatorId,
    pub meta: Option<OperatorId>,
    /// Intermediates in topological order (begin and end excluded)
    pub chain: Vec<OperatorId>,
}

impl ForLoopScope {
    /// Every operator belonging to the scope, begin and end included
    pub fn members(&self) -> Vec<OperatorId> {
        let mut all = vec![self.begin.clone()];
        all.extend(self.chain.iter().cloned());
        if let Some(meta) = &self.meta {
            all.push(meta.clone());
        }
        all.push(self.end.clone());
        all
    }

    pub fn contains(&self, id: &str) -> bool {
        self.begin == id
            || self.end == id
            || self.meta.as_deref() == Some(id)
            || self.chain.iter().any(|m| m == id)
    }
}

/// Scan the graph for begin/end spans.
///
/// Scopes are detected fresh on every call; they are not persisted.
/// A loop-end with no upstream loop-begin is skipped with a warning, as
/// is a span nested inside another span (nesting is unsupported).
pub fn detect_scopes(graph: &Arc<Graph>) -> Vec<ForLoopScope> {
    let operators = graph.operators();
    let mut scopes = Vec::new();

    for end in operators.iter().filter(|o| o.type_tag() == LOOP_END) {
        let upstream = closure(graph, end.id(), |op| op.upstream_ids());
        let Some(begin) = nearest_begin(graph, end.id()) else {
            log::warn!("loop end '{}' has no upstream loop begin; skipped", end.id());
            continue;
        };
        let downstream = closure(graph, &begin, |op| op.downstream_ids());

        let mut members: Vec<OperatorId> = operators
            .iter()
            .map(|o| o.id().to_string())
            .filter(|id| {
                id != &begin
                    && id != end.id()
                    && upstream.contains(id)
                    && downstream.contains(id)
            })
            .collect();

        // The meta operator sits outside the ordering closure (its
        // feedback wire carries no dependency arc); find it through the
        // edges touching the span.
        let meta = find_meta(graph, &begin, end.id(), &members);
        if let Some(meta_id) = &meta {
            members.retain(|id| id != meta_id);
        }

        let member_set: HashSet<&str> = members.iter().map(String::as_str).collect();
        let member_edges: Vec<(OperatorId, OperatorId)> = graph
            .edges()
            .into_iter()
            .filter(|e| member_set.contains(e.source.as_str()) && member_set.contains(e.target.as_str()))
            .map(|e| (e.source, e.target))
            .collect();
        let sorted = topological_sort(&members, &member_edges);
        if !sorted.is_acyclic() {
            log::warn!("loop span for '{}' contains a cycle; skipped", end.id());
            continue;
        }

        scopes.push(ForLoopScope {
            begin,
            end: end.id().to_string(),
            meta,
            chain: sorted.order,
        });
    }

    // Drop spans nested inside another span
    let mut kept: Vec<ForLoopScope> = Vec::new();
    for scope in &scopes {
        let nested = scopes.iter().any(|outer| {
            outer.end != scope.end && outer.chain.iter().any(|m| *m == scope.begin)
        });
        if nested {
            log::warn!(
                "nested loop span '{}'..'{}' is unsupported; outer span takes precedence",
                scope.begin,
                scope.end
            );
        } else {
            kept.push(scope.clone());
        }
    }
    kept
}

fn closure(
    graph: &Arc<Graph>,
    start: &str,
    next: impl Fn(&Arc<Operator>) -> Vec<OperatorId>,
) -> HashSet<OperatorId> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(op) = graph.operator(&id) {
            queue.extend(next(&op));
        }
    }
    seen
}

/// Breadth-first upstream walk to the nearest loop-begin
fn nearest_begin(graph: &Arc<Graph>, end: &str) -> Option<OperatorId> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<OperatorId> = graph.operator(end)?.upstream_ids().into();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let op = graph.operator(&id)?;
        if op.type_tag() == LOOP_BEGIN {
            return Some(id);
        }
        queue.extend(op.upstream_ids());
    }
    None
}

fn find_meta(graph: &Arc<Graph>, begin: &str, end: &str, members: &[OperatorId]) -> Option<OperatorId> {
    let span: HashSet<&str> = members
        .iter()
        .map(String::as_str)
        .chain([begin, end])
        .collect();
    for edge in graph.edges() {
        let (meta_side, other) = if edge_is_meta(graph, &edge.source) {
            (edge.source, edge.target)
        } else if edge_is_meta(graph, &edge.target) {
            (edge.target, edge.source)
        } else {
            continue;
        };
        if span.contains(other.as_str()) {
            return Some(meta_side);
        }
    }
    None
}

fn edge_is_meta(graph: &Arc<Graph>, id: &str) -> bool {
    graph
        .operator(id)
        .is_some_and(|op| op.type_tag() == LOOP_META)
}

type SubscriptionKey = (OperatorId, String);

/// Per-end-node iteration driver.
///
/// At most one pass runs at a time; requests arriving mid-pass bump the
/// generation counter and coalesce into a single trailing pass.
pub struct LoopRunner {
    end: OperatorId,
    scope: Mutex<ForLoopScope>,
    run_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    completed: AtomicU64,
    subscriptions: Mutex<HashMap<SubscriptionKey, (Weak<Field>, SubscriberId)>>,
}

impl LoopRunner {
    pub fn new(scope: ForLoopScope) -> Arc<Self> {
        Arc::new(Self {
            end: scope.end.clone(),
            scope: Mutex::new(scope),
            run_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    pub fn end_id(&self) -> &str {
        &self.end
    }

    /// Replace the span with a freshly detected one
    pub fn update_scope(&self, scope: ForLoopScope) {
        *self.scope.lock() = scope;
    }

    pub fn scope(&self) -> ForLoopScope {
        self.scope.lock().clone()
    }

    /// Whether a subscribed input changed since the last completed pass
    pub fn has_pending(&self) -> bool {
        self.generation.load(Ordering::SeqCst) != self.completed.load(Ordering::SeqCst)
    }

    /// Run the loop to quiescence: one pass, plus one trailing pass per
    /// batch of input changes that landed mid-pass.
    pub async fn run(self: &Arc<Self>, graph: &Arc<Graph>) -> Result<Value> {
        let _guard = self.run_lock.lock().await;
        loop {
            // Let synchronously queued input changes land so a batch
            // collapses into one pass.
            tokio::task::yield_now().await;
            let generation = self.generation.load(Ordering::SeqCst);
            let result = self.run_pass(graph).await?;
            self.completed.store(generation, Ordering::SeqCst);
            if self.generation.load(Ordering::SeqCst) == generation {
                return Ok(result);
            }
        }
    }

    /// One complete pass over the array
    async fn run_pass(self: &Arc<Self>, graph: &Arc<Graph>) -> Result<Value> {
        let scope = self.scope();
        let begin = graph
            .operator(&scope.begin)
            .ok_or_else(|| EngineError::OperatorNotFound(scope.begin.clone()))?;
        let end = graph
            .operator(&scope.end)
            .ok_or_else(|| EngineError::OperatorNotFound(scope.end.clone()))?;
        let meta = match &scope.meta {
            Some(id) => Some(
                graph
                    .operator(id)
                    .ok_or_else(|| EngineError::OperatorNotFound(id.clone()))?,
            ),
            None => None,
        };

        self.refresh_subscriptions(graph, &scope);

        // Resolve the begin operator's array input without invoking its
        // transform; outside dependencies are pulled normally.
        let mut outside = HashMap::new();
        for dep_id in begin.upstream_ids() {
            let dep = graph
                .operator(&dep_id)
                .ok_or_else(|| EngineError::OperatorNotFound(dep_id.clone()))?;
            let outputs = dep.pull(graph).await?;
            outside.insert(dep_id, outputs);
        }
        let begin_inputs = graph.resolve_inputs(&begin, &outside)?;
        let data = begin_inputs.get(PORT_DATA).cloned().unwrap_or(Value::Null);

        let Some(items) = data.as_array().filter(|a| !a.is_empty()) else {
            // Not an array, or empty: no member executes
            let mut empty = OutputMap::new();
            empty.insert(PORT_ITEMS.to_string(), json!([]));
            end.prime_output(empty);
            return Ok(json!([]));
        };

        let total = items.len();
        let mut results = Vec::with_capacity(total);
        let mut accumulator = match &meta {
            Some(meta_op) => meta_op
                .input(PORT_INITIAL)
                .map(|f| f.value())
                .unwrap_or(Value::Null),
            None => Value::Null,
        };

        let iter_scope = Arc::new(
            ScopeContext::new(scope.end.clone(), graph).with_container(scope.begin.clone()),
        );
        iter_scope.set(SCOPE_TOTAL, json!(total));

        for (index, item) in items.iter().enumerate() {
            let mut pass: HashMap<OperatorId, OutputMap> = HashMap::new();

            let mut begin_out = OutputMap::new();
            begin_out.insert(PORT_ITEM.to_string(), item.clone());
            begin_out.insert(PORT_INDEX.to_string(), json!(index));
            begin_out.insert(PORT_TOTAL.to_string(), json!(total));
            begin.prime_output(begin_out.clone());
            pass.insert(scope.begin.clone(), begin_out);

            if let Some(meta_op) = &meta {
                let mut meta_out = OutputMap::new();
                meta_out.insert(PORT_ACCUMULATOR.to_string(), accumulator.clone());
                meta_out.insert(PORT_INDEX.to_string(), json!(index));
                meta_out.insert(PORT_TOTAL.to_string(), json!(total));
                meta_out.insert(PORT_IS_FIRST.to_string(), json!(index == 0));
                meta_out.insert(PORT_IS_LAST.to_string(), json!(index == total - 1));
                meta_op.prime_output(meta_out.clone());
                pass.insert(meta_op.id().to_string(), meta_out);
            }

            iter_scope.set(SCOPE_INDEX, json!(index));
            iter_scope.set(SCOPE_ACCUMULATOR, accumulator.clone());

            // Force genuine recomputation of every intermediate
            for member_id in &scope.chain {
                if let Some(member) = graph.operator(member_id) {
                    member.mark_dirty();
                }
            }

            // Sequential: each intermediate may depend on the previous
            for member_id in &scope.chain {
                let member = graph
                    .operator(member_id)
                    .ok_or_else(|| EngineError::OperatorNotFound(member_id.clone()))?;
                let outputs = member
                    .pull_with_scope(graph, Some(Arc::clone(&iter_scope)))
                    .await?;
                pass.insert(member_id.clone(), outputs);
            }

            let end_inputs = graph.resolve_inputs(&end, &pass)?;
            results.push(end_inputs.get(PORT_ITEM).cloned().unwrap_or(Value::Null));

            if let Some(meta_op) = &meta {
                let meta_inputs = graph.resolve_inputs(meta_op, &pass)?;
                let current = meta_inputs.get(PORT_CURRENT).cloned().unwrap_or(Value::Null);
                if !current.is_null() {
                    accumulator = current;
                }
            }
        }

        let collected = Value::Array(results);
        let mut end_out = OutputMap::new();
        end_out.insert(PORT_ITEMS.to_string(), collected.clone());
        end.prime_output(end_out);
        log::debug!(
            "loop span '{}' collected {} items",
            scope.end,
            total
        );
        Ok(collected)
    }

    /// Subscribe to the begin operator's array input and to every input
    /// field of every intermediate. Meta fields are loop machinery, not
    /// causes, and are excluded. Stale subscriptions from a previous
    /// span shape are dropped.
    fn refresh_subscriptions(self: &Arc<Self>, graph: &Arc<Graph>, scope: &ForLoopScope) {
        let mut desired: Vec<(SubscriptionKey, Arc<Field>)> = Vec::new();
        if let Some(begin) = graph.operator(&scope.begin) {
            if let Some(field) = begin.input(PORT_DATA) {
                desired.push(((scope.begin.clone(), PORT_DATA.to_string()), field));
            }
        }
        for member_id in &scope.chain {
            if let Some(member) = graph.operator(member_id) {
                for field in member.input_fields() {
                    desired.push(((member_id.clone(), field.name().to_string()), field));
                }
            }
        }

        let mut subs = self.subscriptions.lock();
        let desired_keys: HashSet<&SubscriptionKey> = desired.iter().map(|(k, _)| k).collect();
        subs.retain(|key, (weak, token)| {
            if desired_keys.contains(key) {
                return true;
            }
            if let Some(field) = weak.upgrade() {
                field.unsubscribe(*token);
            }
            false
        });
        drop(desired_keys);

        for (key, field) in desired {
            if subs.contains_key(&key) {
                continue;
            }
            let runner = Arc::downgrade(self);
            let token = field.subscribe(move |_| {
                if let Some(runner) = runner.upgrade() {
                    runner.generation.fetch_add(1, Ordering::SeqCst);
                }
            });
            subs.insert(key, (Arc::downgrade(&field), token));
        }
    }
}

impl Drop for LoopRunner {
    fn drop(&mut self) {
        for (weak, token) in self.subscriptions.lock().values() {
            if let Some(field) = weak.upgrade() {
                field.unsubscribe(*token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldType;
    use crate::kind::{OperatorCategory, OperatorMetadata, PortSpec, SyncCallbackTransform};
    use std::sync::atomic::AtomicUsize;

    fn loop_begin(id: &str) -> Arc<Operator> {
        let metadata = OperatorMetadata {
            type_tag: LOOP_BEGIN.to_string(),
            category: OperatorCategory::Control,
            label: "Loop Begin".to_string(),
            description: String::new(),
            inputs: vec![PortSpec::optional(PORT_DATA, "Data", FieldType::Array)],
            outputs: vec![
                PortSpec::optional(PORT_ITEM, "Item", FieldType::Any),
                PortSpec::optional(PORT_INDEX, "Index", FieldType::Number),
                PortSpec::optional(PORT_TOTAL, "Total", FieldType::Number),
            ],
            cacheable: true,
        };
        Operator::from_metadata(
            id,
            metadata,
            Arc::new(SyncCallbackTransform::new(|inputs| {
                let data = inputs.get(PORT_DATA).cloned().unwrap_or(Value::Null);
                let items = data.as_array().cloned().unwrap_or_default();
                let mut out = OutputMap::new();
                out.insert(PORT_ITEM.to_string(), items.first().cloned().unwrap_or(Value::Null));
                out.insert(PORT_INDEX.to_string(), json!(0));
                out.insert(PORT_TOTAL.to_string(), json!(items.len()));
                Ok(out)
            })),
        )
    }

    fn loop_end(id: &str) -> Arc<Operator> {
        let metadata = OperatorMetadata {
            type_tag: LOOP_END.to_string(),
            category: OperatorCategory::Control,
            label: "Loop End".to_string(),
            description: String::new(),
            inputs: vec![PortSpec::optional(PORT_ITEM, "Item", FieldType::Any)],
            outputs: vec![PortSpec::optional(PORT_ITEMS, "Items", FieldType::Array)],
            cacheable: true,
        };
        Operator::from_metadata(
            id,
            metadata,
            Arc::new(SyncCallbackTransform::new(|_| {
                let mut out = OutputMap::new();
                out.insert(PORT_ITEMS.to_string(), json!([]));
                Ok(out)
            })),
        )
    }

    fn loop_meta(id: &str) -> Arc<Operator> {
        let metadata = OperatorMetadata {
            type_tag: LOOP_META.to_string(),
            category: OperatorCategory::Control,
            label: "Loop Meta".to_string(),
            description: String::new(),
            inputs: vec![
                PortSpec::optional(PORT_CURRENT, "Current Value", FieldType::Any),
                PortSpec::optional(PORT_INITIAL, "Initial Value", FieldType::Any),
            ],
            outputs: vec![
                PortSpec::optional(PORT_ACCUMULATOR, "Accumulator", FieldType::Any),
                PortSpec::optional(PORT_INDEX, "Index", FieldType::Number),
                PortSpec::optional(PORT_TOTAL, "Total", FieldType::Number),
                PortSpec::optional(PORT_IS_FIRST, "Is First", FieldType::Boolean),
                PortSpec::optional(PORT_IS_LAST, "Is Last", FieldType::Boolean),
            ],
            cacheable: true,
        };
        Operator::from_metadata(
            id,
            metadata,
            Arc::new(SyncCallbackTransform::new(|inputs| {
                let mut out = OutputMap::new();
                out.insert(
                    PORT_ACCUMULATOR.to_string(),
                    inputs.get(PORT_INITIAL).cloned().unwrap_or(Value::Null),
                );
                out.insert(PORT_INDEX.to_string(), json!(0));
                out.insert(PORT_TOTAL.to_string(), json!(0));
                out.insert(PORT_IS_FIRST.to_string(), json!(true));
                out.insert(PORT_IS_LAST.to_string(), json!(false));
                Ok(out)
            })),
        )
    }

    fn add_amount(id: &str, amount: f64) -> Arc<Operator> {
        let metadata = OperatorMetadata {
            type_tag: "add-amount".to_string(),
            category: OperatorCategory::Transform,
            label: "Add".to_string(),
            description: String::new(),
            inputs: vec![
                PortSpec::optional("value", "Value", FieldType::Number),
                PortSpec::optional("amount", "Amount", FieldType::Number)
                    .with_default(json!(amount)),
            ],
            outputs: vec![PortSpec::optional("result", "Result", FieldType::Number)],
            cacheable: true,
        };
        Operator::from_metadata(
            id,
            metadata,
            Arc::new(SyncCallbackTransform::new(|inputs| {
                let value = inputs.get("value").and_then(Value::as_f64).unwrap_or(0.0);
                let amount = inputs.get("amount").and_then(Value::as_f64).unwrap_or(0.0);
                let mut out = OutputMap::new();
                out.insert("result".to_string(), json!(value + amount));
                Ok(out)
            })),
        )
    }

    fn array_source(id: &str, data: Value) -> Arc<Operator> {
        let metadata = OperatorMetadata {
            type_tag: "array-source".to_string(),
            category: OperatorCategory::Source,
            label: "Array".to_string(),
            description: String::new(),
            inputs: vec![PortSpec::optional("value", "Value", FieldType::Array).with_default(data)],
            outputs: vec![PortSpec::optional("result", "Result", FieldType::Array)],
            cacheable: true,
        };
        Operator::from_metadata(
            id,
            metadata,
            Arc::new(SyncCallbackTransform::new(|inputs| {
                let mut out = OutputMap::new();
                out.insert(
                    "result".to_string(),
                    inputs.get("value").cloned().unwrap_or(Value::Null),
                );
                Ok(out)
            })),
        )
    }

    /// source -> begin -> step(+1) -> end
    fn build_loop(graph: &Arc<Graph>, data: Value, amount: f64) {
        graph.add_operator(array_source("src", data)).unwrap();
        graph.add_operator(loop_begin("begin")).unwrap();
        graph.add_operator(add_amount("step", amount)).unwrap();
        graph.add_operator(loop_end("end")).unwrap();
        graph.add_edge("src", "result", "begin", PORT_DATA).unwrap();
        graph.add_edge("begin", PORT_ITEM, "step", "value").unwrap();
        graph.add_edge("step", "result", "end", PORT_ITEM).unwrap();
    }

    #[test]
    fn test_detect_scope_with_intermediate() {
        let graph = Graph::new();
        build_loop(&graph, json!([1, 2, 3]), 1.0);

        let scopes = detect_scopes(&graph);
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes[0].begin, "begin");
        assert_eq!(scopes[0].end, "end");
        assert_eq!(scopes[0].chain, vec!["step"]);
        assert!(scopes[0].meta.is_none());
    }

    #[test]
    fn test_detect_degenerate_scope() {
        let graph = Graph::new();
        graph.add_operator(loop_begin("begin")).unwrap();
        graph.add_operator(loop_end("end")).unwrap();
        graph.add_edge("begin", PORT_ITEM, "end", PORT_ITEM).unwrap();

        let scopes = detect_scopes(&graph);
        assert_eq!(scopes.len(), 1);
        assert!(scopes[0].chain.is_empty());
    }

    #[test]
    fn test_detect_meta_via_feedback_wire() {
        let graph = Graph::new();
        build_loop(&graph, json!([1, 2]), 1.0);
        graph.add_operator(loop_meta("meta")).unwrap();
        graph
            .add_edge("step", "result", "meta", PORT_CURRENT)
            .unwrap();

        let scopes = detect_scopes(&graph);
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes[0].meta.as_deref(), Some("meta"));
        assert_eq!(scopes[0].chain, vec!["step"]);
    }

    #[test]
    fn test_end_without_begin_skipped() {
        let graph = Graph::new();
        graph.add_operator(loop_end("end")).unwrap();
        assert!(detect_scopes(&graph).is_empty());
    }

    #[tokio::test]
    async fn test_loop_with_intermediate() {
        let graph = Graph::new();
        build_loop(&graph, json!([1, 2, 3]), 1.0);

        let runner = LoopRunner::new(detect_scopes(&graph).remove(0));
        let result = runner.run(&graph).await.unwrap();
        assert_eq!(result, json!([2.0, 3.0, 4.0]));

        // The end operator is left Clean with the collected array
        let end = graph.operator("end").unwrap();
        assert!(!end.is_dirty());
        assert_eq!(
            end.cached_output().unwrap().get(PORT_ITEMS),
            Some(&json!([2.0, 3.0, 4.0]))
        );
    }

    #[tokio::test]
    async fn test_empty_input_short_circuits() {
        let graph = Graph::new();
        build_loop(&graph, json!([]), 1.0);

        let runner = LoopRunner::new(detect_scopes(&graph).remove(0));
        assert_eq!(runner.run(&graph).await.unwrap(), json!([]));
        let end = graph.operator("end").unwrap();
        assert_eq!(end.cached_output().unwrap().get(PORT_ITEMS), Some(&json!([])));
    }

    #[tokio::test]
    async fn test_non_array_input_short_circuits() {
        let graph = Graph::new();
        graph.add_operator(loop_begin("begin")).unwrap();
        graph.add_operator(loop_end("end")).unwrap();
        graph.add_edge("begin", PORT_ITEM, "end", PORT_ITEM).unwrap();

        let runner = LoopRunner::new(detect_scopes(&graph).remove(0));
        assert_eq!(runner.run(&graph).await.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn test_direct_begin_to_end_collects_every_element() {
        let graph = Graph::new();
        graph
            .add_operator(array_source("src", json!([10, 20, 30, 40, 50])))
            .unwrap();
        graph.add_operator(loop_begin("begin")).unwrap();
        graph.add_operator(loop_end("end")).unwrap();
        graph.add_edge("src", "result", "begin", PORT_DATA).unwrap();
        graph.add_edge("begin", PORT_ITEM, "end", PORT_ITEM).unwrap();

        let runner = LoopRunner::new(detect_scopes(&graph).remove(0));
        assert_eq!(
            runner.run(&graph).await.unwrap(),
            json!([10, 20, 30, 40, 50])
        );
    }

    #[tokio::test]
    async fn test_amount_change_recomputes() {
        let graph = Graph::new();
        build_loop(&graph, json!([1, 2, 3]), 1.0);

        let runner = LoopRunner::new(detect_scopes(&graph).remove(0));
        assert_eq!(runner.run(&graph).await.unwrap(), json!([2.0, 3.0, 4.0]));

        graph
            .operator("step")
            .unwrap()
            .input("amount")
            .unwrap()
            .set_value(json!(10.0))
            .unwrap();
        assert!(runner.has_pending());
        assert_eq!(runner.run(&graph).await.unwrap(), json!([11.0, 12.0, 13.0]));
        assert!(!runner.has_pending());
    }

    #[tokio::test]
    async fn test_synchronous_changes_coalesce_into_one_pass() {
        let graph = Graph::new();
        graph
            .add_operator(array_source("src", json!([1, 2, 3])))
            .unwrap();
        graph.add_operator(loop_begin("begin")).unwrap();
        graph.add_operator(loop_end("end")).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let metadata = OperatorMetadata {
            type_tag: "add-amount".to_string(),
            category: OperatorCategory::Transform,
            label: "Add".to_string(),
            description: String::new(),
            inputs: vec![
                PortSpec::optional("value", "Value", FieldType::Number),
                PortSpec::optional("amount", "Amount", FieldType::Number)
                    .with_default(json!(1.0)),
            ],
            outputs: vec![PortSpec::optional("result", "Result", FieldType::Number)],
            cacheable: true,
        };
        let step = Operator::from_metadata(
            "step",
            metadata,
            Arc::new(SyncCallbackTransform::new(move |inputs| {
                counter.fetch_add(1, Ordering::SeqCst);
                let value = inputs.get("value").and_then(Value::as_f64).unwrap_or(0.0);
                let amount = inputs.get("amount").and_then(Value::as_f64).unwrap_or(0.0);
                let mut out = OutputMap::new();
                out.insert("result".to_string(), json!(value + amount));
                Ok(out)
            })),
        );
        graph.add_operator(step).unwrap();
        graph.add_edge("src", "result", "begin", PORT_DATA).unwrap();
        graph.add_edge("begin", PORT_ITEM, "step", "value").unwrap();
        graph.add_edge("step", "result", "end", PORT_ITEM).unwrap();

        let runner = LoopRunner::new(detect_scopes(&graph).remove(0));
        assert_eq!(runner.run(&graph).await.unwrap(), json!([2.0, 3.0, 4.0]));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Two back-to-back changes collapse into a single extra pass
        let amount = graph.operator("step").unwrap().input("amount").unwrap();
        amount.set_value(json!(5.0)).unwrap();
        amount.set_value(json!(7.0)).unwrap();
        assert!(runner.has_pending());

        assert_eq!(runner.run(&graph).await.unwrap(), json!([8.0, 9.0, 10.0]));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert!(!runner.has_pending());
    }

    #[tokio::test]
    async fn test_accumulator_carries_between_iterations() {
        let graph = Graph::new();
        graph
            .add_operator(array_source("src", json!([1, 2, 3])))
            .unwrap();
        graph.add_operator(loop_begin("begin")).unwrap();
        graph.add_operator(loop_meta("meta")).unwrap();
        graph.add_operator(loop_end("end")).unwrap();

        // step = item + accumulator; running sum carried through meta
        let metadata = OperatorMetadata {
            type_tag: "sum-step".to_string(),
            category: OperatorCategory::Transform,
            label: "Sum".to_string(),
            description: String::new(),
            inputs: vec![
                PortSpec::optional("item", "Item", FieldType::Number),
                PortSpec::optional("acc", "Accumulator", FieldType::Number),
            ],
            outputs: vec![PortSpec::optional("result", "Result", FieldType::Number)],
            cacheable: true,
        };
        let step = Operator::from_metadata(
            "step",
            metadata,
            Arc::new(SyncCallbackTransform::new(|inputs| {
                let item = inputs.get("item").and_then(Value::as_f64).unwrap_or(0.0);
                let acc = inputs.get("acc").and_then(Value::as_f64).unwrap_or(0.0);
                let mut out = OutputMap::new();
                out.insert("result".to_string(), json!(item + acc));
                Ok(out)
            })),
        );
        graph.add_operator(step).unwrap();

        graph.add_edge("src", "result", "begin", PORT_DATA).unwrap();
        graph.add_edge("begin", PORT_ITEM, "step", "item").unwrap();
        graph
            .add_edge("meta", PORT_ACCUMULATOR, "step", "acc")
            .unwrap();
        graph.add_edge("step", "result", "end", PORT_ITEM).unwrap();
        graph
            .add_edge("step", "result", "meta", PORT_CURRENT)
            .unwrap();
        graph
            .operator("meta")
            .unwrap()
            .input(PORT_INITIAL)
            .unwrap()
            .set_value(json!(0.0))
            .unwrap();

        let runner = LoopRunner::new(detect_scopes(&graph).remove(0));
        // 0+1=1, 1+2=3, 3+3=6
        assert_eq!(runner.run(&graph).await.unwrap(), json!([1.0, 3.0, 6.0]));
    }
}
