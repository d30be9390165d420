//! Frame-driven graph evaluation
//!
//! The executor walks the graph in topological order once per frame,
//! pulling dirty operators and delegating detected loop spans to their
//! [`LoopRunner`]. A failing operator is logged and skipped; the frame
//! continues best-effort.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventSink, NullEventSink};
use crate::forloop::{detect_scopes, LoopRunner, PORT_ITEMS};
use crate::graph::Graph;
use crate::operator::{OutputMap, PullStatus};
use crate::scope::ScopeContext;
use crate::topo::topological_sort;
use crate::OperatorId;

/// Stats recorded after each frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub node_count: usize,
    pub edge_count: usize,
    /// Operators dirty when the frame started
    pub dirty_count: usize,
    pub last_execution_ms: u64,
}

enum Unit {
    Operator(OperatorId),
    /// Loop span keyed by its end operator
    Scope(OperatorId),
}

/// Drives per-frame evaluation over a [`Graph`]
pub struct GraphExecutor {
    graph: Arc<Graph>,
    sink: Arc<dyn EventSink>,
    runners: Mutex<HashMap<OperatorId, Arc<LoopRunner>>>,
    stats: Mutex<FrameStats>,
}

impl GraphExecutor {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self::with_event_sink(graph, Arc::new(NullEventSink))
    }

    pub fn with_event_sink(graph: Arc<Graph>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            graph,
            sink,
            runners: Mutex::new(HashMap::new()),
            stats: Mutex::new(FrameStats::default()),
        }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Stats of the most recent frame
    pub fn stats(&self) -> FrameStats {
        self.stats.lock().clone()
    }

    /// Flip the given operators and their downstream closure to Dirty
    pub fn mark_dirty(&self, ids: &[OperatorId]) {
        self.graph.mark_dirty(ids);
    }

    /// Namespaced context for iteration-local state
    pub fn create_scope(&self, id: impl Into<String>) -> ScopeContext {
        ScopeContext::new(id, &self.graph)
    }

    /// Pull a single operator on demand. Pulling the end of a loop span
    /// runs the span; other operators pull directly.
    pub async fn pull(&self, id: &str) -> Result<OutputMap> {
        let runner = {
            self.sync_runners();
            self.runners.lock().get(id).cloned()
        };
        if let Some(runner) = runner {
            // A settled span answers from the end node's cache; the loop
            // body re-runs only when an input changed or the end is stale.
            if !runner.has_pending() {
                if let Some(cached) = self
                    .graph
                    .operator(id)
                    .filter(|end| end.status() == PullStatus::Clean)
                    .and_then(|end| end.cached_output())
                {
                    return Ok(cached);
                }
            }
            let items = runner.run(&self.graph).await?;
            let mut out = OutputMap::new();
            out.insert(PORT_ITEMS.to_string(), items);
            return Ok(out);
        }
        let operator = self
            .graph
            .operator(id)
            .ok_or_else(|| EngineError::OperatorNotFound(id.to_string()))?;
        operator.pull(&self.graph).await
    }

    /// Evaluate one frame: detect loop spans, order the graph with each
    /// span as one compound unit, and visit units in order.
    pub async fn execute_frame(&self) -> Result<FrameStats> {
        let started = Instant::now();
        let execution_id = uuid::Uuid::new_v4().to_string();
        self.emit(EngineEvent::FrameStarted {
            execution_id: execution_id.clone(),
        });

        let operators = self.graph.operators();
        let dirty_count = operators.iter().filter(|op| op.is_dirty()).count();

        self.sync_runners();
        let units = self.ordered_units();

        for unit in units {
            match unit {
                Unit::Scope(end_id) => {
                    let runner = self.runners.lock().get(&end_id).cloned();
                    let Some(runner) = runner else { continue };
                    let should_run = runner.has_pending()
                        || self
                            .graph
                            .operator(&end_id)
                            .is_some_and(|end| end.status() != PullStatus::Clean);
                    if !should_run {
                        continue;
                    }
                    match runner.run(&self.graph).await {
                        Ok(items) => {
                            let count = items.as_array().map(Vec::len).unwrap_or(0);
                            self.emit(EngineEvent::LoopPassCompleted {
                                end_operator: end_id,
                                items: count,
                            });
                        }
                        Err(err) => {
                            log::warn!("loop span '{}' failed: {}", end_id, err);
                            self.emit(EngineEvent::OperatorFailed {
                                operator: end_id,
                                message: err.to_string(),
                            });
                        }
                    }
                }
                Unit::Operator(id) => {
                    let Some(operator) = self.graph.operator(&id) else { continue };
                    // Clean and not dirty: nothing to do
                    if operator.status() == PullStatus::Clean && !operator.is_dirty() {
                        continue;
                    }
                    let op_started = Instant::now();
                    match operator.pull(&self.graph).await {
                        Ok(_) => {
                            self.emit(EngineEvent::OperatorCompleted {
                                operator: id,
                                duration_ms: op_started.elapsed().as_millis() as u64,
                            });
                        }
                        Err(err) => {
                            // Downstream pulls will fail on the empty
                            // cache; keep processing remaining units.
                            log::warn!("operator '{}' failed during frame: {}", id, err);
                            self.emit(EngineEvent::OperatorFailed {
                                operator: id,
                                message: err.to_string(),
                            });
                        }
                    }
                }
            }
        }

        let stats = FrameStats {
            node_count: self.graph.operator_count(),
            edge_count: self.graph.edge_count(),
            dirty_count,
            last_execution_ms: started.elapsed().as_millis() as u64,
        };
        *self.stats.lock() = stats.clone();
        self.emit(EngineEvent::FrameCompleted {
            execution_id,
            stats: stats.clone(),
        });
        Ok(stats)
    }

    /// Reconcile loop runners with freshly detected spans
    fn sync_runners(&self) {
        let scopes = detect_scopes(&self.graph);
        let mut runners = self.runners.lock();
        let live: Vec<OperatorId> = scopes.iter().map(|s| s.end.clone()).collect();
        runners.retain(|end, _| live.contains(end));
        for scope in scopes {
            match runners.get(&scope.end) {
                Some(runner) => runner.update_scope(scope),
                None => {
                    let runner = LoopRunner::new(scope);
                    runners.insert(runner.end_id().to_string(), runner);
                }
            }
        }
    }

    /// Topological order with each loop span collapsed into one unit
    fn ordered_units(&self) -> Vec<Unit> {
        let runners = self.runners.lock();
        // member id -> owning unit key (the span's end id)
        let mut unit_of: HashMap<OperatorId, OperatorId> = HashMap::new();
        for runner in runners.values() {
            for member in runner.scope().members() {
                unit_of.insert(member, runner.end_id().to_string());
            }
        }

        let mut nodes: Vec<OperatorId> = Vec::new();
        for op in self.graph.operators() {
            let key = unit_of
                .get(op.id())
                .cloned()
                .unwrap_or_else(|| op.id().to_string());
            if !nodes.contains(&key) {
                nodes.push(key);
            }
        }

        let mut edges: Vec<(OperatorId, OperatorId)> = Vec::new();
        for edge in self.graph.edges() {
            let source = unit_of.get(&edge.source).cloned().unwrap_or(edge.source);
            let target = unit_of.get(&edge.target).cloned().unwrap_or(edge.target);
            if source != target {
                edges.push((source, target));
            }
        }

        let sorted = topological_sort(&nodes, &edges);
        for group in &sorted.cycles {
            log::warn!("skipping cyclic units during frame: {:?}", group);
        }
        sorted
            .order
            .into_iter()
            .map(|key| {
                if runners.contains_key(&key) {
                    Unit::Scope(key)
                } else {
                    Unit::Operator(key)
                }
            })
            .collect()
    }

    fn emit(&self, event: EngineEvent) {
        if let Err(err) = self.sink.emit(event) {
            log::warn!("event sink rejected event: {}", err);
        }
    }
}
