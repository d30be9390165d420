//! Operator: a graph node owning fields and a transform
//!
//! Pull execution is the authoritative evaluation model. An operator
//! moves `Dirty -> Computing -> Clean | Error`; `mark_dirty` returns it
//! to `Dirty` from any state. At most one computation is in flight per
//! operator: concurrent pulls park on the compute mutex and observe the
//! finished state instead of re-invoking the transform.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::{try_join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::field::Field;
use crate::graph::Graph;
use crate::kind::{ExecuteContext, OperatorMetadata, Transform};
use crate::scope::ScopeContext;
use crate::{EdgeId, OperatorId};

/// Map of output port name to computed value
pub type OutputMap = HashMap<String, Value>;

/// Memoization status of an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullStatus {
    /// Cache invalid; next pull recomputes
    Dirty,
    /// A computation is in flight
    Computing,
    /// Cached output is valid
    Clean,
    /// The transform failed; persists until an external mark_dirty
    Error,
}

/// Observable execution state, published on a watch channel for the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ExecutionState {
    Idle,
    Executing,
    #[serde(rename_all = "camelCase")]
    Success { duration_ms: u64 },
    #[serde(rename_all = "camelCase")]
    Error { message: String, duration_ms: u64 },
}

struct OperatorState {
    status: PullStatus,
    dirty: bool,
    cached_output: Option<OutputMap>,
    error: Option<String>,
    /// Bumped by every mark_dirty/prime; an in-flight computation that
    /// observes a bump must not mark the operator Clean (stale result).
    epoch: u64,
}

/// A graph node wrapping a transform with named input/output fields.
///
/// Operators are arena-registered in a [`Graph`] and referenced by id;
/// dependency sets hold ids, not pointers, keeping ownership acyclic.
pub struct Operator {
    id: OperatorId,
    metadata: OperatorMetadata,
    transform: Arc<dyn Transform>,
    inputs: HashMap<String, Arc<Field>>,
    outputs: HashMap<String, Arc<Field>>,
    state: Mutex<OperatorState>,
    /// Single-flight guard: one in-flight computation per operator
    compute_lock: tokio::sync::Mutex<()>,
    execution_state: tokio::sync::watch::Sender<ExecutionState>,
    /// UI side channel: edge id -> message; never blocks pull
    connection_errors: Mutex<HashMap<EdgeId, String>>,
    upstream: Mutex<BTreeSet<OperatorId>>,
    downstream: Mutex<BTreeSet<OperatorId>>,
    /// Locked operators are ignored by the continuous preview mode
    locked: AtomicBool,
}

impl Operator {
    /// Build an operator from kind metadata, generating its fields from
    /// the port specs.
    pub fn from_metadata(
        id: impl Into<OperatorId>,
        metadata: OperatorMetadata,
        transform: Arc<dyn Transform>,
    ) -> Arc<Self> {
        let id = id.into();
        let mut inputs = HashMap::new();
        for port in &metadata.inputs {
            let mut field = Field::new(id.clone(), port.id.clone(), port.field_type);
            if let Some(default) = &port.default_value {
                field = field.with_default(default.clone());
            }
            inputs.insert(port.id.clone(), Arc::new(field));
        }
        let mut outputs = HashMap::new();
        for port in &metadata.outputs {
            outputs.insert(
                port.id.clone(),
                Arc::new(Field::new(id.clone(), port.id.clone(), port.field_type)),
            );
        }
        let (execution_state, _) = tokio::sync::watch::channel(ExecutionState::Idle);
        Arc::new(Self {
            id,
            metadata,
            transform,
            inputs,
            outputs,
            state: Mutex::new(OperatorState {
                status: PullStatus::Dirty,
                dirty: true,
                cached_output: None,
                error: None,
                epoch: 0,
            }),
            compute_lock: tokio::sync::Mutex::new(()),
            execution_state,
            connection_errors: Mutex::new(HashMap::new()),
            upstream: Mutex::new(BTreeSet::new()),
            downstream: Mutex::new(BTreeSet::new()),
            locked: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_tag(&self) -> &str {
        &self.metadata.type_tag
    }

    pub fn metadata(&self) -> &OperatorMetadata {
        &self.metadata
    }

    /// Enclosing scope, derived from the slash-separated id path
    pub fn container_id(&self) -> Option<&str> {
        self.id.rsplit_once('/').map(|(parent, _)| parent)
    }

    pub fn input(&self, name: &str) -> Option<Arc<Field>> {
        self.inputs.get(name).cloned()
    }

    pub fn output(&self, name: &str) -> Option<Arc<Field>> {
        self.outputs.get(name).cloned()
    }

    /// Input fields in port order
    pub fn input_fields(&self) -> Vec<Arc<Field>> {
        self.metadata
            .inputs
            .iter()
            .filter_map(|p| self.inputs.get(&p.id).cloned())
            .collect()
    }

    pub fn status(&self) -> PullStatus {
        self.state.lock().status
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Memoized output, if the operator is Clean
    pub fn cached_output(&self) -> Option<OutputMap> {
        self.state.lock().cached_output.clone()
    }

    /// Last recorded error message, if any
    pub fn error_message(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// Subscribe to the observable execution state
    pub fn execution_state(&self) -> tokio::sync::watch::Receiver<ExecutionState> {
        self.execution_state.subscribe()
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Record a connection error for UI feedback; never blocks pull
    pub fn add_connection_error(&self, edge_id: impl Into<EdgeId>, message: impl Into<String>) {
        self.connection_errors
            .lock()
            .insert(edge_id.into(), message.into());
    }

    pub fn remove_connection_error(&self, edge_id: &str) {
        self.connection_errors.lock().remove(edge_id);
    }

    pub fn connection_errors(&self) -> HashMap<EdgeId, String> {
        self.connection_errors.lock().clone()
    }

    /// Invalidate this operator's cache (local flip only; transitive
    /// downstream propagation lives on [`Graph::mark_dirty`]).
    ///
    /// Returns `false` as a no-op when the operator is already Dirty.
    pub fn mark_dirty(&self) -> bool {
        let mut state = self.state.lock();
        if state.dirty && state.status == PullStatus::Dirty {
            return false;
        }
        state.dirty = true;
        state.status = PullStatus::Dirty;
        state.cached_output = None;
        state.error = None;
        state.epoch += 1;
        true
    }

    /// Inject a cached output directly, bypassing recomputation.
    ///
    /// Used by the ForLoop runner so downstream pulls observe the
    /// iteration value instead of recomputing element 0.
    pub fn prime_output(&self, outputs: OutputMap) {
        let mut state = self.state.lock();
        state.cached_output = Some(outputs);
        state.status = PullStatus::Clean;
        state.dirty = false;
        state.error = None;
        state.epoch += 1;
    }

    pub(crate) fn upstream_ids(&self) -> Vec<OperatorId> {
        self.upstream.lock().iter().cloned().collect()
    }

    pub(crate) fn downstream_ids(&self) -> Vec<OperatorId> {
        self.downstream.lock().iter().cloned().collect()
    }

    pub(crate) fn add_dependency(&self, upstream_of: &Operator) {
        // self depends on upstream_of
        self.upstream.lock().insert(upstream_of.id.clone());
        upstream_of.downstream.lock().insert(self.id.clone());
    }

    pub(crate) fn remove_dependency(&self, upstream_of: &Operator) {
        self.upstream.lock().remove(&upstream_of.id);
        upstream_of.downstream.lock().remove(&self.id);
    }

    /// Tear down fields and observables when the node leaves the graph
    pub(crate) fn teardown(&self) {
        for field in self.inputs.values().chain(self.outputs.values()) {
            field.complete();
        }
        let _ = self.execution_state.send(ExecutionState::Idle);
    }

    /// On-demand evaluation: recursively resolve upstream dependencies,
    /// then compute (or reuse the memoized output).
    pub async fn pull(self: &Arc<Self>, graph: &Arc<Graph>) -> Result<OutputMap> {
        self.pull_with_scope(graph, None).await
    }

    /// Pull with an iteration-local scope attached to the transform
    /// context. Upstream dependencies are pulled without the scope.
    pub fn pull_with_scope<'a>(
        self: &'a Arc<Self>,
        graph: &'a Arc<Graph>,
        scope: Option<Arc<ScopeContext>>,
    ) -> BoxFuture<'a, Result<OutputMap>> {
        async move {
            if let Some(cached) = self.try_fast_path()? {
                return Ok(cached);
            }

            let _guard = self.compute_lock.lock().await;
            // A concurrent pull may have finished (or failed) while we
            // were parked on the lock.
            if let Some(cached) = self.try_fast_path()? {
                return Ok(cached);
            }

            let epoch = {
                let mut state = self.state.lock();
                state.status = PullStatus::Computing;
                state.epoch
            };
            let _ = self.execution_state.send(ExecutionState::Executing);
            let started = Instant::now();

            let result = self.compute(graph, scope).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(outputs) => {
                    {
                        let mut state = self.state.lock();
                        if state.epoch == epoch {
                            if self.metadata.cacheable {
                                state.cached_output = Some(outputs.clone());
                                state.status = PullStatus::Clean;
                                state.dirty = false;
                            } else {
                                // Non-cacheable kinds never reach Clean
                                state.status = PullStatus::Dirty;
                                state.dirty = true;
                                state.cached_output = None;
                            }
                        } else {
                            // Dirtied mid-flight: hand the result to the
                            // caller but do not mark Clean with it.
                            log::debug!(
                                "operator '{}' dirtied during computation; result not cached",
                                self.id
                            );
                        }
                    }
                    let _ = self
                        .execution_state
                        .send(ExecutionState::Success { duration_ms });
                    log::debug!("operator '{}' computed in {}ms", self.id, duration_ms);
                    Ok(outputs)
                }
                Err(err) => {
                    let message = err.to_string();
                    {
                        let mut state = self.state.lock();
                        if state.epoch == epoch {
                            state.status = PullStatus::Error;
                            state.cached_output = None;
                            state.error = Some(message.clone());
                        } else {
                            // Dirtied mid-flight: keep the invalidation
                            // instead of latching the stale failure.
                            log::debug!(
                                "operator '{}' dirtied during failing computation; error not recorded",
                                self.id
                            );
                        }
                    }
                    let _ = self.execution_state.send(ExecutionState::Error {
                        message,
                        duration_ms,
                    });
                    log::warn!("operator '{}' failed: {}", self.id, err);
                    Err(err)
                }
            }
        }
        .boxed()
    }

    /// Clean returns the cache, Error fails immediately, otherwise fall
    /// through to computation.
    fn try_fast_path(&self) -> Result<Option<OutputMap>> {
        let state = self.state.lock();
        match state.status {
            PullStatus::Clean => Ok(state.cached_output.clone()),
            PullStatus::Error => Err(EngineError::execution(
                &self.id,
                format!(
                    "operator in error state: {}",
                    state.error.as_deref().unwrap_or("unknown error")
                ),
            )),
            _ => Ok(None),
        }
    }

    async fn compute(
        self: &Arc<Self>,
        graph: &Arc<Graph>,
        scope: Option<Arc<ScopeContext>>,
    ) -> Result<OutputMap> {
        // Fan-out: sibling upstream dependencies are independent
        let upstream_ids = self.upstream_ids();
        let mut pulls = Vec::with_capacity(upstream_ids.len());
        for dep_id in upstream_ids {
            let dep = graph
                .operator(&dep_id)
                .ok_or_else(|| EngineError::OperatorNotFound(dep_id.clone()))?;
            let dep_graph = Arc::clone(graph);
            pulls.push(async move {
                let outputs = dep.pull_with_scope(&dep_graph, None).await?;
                Ok::<_, EngineError>((dep_id, outputs))
            });
        }
        let pulled: HashMap<OperatorId, OutputMap> =
            try_join_all(pulls).await?.into_iter().collect();

        let inputs = graph.resolve_inputs(self, &pulled)?;
        let ctx = ExecuteContext {
            operator_id: &self.id,
            lookup: graph.as_ref(),
            scope: scope.as_deref(),
        };
        self.transform.execute(&ctx, inputs).await
    }
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator")
            .field("id", &self.id)
            .field("type_tag", &self.metadata.type_tag)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldType;
    use crate::kind::{CallbackTransform, OperatorCategory, PortSpec, SyncCallbackTransform};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn metadata(type_tag: &str, cacheable: bool) -> OperatorMetadata {
        OperatorMetadata {
            type_tag: type_tag.to_string(),
            category: OperatorCategory::Source,
            label: type_tag.to_string(),
            description: String::new(),
            inputs: vec![PortSpec::optional("value", "Value", FieldType::Number)
                .with_default(json!(1.0))],
            outputs: vec![PortSpec::optional("result", "Result", FieldType::Number)],
            cacheable,
        }
    }

    fn counting_source(id: &str, calls: Arc<AtomicUsize>, cacheable: bool) -> Arc<Operator> {
        Operator::from_metadata(
            id,
            metadata("counting", cacheable),
            Arc::new(SyncCallbackTransform::new(move |inputs| {
                calls.fetch_add(1, Ordering::SeqCst);
                let mut out = OutputMap::new();
                out.insert(
                    "result".to_string(),
                    inputs.get("value").cloned().unwrap_or(Value::Null),
                );
                Ok(out)
            })),
        )
    }

    #[tokio::test]
    async fn test_pull_caches_and_is_idempotent() {
        let graph = Graph::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let op = counting_source("src", calls.clone(), true);
        graph.add_operator(op.clone()).unwrap();

        let first = op.pull(&graph).await.unwrap();
        let second = op.pull(&graph).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(op.status(), PullStatus::Clean);
        assert!(!op.is_dirty());

        op.mark_dirty();
        op.pull(&graph).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_cacheable_recomputes_every_pull() {
        let graph = Graph::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let op = counting_source("clock", calls.clone(), false);
        graph.add_operator(op.clone()).unwrap();

        op.pull(&graph).await.unwrap();
        op.pull(&graph).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(op.status(), PullStatus::Dirty);
        assert!(op.cached_output().is_none());
    }

    #[tokio::test]
    async fn test_error_state_persists_until_mark_dirty() {
        let graph = Graph::new();
        let op = Operator::from_metadata(
            "bad",
            metadata("bad", true),
            Arc::new(SyncCallbackTransform::new(|_| {
                Err(EngineError::execution("bad", "boom"))
            })),
        );
        graph.add_operator(op.clone()).unwrap();

        assert!(op.pull(&graph).await.is_err());
        assert_eq!(op.status(), PullStatus::Error);
        assert!(op.cached_output().is_none());

        // Still failing, without re-invoking the transform
        let err = op.pull(&graph).await.unwrap_err();
        assert!(err.to_string().contains("error state"));

        op.mark_dirty();
        assert_eq!(op.status(), PullStatus::Dirty);
        assert!(op.error_message().is_none());
    }

    #[tokio::test]
    async fn test_single_flight_shares_one_invocation() {
        let graph = Graph::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let transform = CallbackTransform::from_fn(move |inputs| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                let mut out = OutputMap::new();
                out.insert(
                    "result".to_string(),
                    inputs.get("value").cloned().unwrap_or(Value::Null),
                );
                Ok(out)
            }
        });
        let op = Operator::from_metadata("slow", metadata("slow", true), Arc::new(transform));
        graph.add_operator(op.clone()).unwrap();

        let (a, b) = tokio::join!(op.pull(&graph), op.pull(&graph));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dirty_during_compute_is_not_marked_clean() {
        let graph = Graph::new();
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let (started2, release2) = (started.clone(), release.clone());

        let transform = CallbackTransform::from_fn(move |inputs| {
            let (started, release) = (started2.clone(), release2.clone());
            async move {
                started.notify_one();
                release.notified().await;
                let mut out = OutputMap::new();
                out.insert(
                    "result".to_string(),
                    inputs.get("value").cloned().unwrap_or(Value::Null),
                );
                Ok(out)
            }
        });
        let op = Operator::from_metadata("inflight", metadata("inflight", true), Arc::new(transform));
        graph.add_operator(op.clone()).unwrap();

        let pull_op = op.clone();
        let pull_graph = graph.clone();
        let handle = tokio::spawn(async move { pull_op.pull(&pull_graph).await });

        started.notified().await;
        op.mark_dirty();
        release.notify_one();

        // The caller still gets the fresh result, but the operator must
        // not be Clean with it.
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.get("result"), Some(&json!(1.0)));
        assert!(op.is_dirty());
        assert_ne!(op.status(), PullStatus::Clean);
        assert!(op.cached_output().is_none());
    }

    #[tokio::test]
    async fn test_dirty_during_failing_compute_stays_dirty() {
        let graph = Graph::new();
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let (started2, release2) = (started.clone(), release.clone());

        let transform = CallbackTransform::from_fn(move |_| {
            let (started, release) = (started2.clone(), release2.clone());
            async move {
                started.notify_one();
                release.notified().await;
                Err(EngineError::execution("flaky", "boom"))
            }
        });
        let op = Operator::from_metadata("flaky", metadata("flaky", true), Arc::new(transform));
        graph.add_operator(op.clone()).unwrap();

        let pull_op = op.clone();
        let pull_graph = graph.clone();
        let handle = tokio::spawn(async move { pull_op.pull(&pull_graph).await });

        started.notified().await;
        op.mark_dirty();
        release.notify_one();

        // The caller sees the failure, but the invalidation survives:
        // the operator is Dirty, not latched in Error.
        assert!(handle.await.unwrap().is_err());
        assert_eq!(op.status(), PullStatus::Dirty);
        assert!(op.error_message().is_none());

        // The next pull re-invokes the transform instead of failing fast
        let pull_op = op.clone();
        let pull_graph = graph.clone();
        let handle = tokio::spawn(async move { pull_op.pull(&pull_graph).await });
        started.notified().await;
        release.notify_one();
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(!err.to_string().contains("error state"));
    }

    #[tokio::test]
    async fn test_execution_state_stream() {
        let graph = Graph::new();
        let op = counting_source("src", Arc::new(AtomicUsize::new(0)), true);
        graph.add_operator(op.clone()).unwrap();

        let mut rx = op.execution_state();
        assert_eq!(*rx.borrow(), ExecutionState::Idle);
        op.pull(&graph).await.unwrap();
        rx.changed().await.unwrap();
        assert!(matches!(*rx.borrow(), ExecutionState::Success { .. }));
    }

    #[test]
    fn test_container_id_from_path() {
        let op = counting_source("scene/loop-1/step", Arc::new(AtomicUsize::new(0)), true);
        assert_eq!(op.container_id(), Some("scene/loop-1"));
        let top = counting_source("scene", Arc::new(AtomicUsize::new(0)), true);
        assert_eq!(top.container_id(), None);
    }
}
