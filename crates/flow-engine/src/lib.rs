//! Pull-based dataflow execution engine for Cartoflow
//!
//! The engine evaluates a mutable graph of operators on demand: each
//! operator memoizes its last output, a dirty flag invalidates the
//! transitive downstream closure, and `pull` recomputes only what is
//! stale. A [`GraphExecutor`] drives whole-graph frames and delegates
//! begin/end loop spans to the ForLoop runner, which re-executes the
//! span once per array element.
//!
//! Operator kinds live outside the engine: they describe themselves
//! with an [`OperatorMetadata`] and implement [`Transform`], and are
//! looked up through an [`OperatorRegistry`] by type tag.

pub mod error;
pub mod events;
pub mod executor;
pub mod field;
pub mod forloop;
pub mod graph;
pub mod kind;
pub mod operator;
pub mod preview;
pub mod query;
pub mod scope;
pub mod topo;

/// Hierarchical operator id; slash segments denote containment
pub type OperatorId = String;
/// Edge id
pub type EdgeId = String;
/// Port (field) name on an operator
pub type PortId = String;

pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventError, EventSink, NullEventSink, VecEventSink};
pub use executor::{FrameStats, GraphExecutor};
pub use field::{Field, FieldType, SubscriberId};
pub use forloop::{detect_scopes, ForLoopScope, LoopRunner};
pub use graph::{Edge, Graph};
pub use kind::{
    CallbackTransform, DescriptorFn, ExecuteContext, OperatorCategory, OperatorDescriptor,
    OperatorLookup, OperatorMetadata, OperatorRegistry, PortSpec, SyncCallbackTransform,
    Transform, TransformFactory,
};
pub use operator::{ExecutionState, Operator, OutputMap, PullStatus};
pub use preview::LivePreview;
pub use query::QueryBackend;
pub use scope::ScopeContext;
pub use topo::{topological_sort, TopoResult};
