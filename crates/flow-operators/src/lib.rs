//! Built-in operator catalog for Cartoflow
//!
//! Every operator kind describes itself with an
//! [`flow_engine::OperatorMetadata`] and implements
//! [`flow_engine::Transform`]. Descriptors are also collected through
//! `inventory` so palette listings stay in sync with the code;
//! [`register_builtins`] wires metadata and transforms into a registry.

pub mod control;
pub mod geometry;
pub mod layer;
pub mod source;
pub mod transform;

use std::sync::Arc;

use flow_engine::{OperatorDescriptor, OperatorRegistry};

/// Register every built-in kind with its transform
pub fn register_builtins(registry: &mut OperatorRegistry) {
    use crate::control::{loop_begin::LoopBegin, loop_end::LoopEnd, loop_meta::LoopMeta};
    use crate::geometry::{bounds::Bounds, centroid::Centroid};
    use crate::layer::map_layer::MapLayer;
    use crate::source::{
        clock::Clock, json_data::JsonSource, number::NumberSource, sql_query::SqlQuery,
    };
    use crate::transform::{color_ramp::ColorRamp, math::Math};

    registry.register_transform(NumberSource::descriptor(), Arc::new(NumberSource));
    registry.register_transform(JsonSource::descriptor(), Arc::new(JsonSource));
    registry.register_transform(SqlQuery::descriptor(), Arc::new(SqlQuery));
    registry.register_transform(Clock::descriptor(), Arc::new(Clock));
    registry.register_transform(Math::descriptor(), Arc::new(Math));
    registry.register_transform(ColorRamp::descriptor(), Arc::new(ColorRamp));
    registry.register_transform(Bounds::descriptor(), Arc::new(Bounds));
    registry.register_transform(Centroid::descriptor(), Arc::new(Centroid));
    registry.register_transform(MapLayer::descriptor(), Arc::new(MapLayer));
    registry.register_transform(LoopBegin::descriptor(), Arc::new(LoopBegin));
    registry.register_transform(LoopEnd::descriptor(), Arc::new(LoopEnd));
    registry.register_transform(LoopMeta::descriptor(), Arc::new(LoopMeta));
}

/// A registry with every built-in kind ready to instantiate
pub fn builtin_registry() -> OperatorRegistry {
    let mut registry = OperatorRegistry::new();
    register_builtins(&mut registry);
    registry
}
