//! Map Layer
//!
//! Assembles a renderable layer specification from GeoJSON data and
//! styling inputs.

use std::collections::HashMap;

use async_trait::async_trait;
use flow_engine::{
    EngineError, ExecuteContext, FieldType, OperatorCategory, OperatorDescriptor,
    OperatorMetadata, PortSpec, Result, Transform,
};
use serde_json::{json, Value};

const LAYER_TYPES: &[&str] = &["fill", "line", "circle", "symbol"];

/// Builds a layer spec object consumed by the renderer
pub struct MapLayer;

impl MapLayer {
    pub const PORT_DATA: &'static str = "data";
    pub const PORT_COLOR: &'static str = "color";
    pub const PORT_OPACITY: &'static str = "opacity";
    pub const PORT_LAYER_TYPE: &'static str = "layer_type";
    pub const PORT_LAYER: &'static str = "layer";
}

impl OperatorDescriptor for MapLayer {
    fn descriptor() -> OperatorMetadata {
        OperatorMetadata {
            type_tag: "map-layer".to_string(),
            category: OperatorCategory::Layer,
            label: "Map Layer".to_string(),
            description: "Builds a styled map layer from GeoJSON data".to_string(),
            inputs: vec![
                PortSpec::required(Self::PORT_DATA, "Data", FieldType::Json),
                PortSpec::optional(Self::PORT_COLOR, "Color", FieldType::Color)
                    .with_default(json!("#3388ff")),
                PortSpec::optional(Self::PORT_OPACITY, "Opacity", FieldType::Number)
                    .with_default(json!(0.8)),
                PortSpec::optional(Self::PORT_LAYER_TYPE, "Layer Type", FieldType::String)
                    .with_default(json!("fill")),
            ],
            outputs: vec![PortSpec::optional(
                Self::PORT_LAYER,
                "Layer",
                FieldType::LayerSpec,
            )],
            cacheable: true,
        }
    }
}

inventory::submit!(flow_engine::DescriptorFn(MapLayer::descriptor));

#[async_trait]
impl Transform for MapLayer {
    async fn execute(
        &self,
        ctx: &ExecuteContext<'_>,
        inputs: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        let data = inputs.get(Self::PORT_DATA).cloned().unwrap_or(Value::Null);
        if data.is_null() {
            return Err(EngineError::execution(ctx.operator_id, "missing layer data"));
        }
        let layer_type = inputs
            .get(Self::PORT_LAYER_TYPE)
            .and_then(Value::as_str)
            .unwrap_or("fill");
        if !LAYER_TYPES.contains(&layer_type) {
            return Err(EngineError::UnsupportedFormat(format!(
                "unknown layer type '{}'",
                layer_type
            )));
        }
        let color = inputs
            .get(Self::PORT_COLOR)
            .and_then(Value::as_str)
            .unwrap_or("#3388ff");
        let opacity = inputs
            .get(Self::PORT_OPACITY)
            .and_then(Value::as_f64)
            .unwrap_or(0.8)
            .clamp(0.0, 1.0);

        let mut outputs = HashMap::new();
        outputs.insert(
            Self::PORT_LAYER.to_string(),
            json!({
                "id": ctx.operator_id,
                "type": layer_type,
                "source": {"type": "geojson", "data": data},
                "paint": {"color": color, "opacity": opacity},
            }),
        );
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_engine::Graph;

    #[tokio::test]
    async fn test_builds_layer_spec() {
        let registry = crate::builtin_registry();
        let graph = Graph::new();
        let op = registry.instantiate("layer-1", "map-layer").unwrap();
        graph.add_operator(op.clone()).unwrap();

        let fc = json!({"type": "FeatureCollection", "features": []});
        op.input("data").unwrap().set_value(fc.clone()).unwrap();
        let out = op.pull(&graph).await.unwrap();

        let layer = out.get("layer").unwrap();
        assert_eq!(layer["id"], "layer-1");
        assert_eq!(layer["type"], "fill");
        assert_eq!(layer["source"]["data"], fc);
        assert_eq!(layer["paint"]["color"], "#3388ff");
    }

    #[tokio::test]
    async fn test_unknown_layer_type_fails() {
        let registry = crate::builtin_registry();
        let graph = Graph::new();
        let op = registry.instantiate("layer-1", "map-layer").unwrap();
        graph.add_operator(op.clone()).unwrap();

        op.input("data").unwrap().set_value(json!({"type": "FeatureCollection", "features": []})).unwrap();
        op.input("layer_type").unwrap().set_value(json!("hologram")).unwrap();
        assert!(op.pull(&graph).await.is_err());
    }
}
