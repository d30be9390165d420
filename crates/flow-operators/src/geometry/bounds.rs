//! Bounds
//!
//! Computes the bounding box of GeoJSON input.

use std::collections::HashMap;

use async_trait::async_trait;
use flow_engine::{
    EngineError, ExecuteContext, FieldType, OperatorCategory, OperatorDescriptor,
    OperatorMetadata, PortSpec, Result, Transform,
};
use serde_json::{json, Value};

use super::{geometries, visit_positions};

/// Bounding box of a FeatureCollection, Feature or geometry, emitted as
/// `[min_lon, min_lat, max_lon, max_lat]`.
pub struct Bounds;

impl Bounds {
    pub const PORT_GEOJSON: &'static str = "geojson";
    pub const PORT_BOUNDS: &'static str = "bounds";
}

impl OperatorDescriptor for Bounds {
    fn descriptor() -> OperatorMetadata {
        OperatorMetadata {
            type_tag: "bounds".to_string(),
            category: OperatorCategory::Geometry,
            label: "Bounds".to_string(),
            description: "Bounding box of GeoJSON input".to_string(),
            inputs: vec![PortSpec::required(
                Self::PORT_GEOJSON,
                "GeoJSON",
                FieldType::Json,
            )],
            outputs: vec![PortSpec::optional(
                Self::PORT_BOUNDS,
                "Bounds",
                FieldType::Array,
            )],
            cacheable: true,
        }
    }
}

inventory::submit!(flow_engine::DescriptorFn(Bounds::descriptor));

#[async_trait]
impl Transform for Bounds {
    async fn execute(
        &self,
        _ctx: &ExecuteContext<'_>,
        inputs: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        let geojson = inputs.get(Self::PORT_GEOJSON).cloned().unwrap_or(Value::Null);

        let mut bounds = (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
        let mut seen = false;
        for geometry in geometries(&geojson) {
            if let Some(coords) = geometry.get("coordinates") {
                visit_positions(coords, &mut |lon, lat| {
                    seen = true;
                    bounds.0 = bounds.0.min(lon);
                    bounds.1 = bounds.1.min(lat);
                    bounds.2 = bounds.2.max(lon);
                    bounds.3 = bounds.3.max(lat);
                });
            }
        }
        if !seen {
            return Err(EngineError::UnsupportedFormat(
                "input contains no coordinates".to_string(),
            ));
        }

        let mut outputs = HashMap::new();
        outputs.insert(
            Self::PORT_BOUNDS.to_string(),
            json!([bounds.0, bounds.1, bounds.2, bounds.3]),
        );
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_engine::Graph;

    #[tokio::test]
    async fn test_feature_collection_bounds() {
        let registry = crate::builtin_registry();
        let graph = Graph::new();
        let op = registry.instantiate("b", "bounds").unwrap();
        graph.add_operator(op.clone()).unwrap();

        let fc = json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "geometry": {"type": "Point", "coordinates": [13.4, 52.5]}},
                {"type": "Feature", "geometry": {"type": "LineString",
                    "coordinates": [[-0.1, 51.5], [2.35, 48.85]]}},
            ]
        });
        op.input("geojson").unwrap().set_value(fc).unwrap();
        let out = op.pull(&graph).await.unwrap();
        assert_eq!(out.get("bounds"), Some(&json!([-0.1, 48.85, 13.4, 52.5])));
    }

    #[tokio::test]
    async fn test_empty_input_fails() {
        let registry = crate::builtin_registry();
        let graph = Graph::new();
        let op = registry.instantiate("b", "bounds").unwrap();
        graph.add_operator(op.clone()).unwrap();

        op.input("geojson")
            .unwrap()
            .set_value(json!({"type": "FeatureCollection", "features": []}))
            .unwrap();
        assert!(op.pull(&graph).await.is_err());
    }
}
