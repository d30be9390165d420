//! Centroid
//!
//! Vertex-mean centroid of GeoJSON input, emitted as a Point geometry.

use std::collections::HashMap;

use async_trait::async_trait;
use flow_engine::{
    EngineError, ExecuteContext, FieldType, OperatorCategory, OperatorDescriptor,
    OperatorMetadata, PortSpec, Result, Transform,
};
use serde_json::{json, Value};

use super::{geometries, visit_positions};

/// Mean of all vertex positions. A cheap stand-in for a true area
/// centroid, adequate for map centering.
pub struct Centroid;

impl Centroid {
    pub const PORT_GEOJSON: &'static str = "geojson";
    pub const PORT_CENTROID: &'static str = "centroid";
}

impl OperatorDescriptor for Centroid {
    fn descriptor() -> OperatorMetadata {
        OperatorMetadata {
            type_tag: "centroid".to_string(),
            category: OperatorCategory::Geometry,
            label: "Centroid".to_string(),
            description: "Vertex-mean centroid of GeoJSON input".to_string(),
            inputs: vec![PortSpec::required(
                Self::PORT_GEOJSON,
                "GeoJSON",
                FieldType::Json,
            )],
            outputs: vec![PortSpec::optional(
                Self::PORT_CENTROID,
                "Centroid",
                FieldType::Geometry,
            )],
            cacheable: true,
        }
    }
}

inventory::submit!(flow_engine::DescriptorFn(Centroid::descriptor));

#[async_trait]
impl Transform for Centroid {
    async fn execute(
        &self,
        _ctx: &ExecuteContext<'_>,
        inputs: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        let geojson = inputs.get(Self::PORT_GEOJSON).cloned().unwrap_or(Value::Null);

        let (mut sum_lon, mut sum_lat, mut count) = (0.0, 0.0, 0u64);
        for geometry in geometries(&geojson) {
            if let Some(coords) = geometry.get("coordinates") {
                visit_positions(coords, &mut |lon, lat| {
                    sum_lon += lon;
                    sum_lat += lat;
                    count += 1;
                });
            }
        }
        if count == 0 {
            return Err(EngineError::UnsupportedFormat(
                "input contains no coordinates".to_string(),
            ));
        }

        let n = count as f64;
        let mut outputs = HashMap::new();
        outputs.insert(
            Self::PORT_CENTROID.to_string(),
            json!({"type": "Point", "coordinates": [sum_lon / n, sum_lat / n]}),
        );
        Ok(outputs)
    }
}
