//! Geometry helper operators

pub mod bounds;
pub mod centroid;

use serde_json::Value;

/// Visit every `[lon, lat]` position in a GeoJSON coordinates value
pub(crate) fn visit_positions(coords: &Value, visit: &mut impl FnMut(f64, f64)) {
    let Some(array) = coords.as_array() else { return };
    // A position is an array starting with two numbers
    if array.len() >= 2 && array[0].is_number() && array[1].is_number() {
        if let (Some(lon), Some(lat)) = (array[0].as_f64(), array[1].as_f64()) {
            visit(lon, lat);
        }
        return;
    }
    for nested in array {
        visit_positions(nested, visit);
    }
}

/// Iterate the geometries of a FeatureCollection, Feature or bare geometry
pub(crate) fn geometries(geojson: &Value) -> Vec<&Value> {
    match geojson.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => geojson
            .get("features")
            .and_then(Value::as_array)
            .map(|features| features.iter().filter_map(|f| f.get("geometry")).collect())
            .unwrap_or_default(),
        Some("Feature") => geojson.get("geometry").into_iter().collect(),
        Some(_) => vec![geojson],
        None => Vec::new(),
    }
}
