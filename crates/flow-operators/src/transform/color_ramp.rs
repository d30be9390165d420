//! Color Ramp
//!
//! Maps a numeric value onto a color by linear interpolation between
//! hex color stops.

use std::collections::HashMap;

use async_trait::async_trait;
use flow_engine::{
    EngineError, ExecuteContext, FieldType, OperatorCategory, OperatorDescriptor,
    OperatorMetadata, PortSpec, Result, Transform,
};
use serde_json::{json, Value};

/// Linear color ramp over evenly spaced stops.
///
/// `value` is normalized into `[min, max]`; out-of-range values clamp
/// to the first/last stop.
pub struct ColorRamp;

impl ColorRamp {
    pub const PORT_VALUE: &'static str = "value";
    pub const PORT_MIN: &'static str = "min";
    pub const PORT_MAX: &'static str = "max";
    pub const PORT_STOPS: &'static str = "stops";
    pub const PORT_COLOR: &'static str = "color";
}

impl OperatorDescriptor for ColorRamp {
    fn descriptor() -> OperatorMetadata {
        OperatorMetadata {
            type_tag: "color-ramp".to_string(),
            category: OperatorCategory::Transform,
            label: "Color Ramp".to_string(),
            description: "Interpolates a color from a value and hex stops".to_string(),
            inputs: vec![
                PortSpec::required(Self::PORT_VALUE, "Value", FieldType::Number),
                PortSpec::optional(Self::PORT_MIN, "Min", FieldType::Number)
                    .with_default(json!(0.0)),
                PortSpec::optional(Self::PORT_MAX, "Max", FieldType::Number)
                    .with_default(json!(1.0)),
                PortSpec::optional(Self::PORT_STOPS, "Stops", FieldType::Array)
                    .with_default(json!(["#000000", "#ffffff"])),
            ],
            outputs: vec![PortSpec::optional(Self::PORT_COLOR, "Color", FieldType::Color)],
            cacheable: true,
        }
    }
}

inventory::submit!(flow_engine::DescriptorFn(ColorRamp::descriptor));

#[async_trait]
impl Transform for ColorRamp {
    async fn execute(
        &self,
        ctx: &ExecuteContext<'_>,
        inputs: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        let value = inputs
            .get(Self::PORT_VALUE)
            .and_then(Value::as_f64)
            .ok_or_else(|| EngineError::execution(ctx.operator_id, "missing numeric value"))?;
        let min = inputs.get(Self::PORT_MIN).and_then(Value::as_f64).unwrap_or(0.0);
        let max = inputs.get(Self::PORT_MAX).and_then(Value::as_f64).unwrap_or(1.0);

        let stops: Vec<[u8; 3]> = inputs
            .get(Self::PORT_STOPS)
            .and_then(Value::as_array)
            .map(|stops| {
                stops
                    .iter()
                    .map(|s| s.as_str().and_then(parse_hex).ok_or_else(|| {
                        EngineError::UnsupportedFormat(format!("invalid color stop: {}", s))
                    }))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_else(|| vec![[0, 0, 0], [255, 255, 255]]);
        if stops.len() < 2 {
            return Err(EngineError::UnsupportedFormat(
                "a color ramp needs at least two stops".to_string(),
            ));
        }

        let span = max - min;
        let t = if span == 0.0 {
            0.0
        } else {
            ((value - min) / span).clamp(0.0, 1.0)
        };
        let scaled = t * (stops.len() - 1) as f64;
        let lower = scaled.floor() as usize;
        let upper = (lower + 1).min(stops.len() - 1);
        let frac = scaled - lower as f64;

        let mix = |a: u8, b: u8| -> u8 {
            (f64::from(a) + (f64::from(b) - f64::from(a)) * frac).round() as u8
        };
        let color = format!(
            "#{:02x}{:02x}{:02x}",
            mix(stops[lower][0], stops[upper][0]),
            mix(stops[lower][1], stops[upper][1]),
            mix(stops[lower][2], stops[upper][2]),
        );

        let mut outputs = HashMap::new();
        outputs.insert(Self::PORT_COLOR.to_string(), json!(color));
        Ok(outputs)
    }
}

fn parse_hex(s: &str) -> Option<[u8; 3]> {
    let hex = s.strip_prefix('#')?;
    // Length is in bytes; reject non-ASCII before slicing
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some([r, g, b])
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_engine::Graph;

    async fn ramp(value: f64, stops: Value) -> Result<Value> {
        let registry = crate::builtin_registry();
        let graph = Graph::new();
        let op = registry.instantiate("r", "color-ramp").unwrap();
        graph.add_operator(op.clone()).unwrap();
        op.input("value").unwrap().set_value(json!(value)).unwrap();
        op.input("stops").unwrap().set_value(stops).unwrap();
        let out = op.pull(&graph).await?;
        Ok(out.get("color").cloned().unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_endpoints_and_midpoint() {
        let stops = json!(["#000000", "#ffffff"]);
        assert_eq!(ramp(0.0, stops.clone()).await.unwrap(), json!("#000000"));
        assert_eq!(ramp(1.0, stops.clone()).await.unwrap(), json!("#ffffff"));
        assert_eq!(ramp(0.5, stops).await.unwrap(), json!("#808080"));
    }

    #[tokio::test]
    async fn test_out_of_range_clamps() {
        let stops = json!(["#102030", "#405060"]);
        assert_eq!(ramp(-5.0, stops.clone()).await.unwrap(), json!("#102030"));
        assert_eq!(ramp(5.0, stops).await.unwrap(), json!("#405060"));
    }

    #[tokio::test]
    async fn test_invalid_stop_fails() {
        assert!(ramp(0.5, json!(["#000000", "teal"])).await.is_err());
    }

    #[tokio::test]
    async fn test_multibyte_stop_fails_cleanly() {
        // Two euro signs are six bytes but not six hex digits
        let err = ramp(0.5, json!(["#000000", "#€€"])).await.unwrap_err();
        assert!(err.to_string().contains("invalid color stop"));
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("#ff0080"), Some([255, 0, 128]));
        assert_eq!(parse_hex("ff0080"), None);
        assert_eq!(parse_hex("#ff00"), None);
        assert_eq!(parse_hex("#€€"), None);
    }
}
