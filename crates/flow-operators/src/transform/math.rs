//! Math
//!
//! Binary arithmetic on two numeric inputs.

use std::collections::HashMap;

use async_trait::async_trait;
use flow_engine::{
    EngineError, ExecuteContext, FieldType, OperatorCategory, OperatorDescriptor,
    OperatorMetadata, PortSpec, Result, Transform,
};
use serde_json::{json, Value};

/// Binary arithmetic operator. The `op` input selects the operation:
/// `add`, `subtract`, `multiply` or `divide`.
pub struct Math;

impl Math {
    pub const PORT_A: &'static str = "a";
    pub const PORT_B: &'static str = "b";
    pub const PORT_OP: &'static str = "op";
    pub const PORT_RESULT: &'static str = "result";
}

impl OperatorDescriptor for Math {
    fn descriptor() -> OperatorMetadata {
        OperatorMetadata {
            type_tag: "math".to_string(),
            category: OperatorCategory::Transform,
            label: "Math".to_string(),
            description: "Binary arithmetic on two numbers".to_string(),
            inputs: vec![
                PortSpec::optional(Self::PORT_A, "A", FieldType::Number).with_default(json!(0.0)),
                PortSpec::optional(Self::PORT_B, "B", FieldType::Number).with_default(json!(0.0)),
                PortSpec::optional(Self::PORT_OP, "Operation", FieldType::String)
                    .with_default(json!("add")),
            ],
            outputs: vec![PortSpec::optional(
                Self::PORT_RESULT,
                "Result",
                FieldType::Number,
            )],
            cacheable: true,
        }
    }
}

inventory::submit!(flow_engine::DescriptorFn(Math::descriptor));

#[async_trait]
impl Transform for Math {
    async fn execute(
        &self,
        ctx: &ExecuteContext<'_>,
        inputs: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        let a = inputs.get(Self::PORT_A).and_then(Value::as_f64).unwrap_or(0.0);
        let b = inputs.get(Self::PORT_B).and_then(Value::as_f64).unwrap_or(0.0);
        let op = inputs
            .get(Self::PORT_OP)
            .and_then(Value::as_str)
            .unwrap_or("add");

        let result = match op {
            "add" => a + b,
            "subtract" => a - b,
            "multiply" => a * b,
            "divide" => {
                if b == 0.0 {
                    return Err(EngineError::execution(ctx.operator_id, "division by zero"));
                }
                a / b
            }
            other => {
                return Err(EngineError::UnsupportedFormat(format!(
                    "unknown math operation '{}'",
                    other
                )))
            }
        };

        let mut outputs = HashMap::new();
        outputs.insert(Self::PORT_RESULT.to_string(), json!(result));
        Ok(outputs)
    }
}
