//! JSON Source
//!
//! Emits JSON data, either parsed from a text input or taken directly
//! from the `value` input.

use std::collections::HashMap;

use async_trait::async_trait;
use flow_engine::{
    EngineError, ExecuteContext, FieldType, OperatorCategory, OperatorDescriptor,
    OperatorMetadata, PortSpec, Result, Transform,
};
use serde_json::Value;

/// JSON literal source. A non-empty `text` input takes precedence over
/// the structured `value` input; a parse failure is an error.
pub struct JsonSource;

impl JsonSource {
    pub const PORT_TEXT: &'static str = "text";
    pub const PORT_VALUE: &'static str = "value";
    pub const PORT_RESULT: &'static str = "result";
}

impl OperatorDescriptor for JsonSource {
    fn descriptor() -> OperatorMetadata {
        OperatorMetadata {
            type_tag: "json-source".to_string(),
            category: OperatorCategory::Source,
            label: "JSON".to_string(),
            description: "Emits JSON data from text or a structured value".to_string(),
            inputs: vec![
                PortSpec::optional(Self::PORT_TEXT, "Text", FieldType::String),
                PortSpec::optional(Self::PORT_VALUE, "Value", FieldType::Json),
            ],
            outputs: vec![PortSpec::optional(
                Self::PORT_RESULT,
                "Result",
                FieldType::Json,
            )],
            cacheable: true,
        }
    }
}

inventory::submit!(flow_engine::DescriptorFn(JsonSource::descriptor));

#[async_trait]
impl Transform for JsonSource {
    async fn execute(
        &self,
        ctx: &ExecuteContext<'_>,
        inputs: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        let text = inputs
            .get(Self::PORT_TEXT)
            .and_then(Value::as_str)
            .unwrap_or("");
        let value = if text.trim().is_empty() {
            inputs.get(Self::PORT_VALUE).cloned().unwrap_or(Value::Null)
        } else {
            serde_json::from_str(text).map_err(|e| {
                EngineError::execution(ctx.operator_id, format!("invalid JSON text: {}", e))
            })?
        };
        let mut outputs = HashMap::new();
        outputs.insert(Self::PORT_RESULT.to_string(), value);
        Ok(outputs)
    }
}
