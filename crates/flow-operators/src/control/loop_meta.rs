//! Loop Meta
//!
//! Exposes iteration metadata and a running accumulator inside a loop
//! span. The `current` input is a feedback wire: the runner reads it at
//! the end of each iteration as the next accumulator seed.

use std::collections::HashMap;

use async_trait::async_trait;
use flow_engine::forloop::{
    PORT_ACCUMULATOR, PORT_CURRENT, PORT_INDEX, PORT_INITIAL, PORT_IS_FIRST, PORT_IS_LAST,
    PORT_TOTAL,
};
use flow_engine::{
    ExecuteContext, FieldType, OperatorCategory, OperatorDescriptor, OperatorMetadata, PortSpec,
    Result, Transform,
};
use serde_json::{json, Value};

/// Accumulator and iteration metadata for a loop span
pub struct LoopMeta;

impl OperatorDescriptor for LoopMeta {
    fn descriptor() -> OperatorMetadata {
        OperatorMetadata {
            type_tag: flow_engine::forloop::LOOP_META.to_string(),
            category: OperatorCategory::Control,
            label: "Loop Meta".to_string(),
            description: "Accumulator and metadata for a loop span".to_string(),
            inputs: vec![
                PortSpec::optional(PORT_CURRENT, "Current Value", FieldType::Any),
                PortSpec::optional(PORT_INITIAL, "Initial Value", FieldType::Any),
            ],
            outputs: vec![
                PortSpec::optional(PORT_ACCUMULATOR, "Accumulator", FieldType::Any),
                PortSpec::optional(PORT_INDEX, "Index", FieldType::Number),
                PortSpec::optional(PORT_TOTAL, "Total", FieldType::Number),
                PortSpec::optional(PORT_IS_FIRST, "Is First", FieldType::Boolean),
                PortSpec::optional(PORT_IS_LAST, "Is Last", FieldType::Boolean),
            ],
            cacheable: true,
        }
    }
}

inventory::submit!(flow_engine::DescriptorFn(LoopMeta::descriptor));

#[async_trait]
impl Transform for LoopMeta {
    async fn execute(
        &self,
        _ctx: &ExecuteContext<'_>,
        inputs: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        // Fallback for a pull outside a loop pass: iteration 0 state
        let mut outputs = HashMap::new();
        outputs.insert(
            PORT_ACCUMULATOR.to_string(),
            inputs.get(PORT_INITIAL).cloned().unwrap_or(Value::Null),
        );
        outputs.insert(PORT_INDEX.to_string(), json!(0));
        outputs.insert(PORT_TOTAL.to_string(), json!(0));
        outputs.insert(PORT_IS_FIRST.to_string(), json!(true));
        outputs.insert(PORT_IS_LAST.to_string(), json!(false));
        Ok(outputs)
    }
}
