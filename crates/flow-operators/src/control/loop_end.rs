//! Loop End
//!
//! Closes a ForLoop span and collects one value per iteration.

use std::collections::HashMap;

use async_trait::async_trait;
use flow_engine::forloop::{PORT_ITEM, PORT_ITEMS};
use flow_engine::{
    ExecuteContext, FieldType, OperatorCategory, OperatorDescriptor, OperatorMetadata, PortSpec,
    Result, Transform,
};
use serde_json::{json, Value};

/// Loop span collector. The runner primes `items` with the collected
/// array after each pass; the fallback transform wraps the single
/// current `item`.
pub struct LoopEnd;

impl OperatorDescriptor for LoopEnd {
    fn descriptor() -> OperatorMetadata {
        OperatorMetadata {
            type_tag: flow_engine::forloop::LOOP_END.to_string(),
            category: OperatorCategory::Control,
            label: "Loop End".to_string(),
            description: "Collects one value per loop iteration".to_string(),
            inputs: vec![PortSpec::optional(PORT_ITEM, "Item", FieldType::Any)],
            outputs: vec![PortSpec::optional(PORT_ITEMS, "Items", FieldType::Array)],
            cacheable: true,
        }
    }
}

inventory::submit!(flow_engine::DescriptorFn(LoopEnd::descriptor));

#[async_trait]
impl Transform for LoopEnd {
    async fn execute(
        &self,
        _ctx: &ExecuteContext<'_>,
        inputs: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        let item = inputs.get(PORT_ITEM).cloned().unwrap_or(Value::Null);
        let items = if item.is_null() { json!([]) } else { json!([item]) };

        let mut outputs = HashMap::new();
        outputs.insert(PORT_ITEMS.to_string(), items);
        Ok(outputs)
    }
}
