//! Loop Begin
//!
//! Opens a ForLoop span: takes the array to iterate and exposes the
//! current element, index and total to the span.

use std::collections::HashMap;

use async_trait::async_trait;
use flow_engine::forloop::{PORT_DATA, PORT_INDEX, PORT_ITEM, PORT_TOTAL};
use flow_engine::{
    ExecuteContext, FieldType, OperatorCategory, OperatorDescriptor, OperatorMetadata, PortSpec,
    Result, Transform,
};
use serde_json::{json, Value};

/// Loop span opener. During a loop pass the runner primes `item`,
/// `index` and `total` directly; the transform below is the fallback
/// for a direct pull and yields element 0.
pub struct LoopBegin;

impl OperatorDescriptor for LoopBegin {
    fn descriptor() -> OperatorMetadata {
        OperatorMetadata {
            type_tag: flow_engine::forloop::LOOP_BEGIN.to_string(),
            category: OperatorCategory::Control,
            label: "Loop Begin".to_string(),
            description: "Opens a loop span over an array".to_string(),
            inputs: vec![PortSpec::optional(PORT_DATA, "Data", FieldType::Array)],
            outputs: vec![
                PortSpec::optional(PORT_ITEM, "Item", FieldType::Any),
                PortSpec::optional(PORT_INDEX, "Index", FieldType::Number),
                PortSpec::optional(PORT_TOTAL, "Total", FieldType::Number),
            ],
            cacheable: true,
        }
    }
}

inventory::submit!(flow_engine::DescriptorFn(LoopBegin::descriptor));

#[async_trait]
impl Transform for LoopBegin {
    async fn execute(
        &self,
        _ctx: &ExecuteContext<'_>,
        inputs: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        let data = inputs.get(PORT_DATA).cloned().unwrap_or(Value::Null);
        let items = data.as_array().cloned().unwrap_or_default();

        let mut outputs = HashMap::new();
        outputs.insert(
            PORT_ITEM.to_string(),
            items.first().cloned().unwrap_or(Value::Null),
        );
        outputs.insert(PORT_INDEX.to_string(), json!(0));
        outputs.insert(PORT_TOTAL.to_string(), json!(items.len()));
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_engine::Graph;

    #[tokio::test]
    async fn test_direct_pull_yields_first_element() {
        let registry = crate::builtin_registry();
        let graph = Graph::new();
        let op = registry.instantiate("begin", "loop-begin").unwrap();
        graph.add_operator(op.clone()).unwrap();

        op.input(PORT_DATA).unwrap().set_value(json!([7, 8, 9])).unwrap();
        let out = op.pull(&graph).await.unwrap();
        assert_eq!(out.get(PORT_ITEM), Some(&json!(7)));
        assert_eq!(out.get(PORT_TOTAL), Some(&json!(3)));
    }
}
