//! Number Source
//!
//! Emits a single configured numeric value.

use std::collections::HashMap;

use async_trait::async_trait;
use flow_engine::{
    ExecuteContext, FieldType, OperatorCategory, OperatorDescriptor, OperatorMetadata, PortSpec,
    Result, Transform,
};
use serde_json::{json, Value};

/// Constant numeric source.
///
/// The value lives on the `value` input field (set from the property
/// panel) and is passed through to `result`.
pub struct NumberSource;

impl NumberSource {
    pub const PORT_VALUE: &'static str = "value";
    pub const PORT_RESULT: &'static str = "result";
}

impl OperatorDescriptor for NumberSource {
    fn descriptor() -> OperatorMetadata {
        OperatorMetadata {
            type_tag: "number-source".to_string(),
            category: OperatorCategory::Source,
            label: "Number".to_string(),
            description: "Emits a configured numeric value".to_string(),
            inputs: vec![
                PortSpec::optional(Self::PORT_VALUE, "Value", FieldType::Number)
                    .with_default(json!(0.0)),
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

inventory::submit!(flow_engine::DescriptorFn(NumberSource::descriptor));

#[async_trait]
impl Transform for NumberSource {
    async fn execute(
        &self,
        _ctx: &ExecuteContext<'_>,
        inputs: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        let value = inputs
            .get(Self::PORT_VALUE)
            .cloned()
            .unwrap_or(json!(0.0));
        let mut outputs = HashMap::new();
        outputs.insert(Self::PORT_RESULT.to_string(), value);
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_engine::Graph;

    #[tokio::test]
    async fn test_emits_configured_value() {
        let registry = crate::builtin_registry();
        let graph = Graph::new();
        let op = registry.instantiate("n", "number-source").unwrap();
        graph.add_operator(op.clone()).unwrap();

        op.input("value").unwrap().set_value(json!(12.5)).unwrap();
        let out = op.pull(&graph).await.unwrap();
        assert_eq!(out.get("result"), Some(&json!(12.5)));
    }

    #[tokio::test]
    async fn test_defaults_to_zero() {
        let registry = crate::builtin_registry();
        let graph = Graph::new();
        let op = registry.instantiate("n", "number-source").unwrap();
        graph.add_operator(op.clone()).unwrap();

        let out = op.pull(&graph).await.unwrap();
        assert_eq!(out.get("result"), Some(&json!(0.0)));
    }
}
