//! Clock
//!
//! Emits the current wall-clock time in milliseconds. Flagged
//! non-cacheable: every pull re-runs the transform.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use flow_engine::{
    EngineError, ExecuteContext, FieldType, OperatorCategory, OperatorDescriptor,
    OperatorMetadata, PortSpec, Result, Transform,
};
use serde_json::{json, Value};

/// Wall-clock time source
pub struct Clock;

impl Clock {
    pub const PORT_TIMESTAMP: &'static str = "timestamp";
}

impl OperatorDescriptor for Clock {
    fn descriptor() -> OperatorMetadata {
        OperatorMetadata {
            type_tag: "clock".to_string(),
            category: OperatorCategory::Source,
            label: "Clock".to_string(),
            description: "Emits the current time in milliseconds".to_string(),
            inputs: vec![],
            outputs: vec![PortSpec::optional(
                Self::PORT_TIMESTAMP,
                "Timestamp",
                FieldType::Number,
            )],
            cacheable: false,
        }
    }
}

inventory::submit!(flow_engine::DescriptorFn(Clock::descriptor));

#[async_trait]
impl Transform for Clock {
    async fn execute(
        &self,
        ctx: &ExecuteContext<'_>,
        _inputs: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| EngineError::execution(ctx.operator_id, e.to_string()))?;
        let mut outputs = HashMap::new();
        outputs.insert(Self::PORT_TIMESTAMP.to_string(), json!(now.as_millis() as u64));
        Ok(outputs)
    }
}
