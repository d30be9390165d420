//! SQL Query
//!
//! Runs a statement against the shared embedded query backend and emits
//! the result rows as a table.

use std::collections::HashMap;

use async_trait::async_trait;
use flow_engine::{
    EngineError, ExecuteContext, FieldType, OperatorCategory, OperatorDescriptor,
    OperatorMetadata, PortSpec, Result, Transform,
};
use serde_json::Value;

/// Analytical query against the shared in-memory backend
pub struct SqlQuery;

impl SqlQuery {
    pub const PORT_QUERY: &'static str = "query";
    pub const PORT_ROWS: &'static str = "rows";
}

impl OperatorDescriptor for SqlQuery {
    fn descriptor() -> OperatorMetadata {
        OperatorMetadata {
            type_tag: "sql-query".to_string(),
            category: OperatorCategory::Source,
            label: "SQL Query".to_string(),
            description: "Runs a SQL statement against the embedded query backend".to_string(),
            inputs: vec![PortSpec::required(
                Self::PORT_QUERY,
                "Query",
                FieldType::String,
            )],
            outputs: vec![PortSpec::optional(Self::PORT_ROWS, "Rows", FieldType::Table)],
            cacheable: true,
        }
    }
}

inventory::submit!(flow_engine::DescriptorFn(SqlQuery::descriptor));

#[async_trait]
impl Transform for SqlQuery {
    async fn execute(
        &self,
        ctx: &ExecuteContext<'_>,
        inputs: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        let sql = inputs
            .get(Self::PORT_QUERY)
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::execution(ctx.operator_id, "missing query text"))?;

        log::debug!("running query for '{}'", ctx.operator_id);
        let rows = ctx.query_backend().query(sql)?;

        let mut outputs = HashMap::new();
        outputs.insert(Self::PORT_ROWS.to_string(), rows);
        Ok(outputs)
    }
}
