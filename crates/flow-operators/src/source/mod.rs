//! Data source operators

pub mod clock;
pub mod json_data;
pub mod number;
pub mod sql_query;
