use crate::engine::{BootHook, Connection};
use crate::error::EngineError;
use std::sync::Arc;

const EXTENSIONS: [&str; 5] = ["json", "icu", "parquet", "httpfs", "sqlite"];

/// Statements run on every new physical connection.
///
/// Extensions are per connection in the engine, so they cannot be loaded once
/// per handle. Without host access the deployment is hosted and source data is
/// never viewed directly, so insertion order is not preserved to speed up bulk
/// loads.
pub fn boot_queries(allow_host_access: bool) -> Vec<String> {
    let mut queries = Vec::with_capacity(EXTENSIONS.len() * 2 + 3);
    for ext in EXTENSIONS {
        queries.push(format!("INSTALL '{ext}'"));
        queries.push(format!("LOAD '{ext}'"));
    }
    queries.push("SET max_expression_depth TO 250".to_string());
    queries.push("SET timezone='UTC'".to_string());
    if !allow_host_access {
        queries.push("SET preserve_insertion_order TO false".to_string());
    }
    queries
}

pub fn boot_hook(queries: Vec<String>) -> BootHook {
    Arc::new(move |conn: &mut dyn Connection| -> Result<(), EngineError> {
        for query in &queries {
            conn.execute(query)?;
        }
        Ok(())
    })
}
