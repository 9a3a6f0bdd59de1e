use std::collections::HashMap;

/// Names of the request parameters, in the order they are checked
pub const DEFAULT_REQUIRED_PARAMETERS: [&str; 4] = ["database", "select", "from", "callback"];

/// Parameters of one `GET /muster` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestParameters {
    pub database: String,
    pub select: String,
    pub from: String,
    pub where_clause: Option<String>,
    pub order: Option<String>,
    pub callback: String,
}

impl RequestParameters {
    /// Build from a raw parameter map. Missing required values become empty strings,
    /// so callers validate first. Empty optional clauses are treated as absent.
    pub fn from_map(params: &HashMap<String, String>) -> Self {
        let required = |key: &str| params.get(key).cloned().unwrap_or_default();
        let optional = |key: &str| params.get(key).filter(|v| !v.is_empty()).cloned();

        Self {
            database: required("database"),
            select: required("select"),
            from: required("from"),
            where_clause: optional("where"),
            order: optional("order"),
            callback: required("callback"),
        }
    }
}
