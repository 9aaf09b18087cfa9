/// Structured error carried by the core modules and mapped to the IPC error
/// envelope at the handler edge.
#[derive(Debug, Clone)]
pub struct CoreError {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl CoreError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}
