use thiserror::Error;

/// Failures raised while talking to the NL classifier (LLM endpoint).
#[derive(Error, Debug, Clone)]
pub enum ClassifierError {
    #[error("classifier call timed out")]
    Timeout,

    #[error("classifier transport error: {0}")]
    Transport(String),

    #[error("classifier returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed classifier response: {0}")]
    Malformed(String),
}

impl ClassifierError {
    /// Timeouts, transport failures, 5xx and 429 are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ClassifierError::Timeout | ClassifierError::Transport(_) => true,
            ClassifierError::Status { status, .. } => *status == 429 || *status >= 500,
            ClassifierError::Malformed(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("unsafe SQL rejected: {0}")]
    UnsafeSql(String),

    #[error("references to other schemas are not allowed: {0}")]
    CrossSchemaReference(String),

    #[error("table(s) not found in {schema}: {}", .tables.join(", "))]
    UnknownTables { schema: String, tables: Vec<String> },

    #[error("requested data is not available in schema {schema}")]
    SchemaMismatch {
        schema: String,
        missing_data: Vec<String>,
        suggestions: Vec<String>,
    },

    #[error("clarification session expired")]
    SessionExpired,

    #[error("clarification session not found")]
    SessionNotFound,

    #[error("query execution failed: {0}")]
    Execution(String),

    #[error("classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("audit write failed: {0}")]
    AuditWrite(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid pipeline transition from {from} on {event}")]
    InvalidTransition { from: &'static str, event: &'static str },

    #[error("failed on schema {schema}: {source}")]
    Schema {
        schema: String,
        #[source]
        source: Box<QueryError>,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl QueryError {
    /// Errors that only say "this schema cannot answer", so the next allowed
    /// schema may still succeed.
    pub fn is_retryable_on_other_schema(&self) -> bool {
        match self {
            QueryError::UnknownTables { .. } => true,
            QueryError::Schema { source, .. } => source.is_retryable_on_other_schema(),
            _ => false,
        }
    }

    pub fn tag_schema(self, schema: &str) -> Self {
        match self {
            QueryError::Schema { .. } => self,
            other => QueryError::Schema {
                schema: schema.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Structured reason safe to show to end users. Driver output is reduced
    /// to its category.
    pub fn user_message(&self) -> String {
        match self {
            QueryError::Schema { schema, source } => {
                format!("[{}] {}", schema, source.user_message())
            }
            QueryError::Execution(_) => "The database rejected the generated query".to_string(),
            QueryError::Database(_) | QueryError::Connection(_) => {
                "The tenant database could not be reached".to_string()
            }
            QueryError::Classifier(_) => {
                "The language model is unavailable or returned an invalid answer".to_string()
            }
            QueryError::Json(_) => "An upstream response could not be decoded".to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ClassifierError::Timeout.is_transient());
        assert!(ClassifierError::Status { status: 429, body: String::new() }.is_transient());
        assert!(ClassifierError::Status { status: 503, body: String::new() }.is_transient());
        assert!(!ClassifierError::Status { status: 400, body: String::new() }.is_transient());
        assert!(!ClassifierError::Malformed("x".into()).is_transient());
    }

    #[test]
    fn test_schema_tagging_keeps_retryability() {
        let err = QueryError::UnknownTables {
            schema: "sales".into(),
            tables: vec!["orders".into()],
        }
        .tag_schema("sales");
        assert!(err.is_retryable_on_other_schema());
        assert!(err.user_message().starts_with("[sales]"));
        assert!(!QueryError::UnsafeSql("DROP".into()).is_retryable_on_other_schema());
        assert!(!QueryError::CrossSchemaReference("hr".into()).is_retryable_on_other_schema());
    }

    #[test]
    fn test_user_message_hides_driver_text() {
        let err = QueryError::Execution("You have an error in your SQL syntax near 'x'".into())
            .tag_schema("hr");
        assert_eq!(err.user_message(), "[hr] The database rejected the generated query");
    }
}
