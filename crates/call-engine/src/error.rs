use thiserror::Error;

/// Call center engine errors
#[derive(Error, Debug)]
pub enum CallCenterError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(String),

    /// Agent-related errors
    #[error("Agent error: {0}")]
    Agent(String),

    /// Queue-related errors
    #[error("Queue error: {0}")]
    Queue(String),

    /// Holding queue is at capacity
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Routing errors
    #[error("Routing error: {0}")]
    Routing(String),

    /// Orchestration errors
    #[error("Orchestration error: {0}")]
    Orchestration(String),

    /// Reconciliation errors
    #[error("Reconciliation error: {0}")]
    Reconciliation(String),

    /// Stored data disagrees with itself (orphaned rows, duplicate live entries)
    #[error("Data inconsistency: {0}")]
    Inconsistency(String),

    /// A conditional update lost its race
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallCenterError {
    /// Create a new Database error
    pub fn database<S: Into<String>>(msg: S) -> Self {
        Self::Database(msg.into())
    }

    /// Create a new Agent error
    pub fn agent<S: Into<String>>(msg: S) -> Self {
        Self::Agent(msg.into())
    }

    /// Create a new Queue error
    pub fn queue<S: Into<String>>(msg: S) -> Self {
        Self::Queue(msg.into())
    }

    /// Create a new QueueFull error
    pub fn queue_full<S: Into<String>>(msg: S) -> Self {
        Self::QueueFull(msg.into())
    }

    /// Create a new Routing error
    pub fn routing<S: Into<String>>(msg: S) -> Self {
        Self::Routing(msg.into())
    }

    /// Create a new Orchestration error
    pub fn orchestration<S: Into<String>>(msg: S) -> Self {
        Self::Orchestration(msg.into())
    }

    /// Create a new Reconciliation error
    pub fn reconciliation<S: Into<String>>(msg: S) -> Self {
        Self::Reconciliation(msg.into())
    }

    /// Create a new Inconsistency error
    pub fn inconsistency<S: Into<String>>(msg: S) -> Self {
        Self::Inconsistency(msg.into())
    }

    /// Create a new Conflict error
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a new Configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new InvalidInput error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new NotFound error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new Internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Transient infrastructure failures; only idempotent reads may be retried on these.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Timeout(_))
    }
}

impl From<sqlx::Error> for CallCenterError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut => Self::Timeout("database pool timed out".to_string()),
            sqlx::Error::ColumnDecode { index, source } => {
                Self::Inconsistency(format!("column {} could not be decoded: {}", index, source))
            }
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CallCenterError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Database(format!("migration failed: {}", err))
    }
}

impl From<serde_json::Error> for CallCenterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for CallCenterError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Result type for call center operations
pub type Result<T> = std::result::Result<T, CallCenterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CallCenterError::database("locked").is_transient());
        assert!(CallCenterError::Timeout("pool".into()).is_transient());
        assert!(!CallCenterError::queue_full("cap 100").is_transient());
        assert!(!CallCenterError::conflict("lost race").is_transient());
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_not_found() {
        let err: CallCenterError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, CallCenterError::NotFound(_)));
    }
}
