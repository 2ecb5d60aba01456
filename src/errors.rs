use thiserror::Error;

/// Top-level application error.
/// All variants carry a human-readable message for display/logging.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Database errors ──────────────────────────────────────────────────────
    #[error("Database connection failed: {0}")]
    DatabaseConnectionFailed(#[source] sqlx::Error),

    #[error("Database query failed: {message}")]
    DatabaseQueryFailed {
        message: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Record not found: {entity_type} with id '{id}'")]
    RecordNotFound { entity_type: String, id: String },

    // ── Upstream (model / embeddings API) errors ─────────────────────────────
    #[error("Upstream API error (status {status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Upstream API unreachable: {message}")]
    UpstreamUnavailable { message: String },

    #[error("Upstream authentication failed: {message}")]
    Authentication { message: String },

    #[error("Rate limited by upstream API")]
    RateLimited,

    #[error("Model '{model_name}' not found")]
    ModelNotFound { model_name: String },

    #[error("Inference error: {message}")]
    InferenceError { message: String },

    // ── Validation errors ────────────────────────────────────────────────────
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    #[error("Field '{field_name}' exceeds max length of {max_length} (actual: {actual_length})")]
    FieldTooLong { field_name: String, max_length: usize, actual_length: usize },

    #[error("Invalid ID format: '{id}'")]
    InvalidId { id: String },

    #[error("Invalid value for '{field_name}': {message}")]
    InvalidValue { field_name: String, message: String },

    // ── Conversation errors ──────────────────────────────────────────────────
    #[error("Conversation '{id}' not found")]
    ConversationNotFound { id: String },

    #[error("A response is already being generated for conversation '{id}'")]
    StreamAlreadyActive { id: String },

    #[error("Canvas already exists for conversation '{conversation_id}'")]
    CanvasExists { conversation_id: String },

    // ── Tool errors ──────────────────────────────────────────────────────────
    #[error("Unknown tool: {name}")]
    ToolNotFound { name: String },

    #[error("Tool '{tool_name}' failed: {message}")]
    ToolExecution { tool_name: String, message: String },

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Feature unavailable: {0}")]
    Unavailable(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn db_query(message: impl Into<String>, source: sqlx::Error) -> Self {
        AppError::DatabaseQueryFailed { message: message.into(), source }
    }

    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::ToolExecution { tool_name: tool_name.into(), message: message.into() }
    }

    /// Classifies a non-success HTTP status from an OpenAI-compatible API.
    pub fn from_status(status: u16, body: &str, model: &str) -> Self {
        match status {
            401 | 403 => AppError::Authentication { message: truncate_body(body) },
            404 => AppError::ModelNotFound { model_name: model.to_string() },
            429 => AppError::RateLimited,
            _ => AppError::Upstream { status, message: truncate_body(body) },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AppError::ConversationNotFound { .. } | AppError::RecordNotFound { .. }
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AppError::EmptyField { .. }
                | AppError::FieldTooLong { .. }
                | AppError::InvalidId { .. }
                | AppError::InvalidValue { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::StreamAlreadyActive { .. } | AppError::CanvasExists { .. })
    }

    pub fn is_agent_unavailable(&self) -> bool {
        matches!(self, AppError::UpstreamUnavailable { .. } | AppError::Unavailable(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, AppError::Authentication { .. })
    }

    /// Failures worth retrying later: rate limits, 5xx, network trouble.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::RateLimited | AppError::UpstreamUnavailable { .. } => true,
            AppError::Upstream { status, .. } => *status >= 500 || *status == 408,
            _ => false,
        }
    }

    /// Failures that will not go away by waiting: unknown model, rejected request shape.
    pub fn is_permanent(&self) -> bool {
        match self {
            AppError::ModelNotFound { .. } => true,
            AppError::Upstream { status, .. } => matches!(status, 400 | 404 | 422),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            AppError::Upstream { status: status.as_u16(), message: err.to_string() }
        } else {
            AppError::UpstreamUnavailable { message: err.to_string() }
        }
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 500;
    if body.chars().count() > MAX {
        format!("{}…", body.chars().take(MAX).collect::<String>())
    } else {
        body.to_string()
    }
}
