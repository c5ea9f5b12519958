use serde_json::{json, Value};
use thiserror::Error;

/// Failures a tool reports back to the agent loop as a structured payload.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("Insufficient stock for '{title}'. Available: {available}, Requested: {requested}")]
    InsufficientStock { isbn: String, title: String, available: i64, requested: i64 },
    #[error("store failure: {0}")]
    Store(String),
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::Store(_) => "store_failure",
        }
    }

    pub fn to_payload(&self) -> Value {
        let mut error = json!({ "kind": self.kind(), "message": self.to_string() });
        if let Self::InsufficientStock { isbn, available, requested, .. } = self {
            error["isbn"] = json!(isbn);
            error["available"] = json!(available);
            error["requested"] = json!(requested);
        }
        json!({ "error": error })
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("bad gateway: {message}")]
    BadGateway { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested resource does not exist.",
            Self::BadGateway { .. } => {
                "The assistant could not complete the request. Please try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest { message, .. }
            | Self::NotFound { message, .. }
            | Self::BadGateway { message, .. }
            | Self::ServiceUnavailable { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::BadGateway { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Tool(ToolError::NotFound(message))
            | ApplicationError::NotFound(message) => Self::NotFound { message, correlation_id },
            ApplicationError::Tool(
                error @ (ToolError::InvalidInput(_) | ToolError::InsufficientStock { .. }),
            ) => Self::BadRequest { message: error.to_string(), correlation_id },
            ApplicationError::InvalidRequest(message) => {
                Self::BadRequest { message, correlation_id }
            }
            ApplicationError::Tool(ToolError::Store(message))
            | ApplicationError::Persistence(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Upstream(message) => Self::BadGateway { message, correlation_id },
            ApplicationError::Configuration(message) => Self::Internal { message, correlation_id },
        }
    }
}
