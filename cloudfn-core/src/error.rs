//! API error codes and formatting

use serde::Serialize;
use thiserror::Error;

/// Error codes surfaced at the HTTP boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed or incomplete create/update request
    ValidationError,
    /// Runtime outside the supported set
    UnsupportedRuntime,
    /// Unknown function ID
    NotFound,
    /// The on-disk snapshot could not be written
    PersistenceError,
    /// Anything else that went wrong inside the service
    ServiceException,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "ValidationError",
            Self::UnsupportedRuntime => "UnsupportedRuntimeError",
            Self::NotFound => "NotFoundError",
            Self::PersistenceError => "PersistenceError",
            Self::ServiceException => "ServiceException",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::ValidationError | Self::UnsupportedRuntime => 400,
            Self::NotFound => 404,
            Self::PersistenceError | Self::ServiceException => 500,
        }
    }
}

/// Structured error returned by the management API
#[derive(Debug, Error)]
#[error("{}: {}", .code.as_str(), .message)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub resource: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            resource: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    /// Format as a JSON error body
    pub fn to_json(&self) -> String {
        #[derive(Serialize)]
        struct JsonError<'a> {
            code: &'static str,
            message: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            resource: Option<&'a str>,
        }

        let error = JsonError {
            code: self.code.as_str(),
            message: &self.message,
            resource: self.resource.as_deref(),
        };

        serde_json::to_string(&error).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"internal error"}}"#,
                self.code.as_str()
            )
        })
    }
}
