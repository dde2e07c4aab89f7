//! Error types for key management
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Key management errors
#[derive(Error, Debug)]
pub enum KmsError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Access denied: {0}")]
    AuthzDenied(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable classification of a [`KmsError`], used in audit details and by
/// the transport layer when choosing a response code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    State,
    AuthzDenied,
    Validation,
    Integrity,
    Provider,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::State => "STATE_ERROR",
            ErrorKind::AuthzDenied => "AUTHZ_DENIED",
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Integrity => "INTEGRITY_ERROR",
            ErrorKind::Provider => "PROVIDER_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl KmsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KmsError::NotFound(_) => ErrorKind::NotFound,
            KmsError::Conflict(_) => ErrorKind::Conflict,
            KmsError::State(_) => ErrorKind::State,
            KmsError::AuthzDenied(_) => ErrorKind::AuthzDenied,
            KmsError::Validation(_) => ErrorKind::Validation,
            KmsError::Integrity(_) => ErrorKind::Integrity,
            KmsError::Provider(_) | KmsError::Timeout(_) => ErrorKind::Provider,
            KmsError::Io(_)
            | KmsError::Serialization(_)
            | KmsError::Configuration(_)
            | KmsError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<keyledger_types::TypesError> for KmsError {
    fn from(err: keyledger_types::TypesError) -> Self {
        KmsError::Validation(err.to_string())
    }
}

impl From<keyledger_config::ConfigError> for KmsError {
    fn from(err: keyledger_config::ConfigError) -> Self {
        KmsError::Configuration(err.to_string())
    }
}

impl From<tokio::task::JoinError> for KmsError {
    fn from(err: tokio::task::JoinError) -> Self {
        KmsError::Internal(format!("background task failed: {}", err))
    }
}

/// Result type for key operations
pub type KmsResult<T> = Result<T, KmsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_a_provider_failure() {
        let err = KmsError::Timeout(Duration::from_millis(250));
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(KmsError::State("x".into()).kind().as_str(), "STATE_ERROR");
        assert_eq!(KmsError::AuthzDenied("x".into()).kind().to_string(), "AUTHZ_DENIED");
    }
}
