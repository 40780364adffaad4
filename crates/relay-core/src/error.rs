//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Channel name was empty or whitespace
    #[error("Channel name must not be empty")]
    EmptyChannelName,

    /// Identity cannot be used to derive a channel name
    #[error("Invalid identity '{identity}': {reason}")]
    InvalidIdentity { identity: String, reason: String },

    /// Per-identity template without exactly one placeholder
    #[error("Invalid channel template '{template}' (expected exactly one '{{}}')")]
    InvalidTemplate { template: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
