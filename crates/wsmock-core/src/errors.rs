//! Error taxonomy for the mock server.
//!
//! Every client-facing operation returns [`Result`]. Expected conditions
//! (unknown client, busy port, unserialisable payload) are typed variants;
//! only unexpected listener failures surface as [`MockError::Io`].

use thiserror::Error;

/// Errors returned by mock server operations.
#[derive(Debug, Error)]
pub enum MockError {
    /// No candidate port could be bound within the configured number of attempts.
    #[error("failed to bind a listener after {attempts} attempts (last port {last_port}): {source}")]
    PortBind {
        /// Number of bind attempts made.
        attempts: u32,
        /// The last port that was tried.
        last_port: u16,
        /// The error returned by the final bind attempt.
        #[source]
        source: std::io::Error,
    },

    /// The addressed client is not registered with this instance.
    #[error("client not found: {client_id}")]
    ClientNotFound {
        /// The id that was looked up.
        client_id: String,
    },

    /// The client's worker is not draining its mailbox, so the frame was
    /// dropped instead of queued.
    #[error("mailbox full for client {client_id}, frame dropped")]
    MailboxFull {
        /// The id of the backed-up client.
        client_id: String,
    },

    /// A payload could not be canonically serialised for transmission.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected I/O failure from the listener.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl MockError {
    /// Build a [`MockError::ClientNotFound`] for the given id.
    pub fn client_not_found(client_id: impl Into<String>) -> Self {
        Self::ClientNotFound {
            client_id: client_id.into(),
        }
    }
}

impl From<serde_json::Error> for MockError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}

/// Result type for mock server operations.
pub type Result<T> = std::result::Result<T, MockError>;
