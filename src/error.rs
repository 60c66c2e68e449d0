use thiserror::Error;

/// hzlink error types
#[derive(Error, Debug)]
pub enum HzlinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Malformed message: {0}")]
    Decode(String),

    #[error("Connection {0} is closed")]
    ConnectionClosed(u64),

    #[error("Invocation on connection {connection} timed out after {millis} ms")]
    InvocationTimeout { connection: u64, millis: u64 },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Listener {registration_id} cannot be added: {reason}")]
    RegistrationFailed {
        registration_id: String,
        reason: String,
    },

    #[error("Listener {registration_id} was not confirmed by any connection within {millis} ms")]
    RegistrationTimeout { registration_id: String, millis: u64 },

    /// The reference id counter ran out of range. Handing out another id
    /// would break lock fencing, so this is never retried.
    #[error("Reference id space exhausted")]
    IdentifierExhausted,

    #[error("Client is shut down")]
    ClientShutdown,
}

impl HzlinkError {
    /// Whether the failure is tied to one connection and may succeed on a
    /// later attempt (reconnect, heartbeat restore or refresh sweep).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HzlinkError::Io(_)
                | HzlinkError::Decode(_)
                | HzlinkError::ConnectionClosed(_)
                | HzlinkError::InvocationTimeout { .. }
                | HzlinkError::Remote(_)
        )
    }
}

/// Result type for hzlink operations
pub type Result<T> = std::result::Result<T, HzlinkError>;
