use thiserror::Error;
use uuid::Uuid;

/// Scheduler-domain error taxonomy. Transport- and IO-level failures are
/// carried as `anyhow::Error` at the call site (connect, serialize, fs);
/// this enum covers failures that are meaningful to report back to a
/// client or to decide retry/placement behavior on.
#[derive(Debug, Error)]
pub enum DiscoroError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("request to {addr} timed out after {elapsed_ms}ms")]
    TransportTimeout { addr: std::net::SocketAddr, elapsed_ms: u64 },

    #[error("protocol violation from {addr}: {message}")]
    Protocol {
        addr: std::net::SocketAddr,
        message: String,
    },

    #[error("lost contact with peer at {addr}")]
    PeerLoss { addr: std::net::SocketAddr },

    #[error("server at {addr} is a zombie: no pulse for {silent_secs}s")]
    Zombie { addr: std::net::SocketAddr, silent_secs: u64 },

    #[error("file transfer failed for '{file}': {message}")]
    FileTransfer { file: String, message: String },

    #[error("unknown computation auth '{auth}'")]
    UnknownComputation { auth: String },

    #[error("unknown task {task_id}")]
    UnknownTask { task_id: Uuid },

    #[error("no server available to place task '{name}'")]
    NoServerAvailable { name: String },

    #[error("client secret did not match")]
    NotAuthorized,
}

impl DiscoroError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DiscoroError::TransportTimeout { .. } | DiscoroError::NoServerAvailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zombie_and_timeout_are_retryable_classification() {
        let timeout = DiscoroError::TransportTimeout {
            addr: "127.0.0.1:1".parse().unwrap(),
            elapsed_ms: 500,
        };
        assert!(timeout.is_retryable());

        let not_authorized = DiscoroError::NotAuthorized;
        assert!(!not_authorized.is_retryable());
    }

    #[test]
    fn display_messages_are_human_readable() {
        let err = DiscoroError::UnknownComputation {
            auth: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "unknown computation auth 'abc'");
    }
}
