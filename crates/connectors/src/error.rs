use model::{flow::PeerType, records::stream::StreamError};
use thiserror::Error;

/// All errors surfaced by a connector. Activities classify these to decide
/// between retry and operator escalation.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Low-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any Pg driver error.
    #[error("Pg error: {0}")]
    Pg(#[from] tokio_postgres::Error),

    /// TLS configuration error.
    #[error("TLS configuration error: {0}")]
    Tls(#[from] native_tls::Error),

    /// HTTP transport failure talking to the destination API.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The destination rejected a statement.
    #[error("statement failed ({code}): {message}")]
    Statement { code: String, message: String },

    /// Peer options could not be interpreted by this connector.
    #[error("invalid peer options: {0}")]
    InvalidConfig(String),

    /// The change stream produced bytes we cannot decode. Fatal to the
    /// batch; the offset must not advance past it.
    #[error("undecodable change record: {0}")]
    Corrupt(String),

    /// Schema or data shape the pipeline cannot absorb without an
    /// operator decision.
    #[error("operator intervention required: {0}")]
    Precondition(String),

    /// Record stream failed mid-partition.
    #[error("record stream error: {0}")]
    Stream(#[from] StreamError),

    /// Avro staging failure.
    #[error("Avro error: {0}")]
    Avro(#[from] apache_avro::Error),

    /// Object store (staging upload) failure.
    #[error("object store error: {0}")]
    ObjectStore(String),

    /// Capability sentinel: the peer type has no implementation for the
    /// requested operation. Callers treat this as a no-op, not a failure.
    #[error("{peer:?} peer does not support {capability}")]
    Unsupported {
        peer: PeerType,
        capability: &'static str,
    },
}

impl ConnectorError {
    pub fn unsupported(peer: PeerType, capability: &'static str) -> Self {
        ConnectorError::Unsupported { peer, capability }
    }

    /// Whether the orchestrator should retry the enclosing step.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectorError::Io(_)
            | ConnectorError::Pg(_)
            | ConnectorError::Http(_)
            | ConnectorError::ObjectStore(_) => true,
            ConnectorError::Statement { code, .. } => {
                // Snowflake signals lock/timeout contention with these codes.
                matches!(code.as_str(), "000604" | "000625" | "390114" | "timeout")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_records_are_not_retried() {
        assert!(!ConnectorError::Corrupt("bad tuple".into()).is_transient());
    }

    #[test]
    fn statement_timeouts_are_retried() {
        let err = ConnectorError::Statement {
            code: "000604".into(),
            message: "query cancelled".into(),
        };
        assert!(err.is_transient());
    }
}
