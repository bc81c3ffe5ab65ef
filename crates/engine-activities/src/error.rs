use connectors::error::ConnectorError;
use engine_core::error::ActivityError;

/// Folds a connector failure into the runtime's retry taxonomy.
pub fn classify(err: ConnectorError) -> ActivityError {
    match &err {
        ConnectorError::Unsupported { .. } => ActivityError::Unsupported(err.to_string()),
        ConnectorError::Corrupt(_) => ActivityError::Corrupt(err.to_string()),
        ConnectorError::Precondition(_) => ActivityError::Precondition(err.to_string()),
        _ if err.is_transient() => ActivityError::Transient(err.to_string()),
        // Anything else (bad config, codec trouble) needs a human.
        _ => ActivityError::Precondition(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::flow::PeerType;

    #[test]
    fn unsupported_stays_a_sentinel() {
        let err = classify(ConnectorError::unsupported(PeerType::S3, "cdc normalize"));
        assert!(err.is_unsupported());
        assert!(!err.is_retryable());
    }

    #[test]
    fn corrupt_wal_never_retries() {
        let err = classify(ConnectorError::Corrupt("bad tuple".into()));
        assert!(matches!(err, ActivityError::Corrupt(_)));
    }
}
