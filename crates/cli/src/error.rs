use connectors::error::ConnectorError;
use engine_core::error::StateStoreError;
use engine_flows::error::FlowError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Failed to read the configuration file: {0}")]
    ConfigFileRead(#[from] std::io::Error),

    #[error("Failed to parse the configuration file: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Flow failed: {0}")]
    Flow(#[from] FlowError),

    #[error("State store error: {0}")]
    State(#[from] StateStoreError),

    #[error("Shutdown requested")]
    ShutdownRequested,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}
