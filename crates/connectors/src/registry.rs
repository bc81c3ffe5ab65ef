use crate::{
    core::{CdcPullConnector, CdcSyncConnector, QRepPullConnector, QRepSyncConnector},
    error::ConnectorError,
    postgres::source::PgSource,
    snowflake::destination::SnowflakeDestination,
};
use model::flow::{Peer, PeerType};

/// What a peer type can do. Callers probe this before dispatching so that
/// missing capabilities become explicit no-ops instead of runtime surprises.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeerCapabilities {
    pub cdc_pull: bool,
    pub cdc_sync: bool,
    pub cdc_normalize: bool,
    pub qrep_pull: bool,
    pub qrep_sync: bool,
    pub qrep_consolidate: bool,
}

pub fn peer_capabilities(kind: PeerType) -> PeerCapabilities {
    match kind {
        PeerType::Postgres => PeerCapabilities {
            cdc_pull: true,
            qrep_pull: true,
            ..Default::default()
        },
        PeerType::Snowflake => PeerCapabilities {
            cdc_sync: true,
            cdc_normalize: true,
            qrep_sync: true,
            qrep_consolidate: true,
            ..Default::default()
        },
        // Recognized peer types without a connector in this build.
        PeerType::Bigquery | PeerType::S3 | PeerType::Eventhub => PeerCapabilities::default(),
    }
}

/// Source connector dispatch, keyed on the peer type.
pub enum SourceConnector {
    Postgres(PgSource),
}

impl SourceConnector {
    pub async fn connect(peer: &Peer) -> Result<Self, ConnectorError> {
        match peer.kind {
            PeerType::Postgres => Ok(SourceConnector::Postgres(PgSource::connect(peer).await?)),
            other => Err(ConnectorError::unsupported(other, "cdc pull")),
        }
    }

    pub fn cdc(&self) -> &dyn CdcPullConnector {
        match self {
            SourceConnector::Postgres(source) => source,
        }
    }

    pub fn qrep(&self) -> &dyn QRepPullConnector {
        match self {
            SourceConnector::Postgres(source) => source,
        }
    }
}

/// Destination connector dispatch, keyed on the peer type.
pub enum DestinationConnector {
    Snowflake(SnowflakeDestination),
}

impl DestinationConnector {
    pub async fn connect(peer: &Peer) -> Result<Self, ConnectorError> {
        match peer.kind {
            PeerType::Snowflake => Ok(DestinationConnector::Snowflake(
                SnowflakeDestination::connect(peer).await?,
            )),
            other => Err(ConnectorError::unsupported(other, "cdc sync")),
        }
    }

    pub fn cdc(&self) -> &dyn CdcSyncConnector {
        match self {
            DestinationConnector::Snowflake(dest) => dest,
        }
    }

    pub fn qrep(&self) -> &dyn QRepSyncConnector {
        match self {
            DestinationConnector::Snowflake(dest) => dest,
        }
    }
}
