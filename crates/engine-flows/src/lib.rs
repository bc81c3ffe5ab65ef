pub mod cdc;
pub mod error;
pub mod qrep;
pub mod snapshot;
