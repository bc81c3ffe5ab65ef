pub mod cdc;
pub mod context;
pub mod error;
pub mod qrep;
pub mod setup;
