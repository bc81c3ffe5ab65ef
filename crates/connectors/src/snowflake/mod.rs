pub mod client;
pub mod destination;
pub mod jwt;
pub mod qrep;
pub mod sql;
