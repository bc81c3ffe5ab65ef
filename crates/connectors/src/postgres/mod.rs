pub mod client;
pub mod decoder;
pub mod qrep;
pub mod source;
pub mod values;
