pub mod batch;
pub mod record;
pub mod stream;
