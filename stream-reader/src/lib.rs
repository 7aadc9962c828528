pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod metrics_consts;
pub mod reader;
pub mod record;
