pub mod backoff;
pub mod config;
pub mod health;
pub mod logfile;
pub mod metrics;
pub mod metrics_consts;
pub mod signals;
