pub mod config;
pub mod consumer;
pub mod error;
pub mod key;
pub mod membership;
pub mod metrics_consts;
pub mod normalize;
pub mod normalizer;
pub mod pool;
pub mod rebuild;
pub mod redis;
pub mod reporter;
pub mod sink;
pub mod stats;
pub mod tailer;
