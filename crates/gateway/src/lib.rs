pub mod config;
pub mod engine;
pub mod export;
pub mod http;
pub mod lineage;
pub mod metrics;
pub mod pipeline;
pub mod quality;
