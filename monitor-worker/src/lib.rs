pub mod analysis;
pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod ingest;
pub mod pipeline;
pub mod policy;
pub mod test_utils;
