pub mod app;
pub mod clock;
pub mod config;
pub mod ingest;
pub mod limiter;
pub mod metrics;
pub mod retry;
pub mod worker;
