pub mod alerts;
pub mod analytics;
pub mod api;
pub mod config;
pub mod control;
pub mod db;
pub mod ingest;
pub mod liveness;
pub mod mqtt;
pub mod reading_cache;
pub mod rejects;
pub mod retry;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod timesync;
pub mod ttl_cache;
pub mod usage;
