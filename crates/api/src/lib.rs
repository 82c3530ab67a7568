//! HTTP API: administrative surface of the delivery pipeline.

pub mod app;
pub mod middleware;
