//! nginx-exporter - tails an nginx access log and exports upstream latency to Prometheus.
//!
//! Lines appended to the watched file are parsed into [`parser::LogRecord`]s and observed in a
//! histogram keyed by request URI. See [`pipeline::Pipeline`] for the drain loop.

pub mod config;
pub mod metrics;
pub mod parser;
pub mod pipeline;
pub mod server;
pub mod tailer;
pub mod watcher;
