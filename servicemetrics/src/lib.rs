//! Prometheus metrics for web services, with middleware that records them for you.
//!
//! [`servicemetrics`] wraps the [prometheus] crate with a fixed, useful set of metric
//! families: request counts, bytes sent and received, latency as both a histogram and
//! a summary, state gauges and exception counts. Every sample is labeled with the
//! application and the datacenter it came from.
//!
//! Recording is synchronous and cheap. There is no background pipeline between a
//! `*_log` call and the registry.
//!
//! # Examples
//!
//! `examples/sample.rs` runs a wrapper with its scrape endpoint. The benches under
//! `benches/` show the hot recording paths.
//!
//! # Getting Started
//!
//! Build a [`PrometheusWrapper`] from a [`Config`], record business metrics with its
//! `*_log` methods, and put the [`adapter`] layers in front of your http or grpc
//! services to record requests automatically. Serve the registry with
//! [`PrometheusWrapper::spawn_exposition`] or mount [`exposition::encode_text`] on a
//! route of your own.
//!
//! # Feature Flags
//!
//! - `process` (default): `default_collect` registers cpu, memory and file descriptor
//!   metrics for the process. Linux only.

pub mod adapter;
pub mod body;
pub mod config;
pub mod exposition;
pub mod filter;
pub mod summary;
pub mod wrapper;

mod error;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::Error;
pub use filter::LogFilter;
pub use wrapper::PrometheusWrapper;
