//! Middleware that records requests without touching handler code.
//!
//! Both adapters are [`tower::Layer`]s, so they fit anything built on `http` and tower:
//! hyper services, axum routers, tonic servers and tonic channels.

pub mod grpc;
pub mod http;

pub use self::grpc::{split_method_name, GrpcClientMetricsLayer, GrpcServerMetricsLayer, RpcType};
pub use self::http::HttpMetricsLayer;
