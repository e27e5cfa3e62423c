//! Interceptors for grpc servers and clients.
//!
//! A grpc call is an http/2 request to `/package.Service/Method`. Its outcome is the
//! `grpc-status` trailer, or a `grpc-status` header on a trailers-only response, so a
//! call is recorded only once its response body is over. A response with neither that
//! did not come back `200 OK` never reached a grpc handler, and its http status decides
//! the code.

use std::{
    collections::HashMap,
    fmt::Display,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
    time::Instant,
};

use http::{Request, Response, StatusCode};
use http_body::Body;
use tonic::Code;
use tower::{Layer, Service};

use crate::{
    body::{BodyCompletion, BodyEnd, CompletionBody, EndState},
    PrometheusWrapper,
};

/// The shape of a grpc method. Used as the `method` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RpcType {
    #[default]
    Unary,
    ClientStream,
    ServerStream,
    BidiStream,
}

impl RpcType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcType::Unary => "unary",
            RpcType::ClientStream => "client_stream",
            RpcType::ServerStream => "server_stream",
            RpcType::BidiStream => "bidi_stream",
        }
    }
}

impl Display for RpcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split `/package.Service/Method` into `("package.Service", "Method")`.
///
/// The leading `/` is optional and the split is at the first `/` after it. Names with no
/// `/` to split at are `("unknown", "unknown")`.
///
/// ```
/// use servicemetrics::adapter::split_method_name;
///
/// assert_eq!(
///     ("helloworld.Greeter", "SayHello"),
///     split_method_name("/helloworld.Greeter/SayHello")
/// );
/// assert_eq!(("unknown", "unknown"), split_method_name("garbage"));
/// ```
pub fn split_method_name(full_method: &str) -> (&str, &str) {
    let name = full_method.strip_prefix('/').unwrap_or(full_method);
    name.split_once('/').unwrap_or(("unknown", "unknown"))
}

/// The canonical name of a grpc status code, as grpc implementations print it.
pub fn code_name(code: Code) -> &'static str {
    match i32::from(code) {
        0 => "OK",
        1 => "Canceled",
        2 => "Unknown",
        3 => "InvalidArgument",
        4 => "DeadlineExceeded",
        5 => "NotFound",
        6 => "AlreadyExists",
        7 => "PermissionDenied",
        8 => "ResourceExhausted",
        9 => "FailedPrecondition",
        10 => "Aborted",
        11 => "OutOfRange",
        12 => "Unimplemented",
        13 => "Internal",
        14 => "Unavailable",
        15 => "DataLoss",
        16 => "Unauthenticated",
        _ => "Unknown",
    }
}

/// The code of a response that carries no grpc status, from its http status.
fn code_from_http_status(status: StatusCode) -> Code {
    match status {
        StatusCode::OK => Code::Ok,
        StatusCode::BAD_REQUEST => Code::Internal,
        StatusCode::UNAUTHORIZED => Code::Unauthenticated,
        StatusCode::FORBIDDEN => Code::PermissionDenied,
        StatusCode::NOT_FOUND => Code::Unimplemented,
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => Code::Unavailable,
        _ => Code::Unknown,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Server,
    Client,
}

/// Method shapes, by full method name. Unlisted methods are unary.
#[derive(Debug, Clone, Default)]
struct RpcTypes(Arc<HashMap<String, RpcType>>);

impl RpcTypes {
    fn with(mut self, full_method: String, rpc_type: RpcType) -> Self {
        Arc::make_mut(&mut self.0).insert(full_method, rpc_type);
        self
    }

    fn get(&self, full_method: &str) -> RpcType {
        self.0.get(full_method).copied().unwrap_or_default()
    }
}

/// Records the calls a grpc server handles.
///
/// ```
/// use std::sync::Arc;
/// use servicemetrics::{
///     adapter::{GrpcServerMetricsLayer, RpcType},
///     Config, PrometheusWrapper,
/// };
///
/// let metrics = PrometheusWrapper::new(Config::new("example")).expect("config is valid");
/// let metrics = Arc::new(metrics);
/// let layer = GrpcServerMetricsLayer::new(metrics)
///     .with_rpc_type("/routeguide.RouteGuide/ListFeatures", RpcType::ServerStream);
/// // tonic::transport::Server::builder().layer(layer)
/// # let _ = layer;
/// ```
#[derive(Clone)]
pub struct GrpcServerMetricsLayer {
    metrics: Arc<PrometheusWrapper>,
    rpc_types: RpcTypes,
}

impl GrpcServerMetricsLayer {
    pub fn new(metrics: Arc<PrometheusWrapper>) -> Self {
        Self {
            metrics,
            rpc_types: Default::default(),
        }
    }

    /// Declare the shape of a streaming method.
    pub fn with_rpc_type(self, full_method: impl Into<String>, rpc_type: RpcType) -> Self {
        Self {
            rpc_types: self.rpc_types.with(full_method.into(), rpc_type),
            ..self
        }
    }
}

impl<S> Layer<S> for GrpcServerMetricsLayer {
    type Service = GrpcMetrics<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcMetrics {
            inner,
            metrics: self.metrics.clone(),
            rpc_types: self.rpc_types.clone(),
            side: Side::Server,
        }
    }
}

/// Records the calls a grpc client makes.
///
/// Wrap a channel with it: `tower::ServiceBuilder::new().layer(layer).service(channel)`.
#[derive(Clone)]
pub struct GrpcClientMetricsLayer {
    metrics: Arc<PrometheusWrapper>,
    rpc_types: RpcTypes,
}

impl GrpcClientMetricsLayer {
    pub fn new(metrics: Arc<PrometheusWrapper>) -> Self {
        Self {
            metrics,
            rpc_types: Default::default(),
        }
    }

    /// Declare the shape of a streaming method.
    pub fn with_rpc_type(self, full_method: impl Into<String>, rpc_type: RpcType) -> Self {
        Self {
            rpc_types: self.rpc_types.with(full_method.into(), rpc_type),
            ..self
        }
    }
}

impl<S> Layer<S> for GrpcClientMetricsLayer {
    type Service = GrpcMetrics<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcMetrics {
            inner,
            metrics: self.metrics.clone(),
            rpc_types: self.rpc_types.clone(),
            side: Side::Client,
        }
    }
}

/// The service made by the grpc layers.
#[derive(Clone)]
pub struct GrpcMetrics<S> {
    inner: S,
    metrics: Arc<PrometheusWrapper>,
    rpc_types: RpcTypes,
    side: Side,
}

impl<S, RequestBody, ResponseBody> Service<Request<RequestBody>> for GrpcMetrics<S>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>>,
    ResponseBody: Body,
{
    type Response = Response<CompletionBody<ResponseBody, GrpcCompletion>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, context: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(context)
    }

    fn call(&mut self, request: Request<RequestBody>) -> Self::Future {
        let full_method = request.uri().path().to_string();
        let call = GrpcCall {
            metrics: self.metrics.clone(),
            rpc_type: self.rpc_types.get(&full_method),
            full_method,
            side: self.side,
            start: Instant::now(),
        };
        ResponseFuture {
            inner: Box::pin(self.inner.call(request)),
            call: Some(call),
        }
    }
}

/// One call in flight.
struct GrpcCall {
    metrics: Arc<PrometheusWrapper>,
    full_method: String,
    rpc_type: RpcType,
    side: Side,
    start: Instant,
}

impl GrpcCall {
    fn record(self, code: Code, response_bytes: u64) {
        let code = code_name(code);
        let (service, method) = split_method_name(&self.full_method);
        let rpc_type = self.rpc_type.as_str();
        let metrics = &self.metrics;

        if code != "OK" {
            metrics.exception_log(&self.full_method, code);
        }
        metrics.summary_latency_log(service, method, rpc_type, self.start.elapsed());
        metrics.request_log(service, method, rpc_type, code);
        match self.side {
            Side::Server => {
                metrics.send_bytes_log(service, method, rpc_type, code, response_bytes)
            }
            Side::Client => {
                metrics.rcvd_bytes_log(service, method, rpc_type, code, response_bytes)
            }
        }
    }
}

/// Waits for the response head, then hands the call to the response body.
pub struct ResponseFuture<F> {
    inner: Pin<Box<F>>,
    call: Option<GrpcCall>,
}

impl<F, ResponseBody, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<ResponseBody>, E>>,
    ResponseBody: Body,
{
    type Output = Result<Response<CompletionBody<ResponseBody, GrpcCompletion>>, E>;

    fn poll(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = ready!(this.inner.as_mut().poll(context));
        let call = this.call.take();
        match result {
            Ok(response) => {
                // trailers-only responses carry the status in the head
                let header_code = tonic::Status::from_header_map(response.headers())
                    .map(|status| status.code());
                let completion = GrpcCompletion {
                    call,
                    header_code,
                    http_status: response.status(),
                };
                Poll::Ready(Ok(response.map(|body| CompletionBody::new(body, completion))))
            }
            Err(e) => {
                if let Some(call) = call {
                    call.record(Code::Unknown, 0);
                }
                Poll::Ready(Err(e))
            }
        }
    }
}

/// Records the call once its response body is done.
pub struct GrpcCompletion {
    call: Option<GrpcCall>,
    header_code: Option<Code>,
    http_status: StatusCode,
}

impl BodyCompletion for GrpcCompletion {
    fn complete(self, end: BodyEnd) {
        let Some(call) = self.call else {
            return;
        };
        let code = end
            .trailers
            .as_ref()
            .and_then(tonic::Status::from_header_map)
            .map(|status| status.code())
            .or(self.header_code)
            .unwrap_or_else(|| {
                if self.http_status != StatusCode::OK {
                    return code_from_http_status(self.http_status);
                }
                match end.state {
                    EndState::Complete => Code::Ok,
                    EndState::Dropped => Code::Cancelled,
                    EndState::Errored => Code::Unknown,
                }
            });
        call.record(code, end.bytes);
    }
}
