use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
    time::Instant,
};

use http::{header, Request, Response};
use http_body::Body;
use tower::{Layer, Service};

use crate::{
    body::{BodyCompletion, BodyEnd, CompletionBody},
    PrometheusWrapper,
};

/// Records every allowed request with [`PrometheusWrapper::log`].
///
/// ```
/// use std::sync::Arc;
/// use servicemetrics::{adapter::HttpMetricsLayer, Config, PrometheusWrapper};
///
/// let metrics = PrometheusWrapper::new(Config::new("example")).expect("config is valid");
/// let metrics = Arc::new(metrics);
/// let layer = HttpMetricsLayer::new(metrics);
/// // tower::ServiceBuilder::new().layer(layer).service(your_service)
/// # let _ = layer;
/// ```
#[derive(Clone)]
pub struct HttpMetricsLayer {
    metrics: Arc<PrometheusWrapper>,
}

impl HttpMetricsLayer {
    pub fn new(metrics: Arc<PrometheusWrapper>) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for HttpMetricsLayer {
    type Service = HttpMetrics<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpMetrics {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

/// The service made by [`HttpMetricsLayer`].
#[derive(Clone)]
pub struct HttpMetrics<S> {
    inner: S,
    metrics: Arc<PrometheusWrapper>,
}

impl<S, RequestBody, ResponseBody> Service<Request<RequestBody>> for HttpMetrics<S>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>>,
    RequestBody: Body,
    ResponseBody: Body,
{
    type Response = Response<CompletionBody<ResponseBody, HttpCompletion>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, context: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(context)
    }

    fn call(&mut self, request: Request<RequestBody>) -> Self::Future {
        let start = Instant::now();
        let path = request.uri().path().to_string();
        let method = request.method().as_str();
        let pending = if self.metrics.is_log(&path, method) {
            Some(PendingRequest {
                method: method.to_string(),
                rcvd_bytes: request_length(&request),
                start,
            })
        } else {
            log::debug!("not recording {method} {path}: not in the allow-list");
            None
        };

        ResponseFuture {
            inner: Box::pin(self.inner.call(request)),
            metrics: self.metrics.clone(),
            path,
            pending,
        }
    }
}

/// Content-Length, or the exact size of the body when it knows it.
fn request_length<B: Body>(request: &Request<B>) -> u64 {
    request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|length| length.to_str().ok())
        .and_then(|length| length.parse().ok())
        .or_else(|| request.body().size_hint().exact())
        .unwrap_or(0)
}

struct PendingRequest {
    method: String,
    rcvd_bytes: u64,
    start: Instant,
}

/// Waits for the response head, then hands the request to the response body.
pub struct ResponseFuture<F> {
    inner: Pin<Box<F>>,
    metrics: Arc<PrometheusWrapper>,
    path: String,
    // None when the allow-list rejects the request
    pending: Option<PendingRequest>,
}

impl<F, ResponseBody, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<ResponseBody>, E>>,
    ResponseBody: Body,
{
    type Output = Result<Response<CompletionBody<ResponseBody, HttpCompletion>>, E>;

    fn poll(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = ready!(this.inner.as_mut().poll(context));
        match result {
            Ok(response) => {
                let completion = HttpCompletion {
                    metrics: this.metrics.clone(),
                    path: std::mem::take(&mut this.path),
                    code: response.status().as_u16().to_string(),
                    pending: this.pending.take(),
                };
                Poll::Ready(Ok(response.map(|body| CompletionBody::new(body, completion))))
            }
            Err(e) => {
                this.metrics.exception_log(&this.path, "service_error");
                Poll::Ready(Err(e))
            }
        }
    }
}

/// Logs the request once its response body is done.
pub struct HttpCompletion {
    metrics: Arc<PrometheusWrapper>,
    path: String,
    code: String,
    pending: Option<PendingRequest>,
}

impl BodyCompletion for HttpCompletion {
    fn complete(self, end: BodyEnd) {
        if let Some(pending) = self.pending {
            self.metrics.log(
                &self.path,
                &pending.method,
                &self.code,
                end.bytes,
                pending.rcvd_bytes,
                pending.start.elapsed(),
            );
        }
    }
}

#[cfg(test)]
mod test {
    use std::{convert::Infallible, sync::Arc};

    use bytes::Bytes;
    use http::{Request, Response, StatusCode};
    use http_body_util::{BodyExt, Empty, Full};
    use tower::{service_fn, Layer, Service, ServiceExt};

    use super::HttpMetricsLayer;
    use crate::{
        test_support::{counter_value, find_metric},
        Config, PrometheusWrapper,
    };

    fn metrics() -> Arc<PrometheusWrapper> {
        Arc::new(
            PrometheusWrapper::new(Config {
                log_method: vec!["GET".to_string(), "POST".to_string()],
                log_api: vec!["/foo".to_string()],
                ..Config::new("test")
            })
            .expect("config is valid"),
        )
    }

    #[test_log::test(tokio::test)]
    async fn records_allowed_requests_when_the_body_is_done() {
        let metrics = metrics();
        let service = HttpMetricsLayer::new(metrics.clone()).layer(service_fn(
            |_request: Request<Full<Bytes>>| async {
                let mut response = Response::new(Full::new(Bytes::from_static(b"hello world")));
                *response.status_mut() = StatusCode::CREATED;
                Ok::<_, Infallible>(response)
            },
        ));

        let request = Request::post("/foo")
            .body(Full::new(Bytes::from_static(b"request")))
            .expect("valid request");
        let response = service.oneshot(request).await.expect("infallible");
        assert_eq!(StatusCode::CREATED, response.status());
        assert!(
            counter_value(&metrics.gather(), "counter_requests", &[]).is_none(),
            "nothing is recorded before the body is done"
        );

        let body = response.into_body().collect().await.expect("infallible").to_bytes();
        assert_eq!(&b"hello world"[..], &body[..]);

        let families = metrics.gather();
        let labels = [
            ("module", "self"),
            ("api", "/foo"),
            ("method", "POST"),
            ("code", "201"),
        ];
        assert_eq!(Some(1.0), counter_value(&families, "counter_requests", &labels));
        assert_eq!(Some(11.0), counter_value(&families, "counter_send_bytes", &labels));
        assert_eq!(Some(7.0), counter_value(&families, "counter_rcvd_bytes", &labels));
        let histogram = find_metric(&families, "histogram_latency", &labels[..3])
            .expect("latency recorded")
            .get_histogram();
        assert_eq!(1, histogram.get_sample_count());
    }

    #[test_log::test(tokio::test)]
    async fn content_length_wins_over_the_body() {
        let metrics = metrics();
        let service = HttpMetricsLayer::new(metrics.clone()).layer(service_fn(
            |_request: Request<Empty<Bytes>>| async {
                Ok::<_, Infallible>(Response::new(Empty::<Bytes>::new()))
            },
        ));

        let request = Request::get("/foo")
            .header("content-length", "42")
            .body(Empty::<Bytes>::new())
            .expect("valid request");
        let response = service.oneshot(request).await.expect("infallible");
        drop(response);

        assert_eq!(
            Some(42.0),
            counter_value(&metrics.gather(), "counter_rcvd_bytes", &[("code", "200")])
        );
    }

    #[test_log::test(tokio::test)]
    async fn skips_requests_outside_the_allow_list() {
        let metrics = metrics();
        let service = HttpMetricsLayer::new(metrics.clone()).layer(service_fn(
            |_request: Request<Empty<Bytes>>| async {
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"ok"))))
            },
        ));

        for request in [
            Request::get("/bar").body(Empty::<Bytes>::new()),
            Request::delete("/foo").body(Empty::<Bytes>::new()),
        ] {
            let response = service
                .clone()
                .oneshot(request.expect("valid request"))
                .await
                .expect("infallible");
            let _ = response.into_body().collect().await;
        }

        assert!(counter_value(&metrics.gather(), "counter_requests", &[]).is_none());
    }

    #[test_log::test(tokio::test)]
    async fn service_errors_are_exceptions() {
        let metrics = metrics();
        let service = HttpMetricsLayer::new(metrics.clone()).layer(service_fn(
            |_request: Request<Empty<Bytes>>| async {
                Err::<Response<Empty<Bytes>>, _>(std::io::Error::other("backend is down"))
            },
        ));

        let request = Request::get("/foo")
            .body(Empty::<Bytes>::new())
            .expect("valid request");
        let error = service
            .oneshot(request)
            .await
            .err()
            .expect("service fails");
        assert_eq!("backend is down", error.to_string());

        let families = metrics.gather();
        assert_eq!(
            Some(1.0),
            counter_value(
                &families,
                "counter_exception",
                &[("module", "/foo"), ("exception", "service_error")]
            )
        );
        assert!(counter_value(&families, "counter_requests", &[]).is_none());
    }

    #[test_log::test(tokio::test)]
    async fn latency_covers_a_pending_handler() {
        let metrics = metrics();
        let (respond, responded) = tokio::sync::oneshot::channel::<()>();
        let responded = std::sync::Mutex::new(Some(responded));
        let mut service = HttpMetricsLayer::new(metrics.clone()).layer(service_fn(
            move |_request: Request<Empty<Bytes>>| {
                let responded = responded
                    .lock()
                    .expect("local mutex should not be poisoned")
                    .take();
                async move {
                    if let Some(responded) = responded {
                        let _ = responded.await;
                    }
                    Ok::<_, Infallible>(Response::new(Empty::<Bytes>::new()))
                }
            },
        ));

        let request = Request::get("/foo")
            .body(Empty::<Bytes>::new())
            .expect("valid request");
        let mut call = tokio_test::task::spawn(service.call(request));
        tokio_test::assert_pending!(call.poll());
        assert!(counter_value(&metrics.gather(), "counter_requests", &[]).is_none());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        respond.send(()).expect("handler is waiting");
        assert!(call.is_woken());
        let response = tokio_test::assert_ready_ok!(call.poll());
        drop(response);

        let histogram = find_metric(&metrics.gather(), "histogram_latency", &[("api", "/foo")])
            .expect("latency recorded")
            .get_histogram()
            .clone();
        assert_eq!(1, histogram.get_sample_count());
        assert!(20.0 <= histogram.get_sample_sum(), "{}", histogram.get_sample_sum());
    }
}
