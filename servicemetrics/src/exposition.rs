//! The scrape endpoint.
//!
//! A small http/1 server that answers `GET <metrics_path>` with the text exposition of a
//! registry. Anything else is a 404, or a 405 for the right path with the wrong method.

use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;

use crate::Error;

/// Render a registry in the prometheus text format.
pub fn encode_text(registry: &Registry) -> Result<Vec<u8>, Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(buffer)
}

/// Serves a registry to prometheus scrapers.
pub struct ExpositionServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    endpoint: Arc<Endpoint>,
}

struct Endpoint {
    path: String,
    registry: Registry,
}

impl std::fmt::Debug for ExpositionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpositionServer")
            .field("local_addr", &self.local_addr)
            .field("path", &self.endpoint.path)
            .finish()
    }
}

impl ExpositionServer {
    /// Bind now, so address problems surface before serving starts.
    pub async fn bind(
        address: SocketAddr,
        path: impl Into<String>,
        registry: Registry,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        let path = path.into();
        log::info!("serving metrics on http://{local_addr}{path}");
        Ok(Self {
            listener,
            local_addr,
            endpoint: Arc::new(Endpoint { path, registry }),
        })
    }

    /// The bound address. Differs from the requested one when port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the process ends.
    pub async fn serve_forever(self) {
        self.serve_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes. Connections already accepted finish on their own.
    pub async fn serve_until(self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            let (stream, remote) = tokio::select! {
                _ = &mut shutdown => {
                    log::info!("metrics endpoint on {} shutting down", self.local_addr);
                    return;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        // accept fails again at once while the process is out of descriptors
                        log::error!("failed to accept a metrics connection: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            let endpoint = self.endpoint.clone();
            tokio::task::spawn(async move {
                let service = service_fn(move |request| {
                    let endpoint = endpoint.clone();
                    async move { Ok::<_, Infallible>(endpoint.respond(&request)) }
                });
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    log::debug!("metrics connection from {remote} ended: {e}");
                }
            });
        }
    }
}

impl Endpoint {
    fn respond(&self, request: &Request<Incoming>) -> Response<Full<Bytes>> {
        if request.uri().path() != self.path {
            return plain(StatusCode::NOT_FOUND, "not found\n");
        }
        if request.method() != Method::GET {
            let mut response = plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
            response
                .headers_mut()
                .insert(header::ALLOW, header::HeaderValue::from_static("GET"));
            return response;
        }

        match encode_text(&self.registry) {
            Ok(text) => {
                let mut response = Response::new(Full::new(Bytes::from(text)));
                let encoder = TextEncoder::new();
                let format_type = encoder.format_type();
                if let Ok(content_type) = header::HeaderValue::from_str(format_type) {
                    response
                        .headers_mut()
                        .insert(header::CONTENT_TYPE, content_type);
                }
                response
            }
            Err(e) => {
                log::error!("failed to encode metrics: {e}");
                plain(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics\n")
            }
        }
    }
}

fn plain(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
