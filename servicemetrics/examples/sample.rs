//! Records made-up traffic and serves it on http://localhost:9000/metrics.
//!
//! `RUST_LOG=debug cargo run --example sample` also shows the filtered auto-log events.

use std::{sync::Arc, time::Duration};

use rand::Rng;
use servicemetrics::{Config, PrometheusWrapper};

#[tokio::main]
async fn main() -> Result<(), servicemetrics::Error> {
    env_logger::init();

    let mut config = Config {
        idc: "beijing".to_string(),
        log_method: vec!["GET".to_string(), "POST".to_string()],
        log_api: vec!["/foo".to_string(), "/bar".to_string()],
        buckets: (1..=20u32).map(|i| f64::from(i) * 10.0).collect(),
        objectives: vec![(0.5, 0.05), (0.9, 0.01), (0.99, 0.001)],
        default_collect: true,
        ..Config::new("test")
    };
    config.service.listen_port = 9000;

    let metrics = Arc::new(PrometheusWrapper::new(config)?);
    let (address, serving) = metrics.spawn_exposition().await?;
    log::info!("scrape http://{address}/metrics");

    tokio::spawn(auto_log_forever(metrics.clone()));
    tokio::spawn(business_log_forever(metrics));

    serving.await.map_err(|e| servicemetrics::Error::Io(std::io::Error::other(e)))
}

/// What the adapters do at the end of every request.
async fn auto_log_forever(metrics: Arc<PrometheusWrapper>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        metrics.log("/foo", "GET", "200", 5000, 200, random_latency());
        // not in log_api
        metrics.log("/baz", "GET", "200", 5000, 200, random_latency());
    }
}

async fn business_log_forever(metrics: Arc<PrometheusWrapper>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        metrics.request_log("backend", "/baz", "GET", "200");
        metrics.request_log("backend", "/baz", "GET", "500");
        metrics.rcvd_bytes_log("backend", "/baz", "GET", "200", 100);
        metrics.send_bytes_log("backend", "/baz", "GET", "200", 3000);
        metrics.histogram_latency_log("backend", "/baz", "GET", random_latency());
        metrics.summary_latency_log("backend", "/baz", "GET", random_latency());
        metrics.state_log("backend", "reading", 500.0);
        metrics.exception_log("mysql", "timeout");
        metrics.exception_log("mysql", "panic");
    }
}

fn random_latency() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..200))
}
