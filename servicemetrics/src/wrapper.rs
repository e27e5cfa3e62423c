use std::{net::SocketAddr, time::Duration};

use prometheus::{proto, CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use tokio::task::JoinHandle;

use crate::{
    exposition::{encode_text, ExpositionServer},
    summary::{SummaryOpts, SummaryVec},
    Config, Error, LogFilter,
};

/// The module label of auto-logged requests.
pub const AUTO_LOG_MODULE: &str = "self";

const REQUEST_LABELS: [&str; 6] = ["app", "idc", "module", "api", "method", "code"];
const LATENCY_LABELS: [&str; 5] = ["app", "idc", "module", "api", "method"];
const STATE_LABELS: [&str; 4] = ["app", "idc", "module", "state"];
const EXCEPTION_LABELS: [&str; 4] = ["app", "idc", "module", "exception"];

/// Request, traffic, latency, state and exception metrics for one service.
///
/// Every sample carries the configured `app` and `idc`. Recording is synchronous: when a
/// log method returns, the registry reflects it.
///
/// ```
/// use std::time::Duration;
/// use servicemetrics::{Config, PrometheusWrapper};
///
/// let metrics = PrometheusWrapper::new(Config {
///     log_method: vec!["GET".to_string()],
///     log_api: vec!["/foo".to_string()],
///     ..Config::new("example")
/// })
/// .expect("config is valid");
///
/// // Business metrics
/// metrics.request_log("backend", "/baz", "GET", "200");
/// metrics.send_bytes_log("backend", "/baz", "GET", "200", 3000);
/// metrics.latency_log("backend", "/baz", "GET", Duration::from_millis(12));
/// metrics.state_log("backend", "reading", 500.0);
/// metrics.exception_log("mysql", "timeout");
///
/// // Auto-logged requests, usually via an adapter
/// metrics.log("/foo", "GET", "200", 5000, 200, Duration::from_millis(8));
/// metrics.log("/baz", "GET", "200", 5000, 200, Duration::from_millis(8)); // filtered
/// ```
pub struct PrometheusWrapper {
    config: Config,
    filter: LogFilter,
    registry: Registry,

    counter_requests: CounterVec,
    counter_send_bytes: CounterVec,
    counter_rcvd_bytes: CounterVec,
    counter_exception: CounterVec,
    gauge_state: GaugeVec,
    histogram_latency: HistogramVec,
    summary_latency: SummaryVec,
}

impl std::fmt::Debug for PrometheusWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusWrapper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PrometheusWrapper {
    /// Validate the config and register every metric family in a fresh registry.
    pub fn new(config: Config) -> Result<Self, Error> {
        let config = config.validate()?;
        let registry = Registry::new();

        let counter_requests = CounterVec::new(
            Opts::new("counter_requests", "number of module requests"),
            &REQUEST_LABELS,
        )?;
        registry.register(Box::new(counter_requests.clone()))?;

        let counter_send_bytes = CounterVec::new(
            Opts::new("counter_send_bytes", "number of module send bytes"),
            &REQUEST_LABELS,
        )?;
        registry.register(Box::new(counter_send_bytes.clone()))?;

        let counter_rcvd_bytes = CounterVec::new(
            Opts::new("counter_rcvd_bytes", "number of module receive bytes"),
            &REQUEST_LABELS,
        )?;
        registry.register(Box::new(counter_rcvd_bytes.clone()))?;

        let histogram_latency = HistogramVec::new(
            HistogramOpts::new("histogram_latency", "histogram of module latency")
                .buckets(config.buckets.clone()),
            &LATENCY_LABELS,
        )?;
        registry.register(Box::new(histogram_latency.clone()))?;

        let summary_latency = SummaryVec::new(
            SummaryOpts::new("summary_latency", "summary of module latency")
                .objectives(config.objectives.iter().copied())
                .max_age(config.summary_max_age)
                .age_buckets(config.summary_age_buckets),
            &LATENCY_LABELS,
        )?;
        registry.register(Box::new(summary_latency.clone()))?;

        let gauge_state = GaugeVec::new(
            Opts::new("gauge_state", "gauge of app state"),
            &STATE_LABELS,
        )?;
        registry.register(Box::new(gauge_state.clone()))?;

        let counter_exception = CounterVec::new(
            Opts::new("counter_exception", "number of module exception"),
            &EXCEPTION_LABELS,
        )?;
        registry.register(Box::new(counter_exception.clone()))?;

        if config.default_collect {
            register_process_collector(&registry)?;
        }

        log::debug!(
            "registered metrics for app {} in idc {}",
            config.app,
            config.idc
        );

        Ok(Self {
            filter: LogFilter::new(
                config.log_api.iter().cloned(),
                config.log_method.iter().cloned(),
            ),
            config,
            registry,
            counter_requests,
            counter_send_bytes,
            counter_rcvd_bytes,
            counter_exception,
            gauge_state,
            histogram_latency,
            summary_latency,
        })
    }

    /// Record a finished request under the `self` module, unless the allow-list rejects it.
    ///
    /// This is what the adapters call. It records the request count, both byte counts
    /// and the latency in the histogram and the summary.
    pub fn log(
        &self,
        api: &str,
        method: &str,
        code: &str,
        send_bytes: u64,
        rcvd_bytes: u64,
        latency: Duration,
    ) {
        if !self.is_log(api, method) {
            log::debug!("not recording {method} {api}: not in the allow-list");
            return;
        }
        self.request_log(AUTO_LOG_MODULE, api, method, code);
        self.send_bytes_log(AUTO_LOG_MODULE, api, method, code, send_bytes);
        self.rcvd_bytes_log(AUTO_LOG_MODULE, api, method, code, rcvd_bytes);
        self.latency_log(AUTO_LOG_MODULE, api, method, latency);
    }

    /// Whether [`PrometheusWrapper::log`] records a request to `api` with `method`.
    #[inline]
    pub fn is_log(&self, api: &str, method: &str) -> bool {
        self.filter.allows(api, method)
    }

    pub fn request_log(&self, module: &str, api: &str, method: &str, code: &str) {
        self.counter_requests
            .with_label_values(&self.request_labels(module, api, method, code))
            .inc();
    }

    pub fn send_bytes_log(&self, module: &str, api: &str, method: &str, code: &str, bytes: u64) {
        self.counter_send_bytes
            .with_label_values(&self.request_labels(module, api, method, code))
            .inc_by(bytes as f64);
    }

    pub fn rcvd_bytes_log(&self, module: &str, api: &str, method: &str, code: &str, bytes: u64) {
        self.counter_rcvd_bytes
            .with_label_values(&self.request_labels(module, api, method, code))
            .inc_by(bytes as f64);
    }

    /// Observe a latency, in milliseconds, in the latency histogram.
    pub fn histogram_latency_log(&self, module: &str, api: &str, method: &str, latency: Duration) {
        self.histogram_latency
            .with_label_values(&self.latency_labels(module, api, method))
            .observe(as_millis(latency));
    }

    /// Observe a latency, in milliseconds, in the latency summary.
    pub fn summary_latency_log(&self, module: &str, api: &str, method: &str, latency: Duration) {
        self.summary_latency
            .with_label_values(&self.latency_labels(module, api, method))
            .observe(as_millis(latency));
    }

    /// Observe a latency in both the histogram and the summary.
    pub fn latency_log(&self, module: &str, api: &str, method: &str, latency: Duration) {
        let labels = self.latency_labels(module, api, method);
        let millis = as_millis(latency);
        self.histogram_latency.with_label_values(&labels).observe(millis);
        self.summary_latency.with_label_values(&labels).observe(millis);
    }

    pub fn exception_log(&self, module: &str, exception: &str) {
        self.counter_exception
            .with_label_values(&[
                self.config.app.as_str(),
                self.config.idc.as_str(),
                module,
                exception,
            ])
            .inc();
    }

    /// Set the current value of a state.
    pub fn state_log(&self, module: &str, state: &str, value: f64) {
        self.gauge_state
            .with_label_values(&[
                self.config.app.as_str(),
                self.config.idc.as_str(),
                module,
                state,
            ])
            .set(value);
    }

    /// The validated configuration, with defaults filled in.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The registry holding this wrapper's metrics. Register your own collectors here to
    /// expose them on the same endpoint.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<proto::MetricFamily> {
        self.registry.gather()
    }

    /// Render every metric in the prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, Error> {
        let buffer = encode_text(&self.registry)?;
        String::from_utf8(buffer).map_err(|e| {
            Error::Prometheus(prometheus::Error::Msg(format!("non-utf8 exposition: {e}")))
        })
    }

    /// Bind the configured exposition address and serve it on the current tokio runtime.
    ///
    /// Returns the bound address and the serving task.
    pub async fn spawn_exposition(&self) -> Result<(SocketAddr, JoinHandle<()>), Error> {
        let server = ExpositionServer::bind(
            self.config.listen_addr(),
            self.config.service.metrics_path.clone(),
            self.registry.clone(),
        )
        .await?;
        let address = server.local_addr();
        Ok((address, tokio::task::spawn(server.serve_forever())))
    }

    #[inline]
    fn request_labels<'a>(
        &'a self,
        module: &'a str,
        api: &'a str,
        method: &'a str,
        code: &'a str,
    ) -> [&'a str; 6] {
        [self.config.app.as_str(), self.config.idc.as_str(), module, api, method, code]
    }

    #[inline]
    fn latency_labels<'a>(
        &'a self,
        module: &'a str,
        api: &'a str,
        method: &'a str,
    ) -> [&'a str; 5] {
        [self.config.app.as_str(), self.config.idc.as_str(), module, api, method]
    }
}

fn as_millis(latency: Duration) -> f64 {
    latency.as_secs_f64() * 1000.0
}

#[cfg(all(feature = "process", target_os = "linux"))]
fn register_process_collector(registry: &Registry) -> Result<(), Error> {
    registry.register(Box::new(
        prometheus::process_collector::ProcessCollector::for_self(),
    ))?;
    Ok(())
}

#[cfg(not(all(feature = "process", target_os = "linux")))]
fn register_process_collector(_registry: &Registry) -> Result<(), Error> {
    log::warn!("process metrics are not available in this build");
    Ok(())
}
