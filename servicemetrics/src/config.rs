use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use serde::Deserialize;

use crate::Error;

/// Histogram upper bounds, in milliseconds, used when none are configured.
pub const DEFAULT_LATENCY_BUCKETS: [f64; 11] = [
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

/// Summary quantiles and their tolerated errors, used when none are configured.
pub const DEFAULT_OBJECTIVES: [(f64, f64); 3] = [(0.5, 0.05), (0.9, 0.01), (0.99, 0.001)];

const DEFAULT_IDC: &str = "none";
const DEFAULT_LISTEN_PORT: u16 = 8080;
const DEFAULT_METRICS_PATH: &str = "/metrics";
const DEFAULT_SUMMARY_MAX_AGE: Duration = Duration::from_secs(600);
const DEFAULT_SUMMARY_AGE_BUCKETS: u32 = 5;

/// Everything a [`crate::PrometheusWrapper`] needs to know about the service it instruments.
///
/// ```
/// let config = servicemetrics::Config::from_toml_str(r#"
///     app = "checkout"
///     idc = "us-west"
///     log_method = ["GET", "POST"]
///     log_api = ["/cart", "/pay"]
///
///     [service]
///     listen_port = 9000
/// "#).expect("config parses");
/// assert_eq!(9000, config.service.listen_port);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application name. Attached to every sample as `app`. Required.
    pub app: String,
    /// Datacenter name. Attached to every sample as `idc`.
    pub idc: String,
    /// API paths that auto-logging records, matched exactly. Empty records nothing.
    pub log_api: Vec<String>,
    /// HTTP methods that auto-logging records, matched exactly. Empty records nothing.
    pub log_method: Vec<String>,
    /// Latency histogram upper bounds in milliseconds.
    pub buckets: Vec<f64>,
    /// Latency summary quantiles, each paired with its tolerated error.
    pub objectives: Vec<(f64, f64)>,
    /// How far back summary quantiles look.
    #[serde(with = "seconds", rename = "summary_max_age_seconds")]
    pub summary_max_age: Duration,
    /// How many steps the summary window rotates through over `summary_max_age`.
    pub summary_age_buckets: u32,
    /// Register process metrics (cpu, memory, file descriptors) alongside the service metrics.
    pub default_collect: bool,
    /// Exposition endpoint settings.
    pub service: ServiceConfig,
}

/// Where the exposition endpoint listens.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub listen_address: IpAddr,
    /// 0 means the default, 8080.
    pub listen_port: u16,
    pub metrics_path: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_LISTEN_PORT,
            metrics_path: DEFAULT_METRICS_PATH.to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: String::new(),
            idc: DEFAULT_IDC.to_string(),
            log_api: Vec::new(),
            log_method: Vec::new(),
            buckets: DEFAULT_LATENCY_BUCKETS.to_vec(),
            objectives: DEFAULT_OBJECTIVES.to_vec(),
            summary_max_age: DEFAULT_SUMMARY_MAX_AGE,
            summary_age_buckets: DEFAULT_SUMMARY_AGE_BUCKETS,
            default_collect: false,
            service: ServiceConfig::default(),
        }
    }
}

impl Config {
    /// Default settings for an application.
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            ..Default::default()
        }
    }

    /// Parse a toml document. Absent fields take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a toml file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Fill in defaults for blank fields and reject settings that cannot work.
    pub fn validate(mut self) -> Result<Self, Error> {
        if self.app.is_empty() {
            return Err(Error::InvalidConfig("missing app".to_string()));
        }
        if self.idc.is_empty() {
            self.idc = DEFAULT_IDC.to_string();
        }
        if self.service.listen_port == 0 {
            self.service.listen_port = DEFAULT_LISTEN_PORT;
        }
        if self.buckets.is_empty() {
            self.buckets = DEFAULT_LATENCY_BUCKETS.to_vec();
        }
        if !self.buckets.iter().all(|bound| bound.is_finite())
            || self.buckets.windows(2).any(|pair| pair[1] <= pair[0])
        {
            return Err(Error::InvalidConfig(format!(
                "buckets {:?} must be finite and strictly increasing",
                self.buckets
            )));
        }
        if self.objectives.is_empty() {
            self.objectives = DEFAULT_OBJECTIVES.to_vec();
        }
        for (quantile, error) in &self.objectives {
            if !(0.0 < *quantile && *quantile < 1.0) {
                return Err(Error::InvalidConfig(format!(
                    "objective quantile {quantile} must be within (0, 1)"
                )));
            }
            if !(0.0..=1.0).contains(error) {
                return Err(Error::InvalidConfig(format!(
                    "objective error {error} for quantile {quantile} must be within [0, 1]"
                )));
            }
        }
        if self.summary_max_age.is_zero() {
            return Err(Error::InvalidConfig(
                "summary_max_age must be positive".to_string(),
            ));
        }
        if self.summary_age_buckets == 0 {
            return Err(Error::InvalidConfig(
                "summary_age_buckets must be positive".to_string(),
            ));
        }
        if !self.service.metrics_path.starts_with('/') {
            return Err(Error::InvalidConfig(format!(
                "metrics_path {:?} must start with /",
                self.service.metrics_path
            )));
        }
        Ok(self)
    }

    /// The socket address of the exposition endpoint.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.service.listen_address, self.service.listen_port)
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
