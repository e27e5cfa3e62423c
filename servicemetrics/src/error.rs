/// Errors from building or serving a [`crate::PrometheusWrapper`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration cannot describe a working wrapper.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// The metrics library rejected a registration or an encoding.
    #[error("prometheus: {0}")]
    Prometheus(#[from] prometheus::Error),
    /// Listening or reading a config file failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// A config file could not be parsed.
    #[error("config format: {0}")]
    ConfigFormat(#[from] toml::de::Error),
}
