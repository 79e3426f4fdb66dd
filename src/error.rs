use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Missing object key")]
    MissingObjectKey,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid action '{name}': {reason}")]
    InvalidAction { name: String, reason: String },

    #[error("Template error: {0}")]
    TemplateError(String),

    #[error("Target {kind} {namespace}/{name} not found")]
    TargetNotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Alerts API returned status {status}: {body}")]
    AlertsApiError { status: u16, body: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("Event bus is shut down")]
    BusClosed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Configuration errors are not retried by reconcile loops; the object must change first.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::ConfigError(_) | Error::InvalidAction { .. } | Error::TemplateError(_)
        )
    }
}
