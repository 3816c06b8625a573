use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Invalid InferenceService spec: {0}")]
    InvalidSpec(String),

    #[error("Unsupported autoscaler configuration: {0}")]
    UnsupportedBackend(String),

    #[error("{backend} is not installed in this cluster; it is required for {required_by}")]
    BackendNotInstalled {
        backend: &'static str,
        required_by: String,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::InvalidSpec(_) => "InvalidSpec",
            Error::UnsupportedBackend(_) => "UnsupportedBackend",
            Error::BackendNotInstalled { .. } => "BackendNotInstalled",
        }
    }

    /// Errors caused by the InferenceService itself; retrying without a spec change cannot help
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::InvalidSpec(_) | Error::UnsupportedBackend(_) | Error::BackendNotInstalled { .. }
        )
    }

    /// A write was rejected because it was based on a stale resourceVersion
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(err)) if err.code == 409)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(err)) if err.code == 404)
    }

    /// Failures worth retrying on a timer: everything that is neither the user's fault nor a conflict
    pub fn is_transient(&self) -> bool {
        !self.is_terminal() && !self.is_conflict()
    }
}

pub mod controllers;
pub use controllers::{run, State};

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

/// Autoscaling intent, normalization and synthesis of scaling resources
pub mod scaling;

/// Own and external CRDs
pub mod resources;
