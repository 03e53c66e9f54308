//! Error types for the EventListener Operator

use std::time::Duration;

use thiserror::Error;

/// Result type for the operator
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the operator
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The customResource template could not be turned into an object
    #[error("Invalid custom resource: {0}")]
    InvalidCustomResource(String),

    /// A custom object exists but reports a Ready condition that is not true
    #[error("{kind} {namespace}/{name} is not ready yet")]
    NotReady {
        kind: String,
        namespace: String,
        name: String,
    },

    /// Two independent reconcile branches both failed
    #[error("{0} : {1}")]
    Combined(Box<Error>, Box<Error>),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    FinalizerError(Box<kube::runtime::finalizer::Error<Error>>),
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        Error::FinalizerError(Box::new(err))
    }
}

impl Error {
    /// Whether this error is a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// How long the controller waits before retrying after this error
    pub fn requeue_after(&self) -> Duration {
        match self {
            Error::NotReady { .. } => Duration::from_secs(10),
            Error::KubeError(_) => Duration::from_secs(30),
            Error::ConfigError(_) | Error::InvalidCustomResource(_) => Duration::from_secs(300),
            Error::Combined(first, second) => first.requeue_after().min(second.requeue_after()),
            Error::FinalizerError(inner) => match inner.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(e)
                | kube::runtime::finalizer::Error::CleanupFailed(e) => e.requeue_after(),
                _ => Duration::from_secs(60),
            },
            Error::SerializationError(_) => Duration::from_secs(60),
        }
    }
}

/// Combine the outcome of two independent reconcile branches.
///
/// Neither failure is swallowed: when both branches fail the resulting error
/// renders as `"<first> : <second>"`.
pub fn combine_errors(first: Result<()>, second: Result<()>) -> Result<()> {
    match (first, second) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Err(a), Err(b)) => Err(Error::Combined(Box::new(a), Box::new(b))),
    }
}
