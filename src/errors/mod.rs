use std::fmt;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum LabelError {
    #[error("Engine client unavailable: {message}")]
    ClientUnavailable {
        message: String,
    },

    #[error("Invalid parameters: {message}")]
    InvalidParams {
        message: String,
    },

    #[error("Engine Error: {0}")]
    Engine(#[from] EngineError),

    #[error("Configuration Error: {0}")]
    Config(#[from] config::ConfigError),
}

impl LabelError {
    pub fn invalid(message: impl Into<String>) -> Self {
        LabelError::InvalidParams {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        LabelError::ClientUnavailable {
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Fault {status}: {reason}{}", fmt_detail(.detail))]
    Fault {
        status: u16,
        reason: String,
        detail: Option<String>,
    },

    #[error("{kind} not found: {id}")]
    NotFound {
        kind: ObjectKind,
        id: String,
    },

    #[error("Unexpected payload from engine: {message}")]
    Decode {
        message: String,
    },

    #[error("Authentication failed: {message}")]
    Auth {
        message: String,
    },
}

fn fmt_detail(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(" ({d})"),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    AffinityLabel,
    Vm,
    Host,
    Cluster,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::AffinityLabel => write!(f, "Affinity label"),
            ObjectKind::Vm => write!(f, "VM"),
            ObjectKind::Host => write!(f, "Host"),
            ObjectKind::Cluster => write!(f, "Cluster"),
        }
    }
}

// Error context attached to the diagnostic trace of a failed run
#[derive(Debug)]
pub struct ErrorContext {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub source_location: &'static str,
    pub operation: String,
}

impl ErrorContext {
    pub fn new(source_location: &'static str, operation: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            source_location,
            operation: operation.into(),
        }
    }

    /// Render the context header followed by the full error chain.
    pub fn trace(&self, err: &anyhow::Error) -> String {
        format!(
            "[{}] {} failed at {}\n{:?}",
            self.timestamp.to_rfc3339(),
            self.operation,
            self.source_location,
            err
        )
    }
}

pub type LabelResult<T> = Result<T, LabelError>;
pub type EngineResult<T> = Result<T, EngineError>;

// Logs the failure with its context before handing the error back
#[macro_export]
macro_rules! with_context {
    ($result:expr, $operation:expr) => {
        $result.map_err(|e| {
            let context = $crate::errors::ErrorContext::new(std::file!(), $operation);
            tracing::error!(
                error = %e,
                context = ?context,
                "Operation failed"
            );
            e
        })
    };
}

pub(crate) fn log_fault(status: u16, reason: &str) {
    error!(status, reason, "Engine returned a fault");
}
