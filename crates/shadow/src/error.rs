use std::error::Error as StdError;

use mender_common::FromMessage;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shadow capacity reached: {active} of {max} environments active")]
    Capacity { active: usize, max: usize },

    #[error("shadow environment not found: {id}")]
    NotFound { id: String },

    #[error("shadow environment {id} already exists in state {status}")]
    AlreadyExists { id: String, status: String },

    #[error("shadow environment {id} is {status}, expected {expected}")]
    InvalidState {
        id: String,
        status: String,
        expected: &'static str,
    },

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("timed out waiting for {what}\n{diagnostics}")]
    ReadinessTimeout { what: String, diagnostics: String },

    #[error("{tool} is not installed or not on PATH")]
    ToolUnavailable { tool: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{message}")]
    Message { message: String },
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external<E>(context: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn provisioning(message: impl Into<String>) -> Self {
        Self::Provisioning(message.into())
    }

    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Short machine-friendly tag, used as a metrics label.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Capacity { .. } => "capacity",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::InvalidState { .. } => "invalid_state",
            Self::Provisioning(_) => "provisioning",
            Self::ReadinessTimeout { .. } => "readiness_timeout",
            Self::ToolUnavailable { .. } => "tool_unavailable",
            Self::Cancelled => "cancelled",
            Self::Kube(_) => "kube",
            Self::Json(_) | Self::Yaml(_) => "decode",
            Self::Io(_) => "io",
            Self::Message { .. } | Self::External { .. } => "other",
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

mender_common::impl_context!();

/// `true` when the API server answered 404.
#[must_use]
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// `true` when the API server answered 409.
#[must_use]
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "boom".into(),
            reason: "NotFound".into(),
            code,
        })
    }

    #[test]
    fn classifies_api_status_codes() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(409)));
        assert!(is_conflict(&api_error(409)));
    }

    #[test]
    fn capacity_message_names_both_counts() {
        let err = Error::Capacity { active: 3, max: 3 };
        assert_eq!(
            err.to_string(),
            "shadow capacity reached: 3 of 3 environments active"
        );
        assert_eq!(err.kind(), "capacity");
    }

    #[test]
    fn context_wraps_into_message() {
        let res: std::result::Result<(), &str> = Err("refused");
        let err = res.context("connect sandbox").unwrap_err();
        assert!(matches!(err, Error::Message { .. }));
        assert_eq!(err.to_string(), "connect sandbox: refused");
    }
}
