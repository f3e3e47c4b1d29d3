/// Shared error type used across all daemon crates.
///
/// The variants map onto the daemon's error taxonomy: validation and auth
/// errors are reported synchronously and never retried; `PolicyDenied` and
/// `Timeout` are surfaced as tool results so a run keeps going; `Transient`
/// is retried in-situ by adapters, never by the executor; `Fatal` marks
/// corrupted persisted state that recovery drops instead of crashing on.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation: {0}")]
    Validation(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("denied: {0}")]
    PolicyDenied(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("corrupt state: {0}")]
    Fatal(String),

    #[error("llm: {0}")]
    Llm(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable machine-readable code for API envelopes and tool results.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "Io",
            Self::Json(_) => "Json",
            Self::Validation(_) => "Validation",
            Self::Auth(_) => "Auth",
            Self::NotFound(_) => "NotFound",
            Self::PolicyDenied(_) => "PolicyDenied",
            Self::Timeout(_) => "Timeout",
            Self::Transient(_) => "Transient",
            Self::Fatal(_) => "Fatal",
            Self::Llm(_) => "Llm",
            Self::Other(_) => "Other",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_stable() {
        assert_eq!(Error::Validation("x".into()).code(), "Validation");
        assert_eq!(Error::PolicyDenied("x".into()).code(), "PolicyDenied");
        assert_eq!(Error::NotFound("x".into()).code(), "NotFound");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert_eq!(err.code(), "Io");
        assert!(err.to_string().contains("gone"));
    }
}
