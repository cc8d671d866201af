/// Shared error type used across all Ghost crates.
///
/// Variants map onto the runtime's failure policy: `Http` and `Timeout`
/// are transient and retried locally, `ContextOverflow` triggers the
/// emergency prune path, `UpstreamUnavailable` means every fallback was
/// exhausted, and tool failures never take this form at all (they are
/// surfaced as tool-result strings).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Transient network failure (connect, read, write, protocol).
    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// Upstream rejected the request because the prompt no longer fits.
    #[error("context overflow: {0}")]
    ContextOverflow(String),

    /// Upstream returned a non-2xx status that is not a context overflow.
    #[error("upstream {pool}: {message}")]
    Upstream { pool: String, message: String },

    /// Every node of the requested class and the main pool failed.
    #[error("upstream unreachable: all nodes exhausted")]
    UpstreamUnavailable,

    #[error("invalid tool arguments: {0}")]
    ToolArg(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("config: {0}")]
    Config(String),

    #[error("memory: {0}")]
    Memory(String),

    #[error("sandbox: {0}")]
    Sandbox(String),

    /// Unrecoverable startup failure; the process refuses to serve.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors the router retries locally with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Http(_) | Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Http("connection reset".into()).is_transient());
        assert!(Error::Timeout("read".into()).is_transient());
        assert!(!Error::UpstreamUnavailable.is_transient());
        assert!(!Error::ContextOverflow("400".into()).is_transient());
        assert!(!Error::Upstream {
            pool: "main".into(),
            message: "HTTP 500".into()
        }
        .is_transient());
    }
}
