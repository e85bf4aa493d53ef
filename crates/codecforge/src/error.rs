use thiserror::Error;

use crate::diagnostic::Diagnostic;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    InvalidRef(Diagnostic),

    #[error("{0}")]
    UnknownDependency(Diagnostic),

    #[error("{0}")]
    SourceIntegrity(Diagnostic),

    #[error("{0}")]
    Fetch(Diagnostic),

    #[error("{0}")]
    Build(Diagnostic),

    #[error("{0}")]
    Timeout(Diagnostic),

    #[error("{0}")]
    ArtifactVerification(Diagnostic),

    #[error("{0}")]
    Toolchain(Diagnostic),

    #[error("{0}")]
    IsolationLeak(Diagnostic),

    #[error("{0}")]
    MissingDependency(Diagnostic),

    #[error("{0}")]
    LinkageViolation(Diagnostic),

    #[error("{0}")]
    Config(Diagnostic),

    #[error("{}", render_batch(.0))]
    Batch(Vec<Error>),

    #[error("{0}")]
    Msg(String),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }

    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            Error::InvalidRef(d)
            | Error::UnknownDependency(d)
            | Error::SourceIntegrity(d)
            | Error::Fetch(d)
            | Error::Build(d)
            | Error::Timeout(d)
            | Error::ArtifactVerification(d)
            | Error::Toolchain(d)
            | Error::IsolationLeak(d)
            | Error::MissingDependency(d)
            | Error::LinkageViolation(d)
            | Error::Config(d) => Some(d),
            Error::Batch(_) | Error::Msg(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidRef(_) => "InvalidRefError",
            Error::UnknownDependency(_) => "UnknownDependencyError",
            Error::SourceIntegrity(_) => "SourceIntegrityError",
            Error::Fetch(_) => "FetchError",
            Error::Build(_) => "BuildError",
            Error::Timeout(_) => "TimeoutError",
            Error::ArtifactVerification(_) => "ArtifactVerificationError",
            Error::Toolchain(_) => "ToolchainError",
            Error::IsolationLeak(_) => "IsolationLeakError",
            Error::MissingDependency(_) => "MissingDependencyError",
            Error::LinkageViolation(_) => "LinkageViolationError",
            Error::Config(_) => "ConfigError",
            Error::Batch(_) => "BatchError",
            Error::Msg(_) => "Error",
        }
    }

    /// Network failures may be retried; nothing else may.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Fetch(_))
    }
}

fn render_batch(errors: &[Error]) -> String {
    let mut out = format!("{} target(s) failed", errors.len());
    for e in errors {
        out.push_str("\n\n");
        out.push_str(&e.to_string());
    }
    out
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
