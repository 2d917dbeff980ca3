use std::time::Duration;

/// Failures of an external command call.
///
/// `Failure` is the hypervisor's "command ran and said no" channel and carries
/// everything the process printed so operators can diagnose it from the logs.
#[derive(Debug)]
pub enum Error {
    /// The executable could not be started or its pipes broke.
    Transport(std::io::Error),
    Timeout {
        program: String,
        after: Duration,
    },
    Failure {
        program: String,
        exit_code: Option<i32>,
        output: String,
    },
    MalformedResponse {
        raw: String,
        source: serde_json::Error,
    },
    Serialization(serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Transport(err) => write!(f, "Transport error: {}", err),
            Error::Timeout { program, after } => {
                write!(f, "{} did not finish within {:?}", program, after)
            }
            Error::Failure {
                program,
                exit_code,
                output,
            } => write!(
                f,
                "{} failed with exit code {:?}: {}",
                program, exit_code, output
            ),
            Error::MalformedResponse { raw, source } => {
                write!(f, "Response is not valid JSON ({}): {}", source, raw)
            }
            Error::Serialization(err) => write!(f, "Failed to serialize parameters: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(err) => Some(err),
            Error::MalformedResponse { source, .. } => Some(source),
            Error::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err)
    }
}

impl Error {
    /// Whether running the same call again later could succeed.
    ///
    /// A malformed response or unserializable parameters will be exactly as
    /// malformed on the next attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Timeout { .. } | Error::Failure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
