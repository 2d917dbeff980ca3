//! Error Types
//!
//! Domain errors for provisioning operations. The task runner uses
//! [`Error::is_retryable`] to decide between a later attempt and giving up.

use std::fmt;

use crate::database::DatabaseError;
use crate::models::{NetworkRole, ServiceStatus};

#[derive(Debug)]
pub enum Error {
    /// The pool has no free configuration of this role.
    ResourceExhausted(NetworkRole),
    /// Something that should have been set up beforehand is missing.
    Configuration(String),
    Bridge(bridge::Error),
    /// Callback secret did not match the VM's token.
    Unauthorized { vm_id: i64 },
    NotFound(String),
    InvalidTransition {
        service_id: i64,
        from: ServiceStatus,
        to: ServiceStatus,
    },
    InvalidInput(String),
    /// Registrar, configurer, notifier, resolver or backup report failed.
    External {
        collaborator: &'static str,
        message: String,
    },
    Database(DatabaseError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ResourceExhausted(role) => {
                write!(f, "No free {} network configuration available", role)
            }
            Error::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            Error::Bridge(err) => write!(f, "VM API error: {}", err),
            Error::Unauthorized { vm_id } => {
                write!(f, "Callback secret mismatch for VM {}", vm_id)
            }
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::InvalidTransition {
                service_id,
                from,
                to,
            } => write!(
                f,
                "Service {} cannot move from {} to {}",
                service_id, from, to
            ),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::External {
                collaborator,
                message,
            } => write!(f, "{} error: {}", collaborator, message),
            Error::Database(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Bridge(err) => Some(err),
            Error::Database(err) => Some(err),
            _ => None,
        }
    }
}

impl From<bridge::Error> for Error {
    fn from(err: bridge::Error) -> Self {
        Error::Bridge(err)
    }
}

impl From<DatabaseError> for Error {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(msg) => Error::NotFound(msg),
            other => Error::Database(other),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(DatabaseError::Query(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl Error {
    pub fn external(collaborator: &'static str, err: impl fmt::Display) -> Self {
        Error::External {
            collaborator,
            message: err.to_string(),
        }
    }

    /// Whether a later attempt of the same task could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ResourceExhausted(_) | Error::External { .. } | Error::Database(_) => true,
            Error::Bridge(err) => err.is_transient(),
            Error::Configuration(_)
            | Error::Unauthorized { .. }
            | Error::NotFound(_)
            | Error::InvalidTransition { .. }
            | Error::InvalidInput(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_error_kind() {
        assert!(Error::ResourceExhausted(NetworkRole::Host).is_retryable());
        assert!(
            Error::Bridge(bridge::Error::Failure {
                program: "vm_api".into(),
                exit_code: Some(1),
                output: "busy".into(),
            })
            .is_retryable()
        );
        assert!(Error::external("registrar", "timeout").is_retryable());

        assert!(!Error::Configuration("no host".into()).is_retryable());
        assert!(!Error::Unauthorized { vm_id: 1 }.is_retryable());
        assert!(
            !Error::InvalidTransition {
                service_id: 1,
                from: ServiceStatus::Denied,
                to: ServiceStatus::Installing,
            }
            .is_retryable()
        );
    }

    #[test]
    fn not_found_from_the_store_stays_not_found() {
        let err: Error = DatabaseError::NotFound("VM 9".into()).into();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
