use std::fmt::{self, Display};
use std::{io, result};

use crate::tenant_core::backend::error_codes::{self, BackendErrorKind};

#[derive(Debug)]
pub struct Error {
    err: Box<ErrorKind>, // use a Box to keep the Result type smaller
}

#[derive(Debug)]
pub enum ErrorKind {
    /// No healthy backend connection could be acquired, or pg_unavailable_msg is set.
    BackendUnavailable(String),
    /// Domain rule violations: dropping a currently-open db, db still in use, etc.
    Execution(String),
    /// JWT validation failures.
    Authentication(String),
    /// Fatal configuration/bootstrap failures.
    Startup(String),
    /// A backend-originated error, classified by its SQLSTATE code.
    Backend { sqlstate: String, message: String },
    Timeout,
    ClosedError,
    StringError(String),
    IOError(io::Error),
    JSONError(serde_json::Error),
    YAMLError(serde_yaml::Error),
    PgError(tokio_postgres::Error),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn new<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(s.to_string())),
        }
    }

    pub fn closed() -> Self {
        Error {
            err: Box::new(ErrorKind::ClosedError),
        }
    }

    pub fn timeout() -> Self {
        Error {
            err: Box::new(ErrorKind::Timeout),
        }
    }

    pub fn backend_unavailable<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::BackendUnavailable(s.to_string())),
        }
    }

    pub fn execution<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::Execution(s.to_string())),
        }
    }

    pub fn authentication<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::Authentication(s.to_string())),
        }
    }

    pub fn startup<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::Startup(s.to_string())),
        }
    }

    pub fn backend<S: ToString, M: ToString>(sqlstate: S, message: M) -> Self {
        Error {
            err: Box::new(ErrorKind::Backend {
                sqlstate: sqlstate.to_string(),
                message: message.to_string(),
            }),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.err
    }

    /// True if this is a BackendError whose SQLSTATE falls in `kind`.
    pub fn code_is(&self, kind: BackendErrorKind) -> bool {
        match &*self.err {
            ErrorKind::Backend { sqlstate, .. } => error_codes::classify(sqlstate) == kind,
            _ => false,
        }
    }

    /// True for the error classes the SysConn reconnect loop should retry rather than
    /// surface. Non-BackendError errors (e.g. IOError from a failed TCP connect) are also
    /// retryable — they cover the OS/transport-level failures a dropped TCP connection
    /// produces.
    pub fn is_retryable_backend_error(&self) -> bool {
        match &*self.err {
            ErrorKind::Backend { sqlstate, .. } => error_codes::is_retryable(sqlstate),
            ErrorKind::IOError(_) | ErrorKind::PgError(_) | ErrorKind::Timeout => true,
            _ => false,
        }
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(String::from(err))),
        }
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(err)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::IOError(err)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::JSONError(err)),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::YAMLError(err)),
        }
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            return Error::backend(db_err.code().code(), db_err.message());
        }
        Error {
            err: Box::new(ErrorKind::PgError(err)),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.err, f)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::BackendUnavailable(s) => write!(f, "backend unavailable: {}", s),
            ErrorKind::Execution(s) => write!(f, "{}", s),
            ErrorKind::Authentication(s) => write!(f, "{}", s),
            ErrorKind::Startup(s) => write!(f, "{}", s),
            ErrorKind::Backend { sqlstate, message } => write!(f, "{} ({})", message, sqlstate),
            ErrorKind::Timeout => f.write_str("operation timed out"),
            ErrorKind::ClosedError => f.write_str("connection is closed"),
            ErrorKind::StringError(s) => f.write_str(s),
            ErrorKind::IOError(e) => Display::fmt(e, f),
            ErrorKind::JSONError(e) => Display::fmt(e, f),
            ErrorKind::YAMLError(e) => Display::fmt(e, f),
            ErrorKind::PgError(e) => Display::fmt(e, f),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant_core::backend::error_codes;

    #[test]
    fn code_is_matches_classified_kind() {
        let e = Error::backend(error_codes::INVALID_CATALOG_NAME, "database \"gone\" does not exist");
        assert!(e.code_is(BackendErrorKind::InvalidCatalog));
        assert!(!e.code_is(BackendErrorKind::CannotConnectNow));
    }

    #[test]
    fn non_backend_errors_are_retryable_like_os_errors() {
        let e: Error = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(e.is_retryable_backend_error());
    }

    #[test]
    fn unrelated_backend_errors_are_fatal() {
        let e = Error::backend("42601", "syntax error");
        assert!(!e.is_retryable_backend_error());
    }
}
