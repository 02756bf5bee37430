//! Postgres SQLSTATE codes the tenant runtime needs to classify backend errors by.
//!
//! A full wire-protocol front-end would carry the complete SQLSTATE catalog for building
//! error responses; the tenant core only needs the handful of classes referenced by its
//! retry/fatal decisions.

/// Class 08 — Connection Exception
pub const CONNECTION_EXCEPTION: &str = "08000";
pub const CONNECTION_DOES_NOT_EXIST: &str = "08003";
pub const CONNECTION_FAILURE: &str = "08006";
pub const SQL_CLIENT_UNABLE_TO_ESTABLISH_SQL_CONNECTION: &str = "08001";

/// Class 0A — Feature Not Supported
pub const FEATURE_NOT_SUPPORTED: &str = "0A000";

/// Class 25 — Invalid Transaction State
pub const READ_ONLY_SQL_TRANSACTION: &str = "25006";

/// Class 3D — Invalid Catalog Name
pub const INVALID_CATALOG_NAME: &str = "3D000";

/// Class 57 — Operator Intervention
pub const CANNOT_CONNECT_NOW: &str = "57P03";
pub const ADMIN_SHUTDOWN: &str = "57P01";
pub const CRASH_SHUTDOWN: &str = "57P02";

/// The subset of error classes the tenant core needs to tell apart.
///
/// `code_is(kind)` classifies a raw SQLSTATE against one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    InvalidCatalog,
    FeatureNotSupported,
    CannotConnectNow,
    ReadOnlySqlTransaction,
    ConnectionException,
    Other,
}

pub fn classify(sqlstate: &str) -> BackendErrorKind {
    match sqlstate {
        INVALID_CATALOG_NAME => BackendErrorKind::InvalidCatalog,
        FEATURE_NOT_SUPPORTED => BackendErrorKind::FeatureNotSupported,
        CANNOT_CONNECT_NOW => BackendErrorKind::CannotConnectNow,
        READ_ONLY_SQL_TRANSACTION => BackendErrorKind::ReadOnlySqlTransaction,
        CONNECTION_EXCEPTION | CONNECTION_DOES_NOT_EXIST | CONNECTION_FAILURE
        | SQL_CLIENT_UNABLE_TO_ESTABLISH_SQL_CONNECTION => BackendErrorKind::ConnectionException,
        _ => BackendErrorKind::Other,
    }
}

/// Retryable: OS/transport-equivalents (connection exceptions), feature_not_supported,
/// cannot_connect_now, read_only_sql_transaction. Everything else is fatal.
pub fn is_retryable(sqlstate: &str) -> bool {
    matches!(
        classify(sqlstate),
        BackendErrorKind::ConnectionException
            | BackendErrorKind::FeatureNotSupported
            | BackendErrorKind::CannotConnectNow
            | BackendErrorKind::ReadOnlySqlTransaction
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_codes() {
        assert_eq!(classify(INVALID_CATALOG_NAME), BackendErrorKind::InvalidCatalog);
        assert_eq!(classify(CANNOT_CONNECT_NOW), BackendErrorKind::CannotConnectNow);
        assert_eq!(classify("99999"), BackendErrorKind::Other);
    }

    #[test]
    fn expected_classes_are_retryable() {
        assert!(is_retryable(CANNOT_CONNECT_NOW));
        assert!(is_retryable(FEATURE_NOT_SUPPORTED));
        assert!(is_retryable(READ_ONLY_SQL_TRANSACTION));
        assert!(is_retryable(CONNECTION_FAILURE));
        assert!(!is_retryable(INVALID_CATALOG_NAME));
        assert!(!is_retryable("42601")); // syntax_error, fatal
    }
}
