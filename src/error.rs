//! WolfCluster Error Types

use thiserror::Error;

/// Result type alias for WolfCluster operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfCluster error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Backend faults
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Application errors: the caller's mistake, never a cluster-health signal
    #[error("Wrong row count: expected {expected}, got {actual}")]
    WrongRowCount { expected: u64, actual: u64 },

    #[error("Write attempted in the middle of a transaction")]
    WriteInTransaction,

    #[error("Refusing to drop protected table `{0}`")]
    ProtectedTableDrop(String),

    #[error("Backend cannot clone table `{0}`")]
    CloneUnsupported(String),

    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    // Cluster capacity errors
    #[error("Cannot remove the last member of the cluster")]
    CannotRemoveLastMember,

    #[error("No available backend in the cluster")]
    NoAvailableBackend,

    // Membership errors
    #[error("Member not found: {0}")]
    MemberNotFound(String),

    #[error("Synchronization of {backend} failed: {reason}")]
    Synchronization { backend: String, reason: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is a caller mistake rather than a backend fault.
    ///
    /// These are raised to the caller unchanged and never eject a member,
    /// whatever the cluster size.
    pub fn is_application_error(&self) -> bool {
        matches!(
            self,
            Error::WrongRowCount { .. }
                | Error::WriteInTransaction
                | Error::ProtectedTableDrop(_)
                | Error::CloneUnsupported(_)
                | Error::UnsupportedQuery(_)
        )
    }

    /// Check if this error reports that the cluster cannot satisfy the request at all
    pub fn is_capacity_error(&self) -> bool {
        matches!(
            self,
            Error::CannotRemoveLastMember | Error::NoAvailableBackend | Error::ShuttingDown
        )
    }

    /// Check if this error, raised by a member, should get that member ejected
    pub fn should_eject(&self) -> bool {
        !self.is_application_error() && !self.is_capacity_error()
    }

    /// Wrap this error as a synchronization failure for the given backend
    pub fn into_sync_error(self, backend: &impl std::fmt::Display) -> Error {
        match self {
            Error::Synchronization { .. } => self,
            other => Error::Synchronization {
                backend: backend.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_list() {
        assert!(Error::WrongRowCount { expected: 1, actual: 0 }.is_application_error());
        assert!(Error::WriteInTransaction.is_application_error());
        assert!(Error::ProtectedTableDrop("users".into()).is_application_error());
        assert!(Error::CloneUnsupported("users".into()).is_application_error());
        assert!(Error::UnsupportedQuery("raw sql".into()).is_application_error());

        assert!(!Error::QueryExecution("boom".into()).is_application_error());
        assert!(!Error::ConnectionTimeout("db1".into()).is_application_error());
    }

    #[test]
    fn test_should_eject() {
        assert!(Error::QueryExecution("connection reset".into()).should_eject());
        assert!(Error::ConnectionFailed {
            address: "db1:3306".into(),
            reason: "refused".into(),
        }
        .should_eject());
        assert!(!Error::NoAvailableBackend.should_eject());
        assert!(!Error::WriteInTransaction.should_eject());
    }

    #[test]
    fn test_into_sync_error_keeps_existing() {
        let err = Error::Synchronization {
            backend: "a".into(),
            reason: "x".into(),
        };
        match err.into_sync_error(&"b") {
            Error::Synchronization { backend, .. } => assert_eq!(backend, "a"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
