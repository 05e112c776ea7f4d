use std::fmt;

/// Why establishing a remote session failed. Callers branch on this for
/// retry decisions, so the variants must stay distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// The host rejected our credentials.
    AuthFailed,
    /// No route, refused, or name resolution failure.
    Unreachable,
    /// The host did not answer within the connect timeout.
    Timeout,
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectFailure::AuthFailed => write!(f, "authentication failed"),
            ConnectFailure::Unreachable => write!(f, "host unreachable"),
            ConnectFailure::Timeout => write!(f, "connection timed out"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaravanError {
    #[error("cannot connect to '{host}': {kind}")]
    Connection { host: String, kind: ConnectFailure },

    #[error("remote command exited with status {exit_code}: {stderr}")]
    Command { exit_code: i32, stderr: String },

    /// Warning-level: the requested explicit identifier is taken. The
    /// caller may acknowledge and proceed; the import step still rejects
    /// if the id is truly occupied at that point.
    #[error("identifier {0} is already in use on the target host")]
    IdentifierConflict(u32),

    #[error("host '{0}' has no usable network bridges")]
    NoBridgesAvailable(String),

    #[error("mapping cannot be resolved: {0}")]
    MappingUnresolved(String),

    /// The data plane dropped mid-transfer. Manually retryable; never
    /// retried automatically.
    #[error("transfer interrupted: {0}")]
    TransferInterrupted(String),

    #[error("host '{0}' is unreachable")]
    HostUnreachable(String),

    #[error("compute unit {0} not found on host")]
    UnitNotFound(u32),

    #[error("host '{0}' is not declared in the fleet configuration")]
    HostNotFound(String),

    #[error("migration task '{0}' not found")]
    TaskNotFound(String),

    #[error("scheduled job '{0}' not found")]
    JobNotFound(String),

    #[error("invalid trigger expression '{0}'")]
    InvalidTrigger(String),

    #[error("migration refused: {0}")]
    MigrationRefused(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("management API error: {0}")]
    Api(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CaravanError {
    /// Whether the caller may reasonably retry the failed operation.
    /// Host-level connectivity problems are transient; a missing unit or a
    /// failed remote command is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaravanError::Connection { .. }
                | CaravanError::HostUnreachable(_)
                | CaravanError::TransferInterrupted(_)
        )
    }
}

impl From<toml::de::Error> for CaravanError {
    fn from(err: toml::de::Error) -> Self {
        CaravanError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for CaravanError {
    fn from(err: reqwest::Error) -> Self {
        CaravanError::Api(err.to_string())
    }
}
