use thiserror::Error;

/// Errors raised by the realm, its searchers and its caches.
///
/// Payloads are plain strings so that a remembered failure can be handed to
/// every caller waiting on the same cache entry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RealmError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("directory error: {0}")]
    Directory(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no such entry: {0}")]
    NoSuchEntry(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("referral could not be followed: {0}")]
    ReferralUnresolvable(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("management operation failed: {0}")]
    Management(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("realm '{0}' is stopped")]
    Stopped(String),

    #[error("timeout")]
    Timeout,
}

impl From<ldap3::LdapError> for RealmError {
    fn from(err: ldap3::LdapError) -> Self {
        match err {
            ldap3::LdapError::Timeout { .. } => RealmError::Timeout,
            other => RealmError::Directory(other.to_string()),
        }
    }
}

impl RealmError {
    /// Whether this failure means "the thing looked for does not exist",
    /// as opposed to a failure talking to the directory.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RealmError::NotFound(_) | RealmError::NoSuchEntry(_))
    }
}
