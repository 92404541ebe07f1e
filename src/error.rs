use reqwest::StatusCode;
use thiserror::Error;

/// Errors raised by the persistent credential backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("credential serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("request failed with status {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// 401 that was not recovered: no refresh token, or the caller supplied
    /// its own credential.
    #[error("authorization failed: {body}")]
    Unauthorized { body: String },

    /// Renewal failed, a replay was rejected again, or the session was cleared
    /// while the call was in flight. Stored credentials are gone and the user
    /// has to log in again.
    #[error("session expired: {reason}")]
    SessionExpired { reason: String },

    #[error("not logged in")]
    NotAuthenticated,

    #[error("invalid username or password")]
    InvalidLogin,

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ClientError {
    /// Whether the caller should send the user back to the login flow
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            ClientError::SessionExpired { .. } | ClientError::NotAuthenticated
        )
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::Unauthorized { .. } | ClientError::InvalidLogin => {
                Some(StatusCode::UNAUTHORIZED)
            }
            ClientError::Network(e) => e.status(),
            _ => None,
        }
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_login() {
        let expired = ClientError::SessionExpired {
            reason: "refresh rejected".to_string(),
        };
        assert!(expired.requires_login());
        assert!(ClientError::NotAuthenticated.requires_login());

        let unauthorized = ClientError::Unauthorized {
            body: String::new(),
        };
        assert!(!unauthorized.requires_login());
        assert_eq!(unauthorized.status(), Some(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_status_error_display() {
        let err = ClientError::Status {
            status: StatusCode::NOT_FOUND,
            body: "{\"detail\":\"Not found.\"}".to_string(),
        };
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert!(err.to_string().contains("404"));
    }
}
