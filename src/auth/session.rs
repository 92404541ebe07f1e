/// Login, logout and the session guard
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::client::{ApiClient, OutboundRequest};
use crate::error::{ClientError, Result};

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    access: String,
    refresh: String,
}

pub struct Session {
    client: ApiClient,
    login_url: Url,
}

impl Session {
    pub fn new(client: ApiClient, login_path: &str) -> Result<Self> {
        let login_url = client.url(login_path)?;
        Ok(Self { client, login_url })
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Exchange username and password for a token pair and store it.
    ///
    /// Sent directly on the transport: a 401 here means bad credentials, not
    /// an expired token.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let request =
            OutboundRequest::post_json(self.login_url.clone(), &LoginRequest { username, password })?;

        let res = self.client.transport().execute(request).await?;

        if res.status() == StatusCode::UNAUTHORIZED {
            warn!(username, "Login rejected");
            return Err(ClientError::InvalidLogin);
        }
        if !res.is_success() {
            return Err(ClientError::Status {
                status: res.status(),
                body: res.text(),
            });
        }

        let tokens: LoginResponse = res.json()?;
        self.client.store().set(tokens.access, tokens.refresh)?;

        info!(username, "Logged in");
        Ok(())
    }

    pub fn logout(&self) -> Result<()> {
        self.client.store().clear()?;
        info!("Logged out");
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.client.store().is_authenticated()
    }

    /// Refuse to continue without a session
    pub fn require_authenticated(&self) -> Result<()> {
        if self.is_authenticated() {
            Ok(())
        } else {
            Err(ClientError::NotAuthenticated)
        }
    }
}

/// Read the `exp` claim of a JWT without verifying it.
///
/// Tokens are opaque to the client; this only feeds status output and returns
/// `None` for anything that does not look like a JWT.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    #[derive(Deserialize)]
    struct Claims {
        exp: i64,
    }

    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&decoded).ok()?;
    DateTime::from_timestamp(claims.exp, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthStore;
    use crate::client::{ApiResponse, Transport};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tokio_test::{assert_err, assert_ok};

    struct LoginApi {
        bodies: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl Transport for LoginApi {
        async fn execute(&self, request: OutboundRequest) -> Result<ApiResponse> {
            assert!(request.bearer_token().is_none());
            let body: serde_json::Value =
                serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
            self.bodies.lock().unwrap().push(body.clone());

            if body["password"] == "correct-horse" {
                Ok(ApiResponse::new(
                    StatusCode::OK,
                    r#"{"access":"A1","refresh":"R1"}"#,
                ))
            } else {
                Ok(ApiResponse::new(
                    StatusCode::UNAUTHORIZED,
                    r#"{"detail":"No active account found with the given credentials"}"#,
                ))
            }
        }
    }

    fn session() -> (Session, Arc<LoginApi>) {
        let api = Arc::new(LoginApi {
            bodies: Mutex::new(Vec::new()),
        });
        let client = ApiClient::new(
            "http://localhost:8000/api",
            "/token/refresh/",
            api.clone(),
            AuthStore::in_memory(),
        )
        .unwrap();
        (Session::new(client, "/token/").unwrap(), api)
    }

    fn jwt_with_payload(payload: &str) -> String {
        format!(
            "{}.{}.signature",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
            URL_SAFE_NO_PAD.encode(payload)
        )
    }

    #[tokio::test]
    async fn test_login_stores_tokens() {
        let (session, api) = session();
        assert_err!(session.require_authenticated());

        assert_ok!(session.login("admin", "correct-horse").await);

        assert!(session.is_authenticated());
        assert_ok!(session.require_authenticated());
        let credentials = session.client().store().current();
        assert_eq!(credentials.access.as_deref(), Some("A1"));
        assert_eq!(credentials.refresh.as_deref(), Some("R1"));

        let bodies = api.bodies.lock().unwrap();
        assert_eq!(bodies[0]["username"], "admin");
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let (session, _) = session();

        let err = session.login("admin", "wrong").await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidLogin));
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_logout_clears_store() {
        let (session, _) = session();
        session.login("admin", "correct-horse").await.unwrap();

        session.logout().unwrap();
        assert!(!session.is_authenticated());
        assert!(matches!(
            session.require_authenticated(),
            Err(ClientError::NotAuthenticated)
        ));
    }

    #[test]
    fn test_token_expiry_from_jwt() {
        let token = jwt_with_payload(r#"{"token_type":"access","exp":1700000000,"user_id":1}"#);
        let expiry = token_expiry(&token).unwrap();
        assert_eq!(expiry.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_token_expiry_opaque_token() {
        assert!(token_expiry("opaque-token").is_none());
        assert!(token_expiry("a.not-base64!.c").is_none());
        assert!(token_expiry(&jwt_with_payload(r#"{"user_id":1}"#)).is_none());
    }
}
