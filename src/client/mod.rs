//! Authenticated API client.
//!
//! [`ApiClient`] attaches the stored bearer credential to every call and
//! recovers from a 401 by renewing the credential once and replaying the call.
//! Concurrent 401s share a single renewal; see [`renewal`].

pub mod renewal;
pub mod request;
pub mod transport;

use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::AuthStore;
use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::metrics::METRICS;

pub use renewal::{RenewalGate, RenewalOutcome};
pub use request::{ApiResponse, OutboundRequest, RequestContext};
pub use transport::{HttpTransport, Transport};

use renewal::GateEntry;

#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

struct Inner {
    base_url: String,
    refresh_url: Url,
    transport: Arc<dyn Transport>,
    store: AuthStore,
    gate: RenewalGate,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        refresh_path: &str,
        transport: Arc<dyn Transport>,
        store: AuthStore,
    ) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let refresh_url = join_url(&base_url, refresh_path)?;

        Ok(Self {
            inner: Arc::new(Inner {
                base_url,
                refresh_url,
                transport,
                store,
                gate: RenewalGate::new(),
            }),
        })
    }

    pub fn from_config(config: &Config, store: AuthStore) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(config.api.timeout())?);
        Self::new(
            &config.api.base_url,
            &config.auth.refresh_path,
            transport,
            store,
        )
    }

    pub fn store(&self) -> &AuthStore {
        &self.inner.store
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Resolve an API path against the base URL
    pub fn url(&self, path: &str) -> Result<Url> {
        join_url(&self.inner.base_url, path)
    }

    /// Whether a credential renewal is currently running
    pub fn renewal_in_flight(&self) -> bool {
        self.inner.gate.in_flight()
    }

    /// Send a call, renewing the credential and replaying once on a 401.
    ///
    /// Non-2xx statuses are returned as [`ClientError::Status`] or
    /// [`ClientError::Unauthorized`]. [`ClientError::SessionExpired`] means
    /// the stored credentials were cleared and the user must log in again.
    pub async fn send(&self, mut ctx: RequestContext) -> Result<ApiResponse> {
        let res = self.dispatch(&mut ctx).await?;
        if res.status() == StatusCode::UNAUTHORIZED {
            return self.recover(ctx, res).await;
        }
        into_result(res)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(RequestContext::get(path)).await?.json()
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(RequestContext::post(path).json(body)?).await?.json()
    }

    pub async fn patch_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(RequestContext::patch(path).json(body)?).await?.json()
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.send(RequestContext::delete(path)).await
    }

    /// Attach the current credential and send one attempt
    async fn dispatch(&self, ctx: &mut RequestContext) -> Result<ApiResponse> {
        let access = if ctx.has_caller_credential() {
            None
        } else {
            self.inner.store.access_token()
        };

        let mut headers = ctx.headers().clone();
        if let Some(token) = access.as_deref() {
            match HeaderValue::from_str(&format!("Bearer {}", token)) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    headers.insert(AUTHORIZATION, value);
                }
                Err(_) => warn!(
                    request_id = %ctx.id(),
                    "Stored access token is not a valid header value"
                ),
            }
        }
        ctx.sent_with = access;

        let request = OutboundRequest {
            method: ctx.method().clone(),
            url: self.url(ctx.path())?,
            headers,
            body: ctx.body_bytes().map(<[u8]>::to_vec),
        };

        debug!(
            request_id = %ctx.id(),
            method = %ctx.method(),
            path = ctx.path(),
            retry = ctx.is_retry(),
            authenticated = ctx.sent_with.is_some(),
            "Sending request"
        );

        let res = self.inner.transport.execute(request).await?;

        METRICS
            .requests_total
            .with_label_values(&[ctx.method().as_str(), res.status().as_str()])
            .inc();

        Ok(res)
    }

    /// Handle a 401 for `ctx`
    async fn recover(&self, mut ctx: RequestContext, res: ApiResponse) -> Result<ApiResponse> {
        if ctx.is_retry() {
            return Err(self.reject_retried(&ctx));
        }

        if ctx.has_caller_credential() {
            return Err(ClientError::Unauthorized { body: res.text() });
        }

        loop {
            let entry = self
                .inner
                .gate
                .enter(&self.inner.store, ctx.sent_with.as_deref());

            match entry {
                GateEntry::NoRefreshToken => {
                    debug!(request_id = %ctx.id(), "No refresh token, propagating 401");
                    return Err(ClientError::Unauthorized { body: res.text() });
                }
                GateEntry::Expired => {
                    debug!(request_id = %ctx.id(), "Session ended while request was in flight");
                    return Err(ClientError::SessionExpired {
                        reason: "session ended while request was in flight".to_string(),
                    });
                }
                GateEntry::Replay => {
                    ctx.retried = true;
                    debug!(
                        request_id = %ctx.id(),
                        "Credential changed since request was sent, replaying"
                    );
                    return self.replay(ctx).await;
                }
                GateEntry::Lead(lease, refresh_token) => {
                    ctx.retried = true;
                    info!(request_id = %ctx.id(), path = ctx.path(), "Access token rejected, renewing");

                    let renewed = self.renew(&refresh_token).await;
                    lease.settle(match &renewed {
                        Ok(()) => RenewalOutcome::Renewed,
                        Err(reason) => RenewalOutcome::Failed(reason.clone()),
                    });
                    return self.after_renewal(ctx, renewed).await;
                }
                GateEntry::Follow(renewal) => {
                    ctx.retried = true;
                    debug!(request_id = %ctx.id(), "Waiting for in-flight renewal");

                    let renewed = match renewal.wait().await {
                        RenewalOutcome::Renewed => Ok(()),
                        RenewalOutcome::Failed(reason) => Err(reason),
                        RenewalOutcome::Abandoned => {
                            debug!(request_id = %ctx.id(), "Renewal abandoned, re-entering gate");
                            continue;
                        }
                    };
                    return self.after_renewal(ctx, renewed).await;
                }
            }
        }
    }

    async fn after_renewal(
        &self,
        ctx: RequestContext,
        renewed: Result<(), String>,
    ) -> Result<ApiResponse> {
        match renewed {
            Ok(()) => self.replay(ctx).await,
            Err(reason) => Err(ClientError::SessionExpired { reason }),
        }
    }

    /// Run the refresh-token exchange and apply its result to the store.
    ///
    /// Returns the failure reason when the session had to be ended.
    async fn renew(&self, refresh_token: &str) -> Result<(), String> {
        let exchanged = renewal::exchange_refresh_token(
            self.inner.transport.as_ref(),
            &self.inner.refresh_url,
            refresh_token,
        )
        .await;

        match exchanged {
            Ok(tokens) => {
                let refresh = tokens.refresh.unwrap_or_else(|| refresh_token.to_string());
                if let Err(e) = self.inner.store.set(tokens.access, refresh) {
                    warn!("Failed to persist renewed credentials: {}", e);
                }
                METRICS.renewals_total.with_label_values(&["success"]).inc();
                info!("Access token renewed");
                Ok(())
            }
            Err(e) => {
                warn!("Credential renewal failed, ending session: {}", e);
                self.clear_credentials();
                METRICS.renewals_total.with_label_values(&["failure"]).inc();
                Err(e.to_string())
            }
        }
    }

    async fn replay(&self, mut ctx: RequestContext) -> Result<ApiResponse> {
        let res = self.dispatch(&mut ctx).await?;

        let outcome = if res.is_success() { "success" } else { "failure" };
        METRICS.replays_total.with_label_values(&[outcome]).inc();

        if res.status() == StatusCode::UNAUTHORIZED {
            return Err(self.reject_retried(&ctx));
        }
        into_result(res)
    }

    /// A call that was already replayed got another 401: end the session
    fn reject_retried(&self, ctx: &RequestContext) -> ClientError {
        warn!(
            request_id = %ctx.id(),
            path = ctx.path(),
            "Replayed request rejected again, ending session"
        );
        self.clear_credentials();
        ClientError::SessionExpired {
            reason: "credential rejected after renewal".to_string(),
        }
    }

    fn clear_credentials(&self) {
        if let Err(e) = self.inner.store.clear() {
            warn!("Failed to remove stored credentials: {}", e);
        }
    }
}

fn into_result(res: ApiResponse) -> Result<ApiResponse> {
    if res.is_success() {
        return Ok(res);
    }
    if res.status() == StatusCode::UNAUTHORIZED {
        return Err(ClientError::Unauthorized { body: res.text() });
    }
    Err(ClientError::Status {
        status: res.status(),
        body: res.text(),
    })
}

fn join_url(base: &str, path: &str) -> Result<Url> {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    Ok(Url::parse(&format!("{}/{}", base, path))?)
}
