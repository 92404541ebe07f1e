//! Credential renewal: the refresh-token exchange and the gate that makes sure
//! only one exchange runs at a time.
//!
//! The first call that needs a renewal becomes the leader and holds a
//! [`RenewalLease`]. Calls that fail while the lease is held get the same
//! [`InFlightRenewal`] and wait on it. The leader publishes the new pair to the
//! store before it releases the gate, so anything that looks at the gate after
//! release also sees the new credential.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, OnceCell};
use url::Url;

use super::request::OutboundRequest;
use super::transport::Transport;
use crate::auth::AuthStore;
use crate::error::{ClientError, Result};

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

/// Body returned by the renewal endpoint. Backends that do not rotate refresh
/// tokens omit `refresh`.
#[derive(Debug, Deserialize)]
pub struct RenewedTokens {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

/// Exchange `refresh_token` for a new pair, bypassing the request pipeline
pub async fn exchange_refresh_token(
    transport: &dyn Transport,
    refresh_url: &Url,
    refresh_token: &str,
) -> Result<RenewedTokens> {
    let request = OutboundRequest::post_json(
        refresh_url.clone(),
        &RefreshRequest {
            refresh: refresh_token,
        },
    )?;

    let res = transport.execute(request).await?;
    if !res.is_success() {
        return Err(ClientError::Status {
            status: res.status(),
            body: res.text(),
        });
    }

    res.json()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    Renewed,
    Failed(String),
    /// The leader went away before the exchange finished. Stored credentials
    /// are untouched, so waiters go back through the gate.
    Abandoned,
}

pub struct InFlightRenewal {
    outcome: OnceCell<RenewalOutcome>,
    notify: Notify,
}

impl InFlightRenewal {
    fn new() -> Self {
        Self {
            outcome: OnceCell::new(),
            notify: Notify::new(),
        }
    }

    fn complete(&self, outcome: RenewalOutcome) {
        let _ = self.outcome.set(outcome);
        self.notify.notify_waiters();
    }

    /// Wait until the leader settles the renewal
    pub async fn wait(&self) -> RenewalOutcome {
        loop {
            if let Some(outcome) = self.outcome.get() {
                return outcome.clone();
            }

            // Register before re-checking so a completion in between is not lost
            let notified = self.notify.notified();
            if let Some(outcome) = self.outcome.get() {
                return outcome.clone();
            }

            notified.await;
        }
    }
}

/// What a call that hit a 401 should do next
pub enum GateEntry<'a> {
    /// Run the renewal with this refresh token
    Lead(RenewalLease<'a>, String),
    /// Wait for another call's renewal
    Follow(Arc<InFlightRenewal>),
    /// The credential already changed since the call was sent
    Replay,
    /// No refresh token; nothing to renew with
    NoRefreshToken,
    /// The call was sent with a credential, but the session has since been
    /// cleared
    Expired,
}

#[derive(Default)]
pub struct RenewalGate {
    slot: Mutex<Option<Arc<InFlightRenewal>>>,
}

impl RenewalGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> bool {
        self.lock().is_some()
    }

    /// Decide the role of a call that was sent with `sent_with` and got a 401.
    ///
    /// The store is read while the gate is locked, so the check for a newer
    /// credential and the leader election are one step.
    pub fn enter<'a>(&'a self, store: &AuthStore, sent_with: Option<&str>) -> GateEntry<'a> {
        let mut slot = self.lock();

        if let Some(renewal) = slot.as_ref() {
            return GateEntry::Follow(renewal.clone());
        }

        let current = store.current();
        if current.access.is_some() && current.access.as_deref() != sent_with {
            return GateEntry::Replay;
        }

        if sent_with.is_some() && current.access.is_none() && current.refresh.is_none() {
            return GateEntry::Expired;
        }

        let Some(refresh) = current.refresh else {
            return GateEntry::NoRefreshToken;
        };

        let renewal = Arc::new(InFlightRenewal::new());
        *slot = Some(renewal.clone());

        GateEntry::Lead(
            RenewalLease {
                gate: self,
                renewal,
                settled: false,
            },
            refresh,
        )
    }

    fn release(&self, renewal: &Arc<InFlightRenewal>) {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, renewal)) {
            *slot = None;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<InFlightRenewal>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held by the leader for the duration of one renewal.
///
/// Dropping it without [`settle`](Self::settle) (the leader's future was
/// cancelled) releases the gate and wakes the waiters with
/// [`RenewalOutcome::Abandoned`].
pub struct RenewalLease<'a> {
    gate: &'a RenewalGate,
    renewal: Arc<InFlightRenewal>,
    settled: bool,
}

impl RenewalLease<'_> {
    /// Clear the in-flight flag, then wake every follower with `outcome`.
    ///
    /// Store updates for the outcome must already be applied.
    pub fn settle(mut self, outcome: RenewalOutcome) {
        self.settled = true;
        self.gate.release(&self.renewal);
        self.renewal.complete(outcome);
    }
}

impl Drop for RenewalLease<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!("Credential renewal abandoned before completion");
            crate::metrics::METRICS
                .renewals_total
                .with_label_values(&["abandoned"])
                .inc();
            self.gate.release(&self.renewal);
            self.renewal.complete(RenewalOutcome::Abandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store_with(access: &str, refresh: &str) -> AuthStore {
        let store = AuthStore::in_memory();
        store.set(access.to_string(), refresh.to_string()).unwrap();
        store
    }

    #[test]
    fn test_first_entry_leads_second_follows() {
        let gate = RenewalGate::new();
        let store = store_with("A1", "R1");

        let lease = match gate.enter(&store, Some("A1")) {
            GateEntry::Lead(lease, refresh) => {
                assert_eq!(refresh, "R1");
                lease
            }
            _ => panic!("expected leader"),
        };
        assert!(gate.in_flight());

        assert!(matches!(gate.enter(&store, Some("A1")), GateEntry::Follow(_)));

        lease.settle(RenewalOutcome::Renewed);
        assert!(!gate.in_flight());
    }

    #[test]
    fn test_newer_credential_replays_without_renewal() {
        let gate = RenewalGate::new();
        let store = store_with("A2", "R2");

        assert!(matches!(gate.enter(&store, Some("A1")), GateEntry::Replay));
        assert!(!gate.in_flight());
    }

    #[test]
    fn test_missing_refresh_token() {
        let gate = RenewalGate::new();
        let store = AuthStore::in_memory();

        assert!(matches!(gate.enter(&store, None), GateEntry::NoRefreshToken));
        assert!(!gate.in_flight());
    }

    #[test]
    fn test_cleared_session_is_expired_for_authenticated_call() {
        let gate = RenewalGate::new();
        let store = store_with("A1", "R1");
        store.clear().unwrap();

        assert!(matches!(gate.enter(&store, Some("A1")), GateEntry::Expired));
        assert!(matches!(gate.enter(&store, None), GateEntry::NoRefreshToken));
        assert!(!gate.in_flight());
    }

    #[tokio::test]
    async fn test_followers_observe_outcome() {
        let gate = RenewalGate::new();
        let store = store_with("A1", "R1");

        let GateEntry::Lead(lease, _) = gate.enter(&store, Some("A1")) else {
            panic!("expected leader");
        };
        let GateEntry::Follow(renewal) = gate.enter(&store, Some("A1")) else {
            panic!("expected follower");
        };

        let waiter = tokio::spawn(async move { renewal.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        lease.settle(RenewalOutcome::Failed("refresh rejected".to_string()));

        let outcome = waiter.await.unwrap();
        assert_eq!(outcome, RenewalOutcome::Failed("refresh rejected".to_string()));
    }

    #[tokio::test]
    async fn test_dropped_lease_abandons_renewal() {
        let gate = RenewalGate::new();
        let store = store_with("A1", "R1");

        let GateEntry::Lead(lease, _) = gate.enter(&store, Some("A1")) else {
            panic!("expected leader");
        };
        let GateEntry::Follow(renewal) = gate.enter(&store, Some("A1")) else {
            panic!("expected follower");
        };

        drop(lease);

        assert!(!gate.in_flight());
        assert_eq!(renewal.wait().await, RenewalOutcome::Abandoned);

        // The refresh token is still good, so the next call leads a new renewal
        let GateEntry::Lead(lease, refresh) = gate.enter(&store, Some("A1")) else {
            panic!("expected new leader");
        };
        assert_eq!(refresh, "R1");
        lease.settle(RenewalOutcome::Renewed);
    }
}
