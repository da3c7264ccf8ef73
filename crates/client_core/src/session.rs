//! Session credential ownership and single-flight refresh.
//!
//! Every outbound call obtains its bearer token through [`SessionManager`].
//! Every credential-writing operation (refresh, sign-in) goes through one
//! in-flight slot so that concurrent triggers (API calls, the background
//! scheduler, push reconnects) share one underlying network operation.
//! Sign-in and sign-out start a new session epoch; results of operations
//! begun under an older epoch are discarded.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::Deserialize;
use shared::{domain::UserId, protocol::TokenResponse};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{api::AuthBackend, error::ClientError};

const LONG_REMAINING_MINUTES: i64 = 30;
const MEDIUM_REMAINING_MINUTES: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// A credential expiring within this window is refreshed before use.
    pub buffer: Duration,
    pub long_interval: Duration,
    pub medium_interval: Duration,
    pub short_interval: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            buffer: Duration::from_secs(5 * 60),
            long_interval: Duration::from_secs(5 * 60),
            medium_interval: Duration::from_secs(2 * 60),
            short_interval: Duration::from_secs(30),
        }
    }
}

impl RefreshPolicy {
    pub fn next_check_delay(&self, remaining: Option<chrono::Duration>) -> Duration {
        let Some(remaining) = remaining else {
            return self.short_interval;
        };
        if remaining >= chrono::Duration::minutes(LONG_REMAINING_MINUTES) {
            self.long_interval
        } else if remaining >= chrono::Duration::minutes(MEDIUM_REMAINING_MINUTES) {
            self.medium_interval
        } else {
            self.short_interval
        }
    }
}

#[derive(Debug, Clone)]
struct Credential {
    access_token: String,
    subject: UserId,
    display_name: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    fn from_response(response: TokenResponse) -> Self {
        let expires_at = response
            .expires_at
            .or_else(|| token_expiry(&response.access_token));
        Self {
            access_token: response.access_token,
            subject: response.subject,
            display_name: response.display_name,
            expires_at,
        }
    }

    fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        let Some(expires_at) = self.expires_at else {
            return true;
        };
        let buffer = chrono::Duration::from_std(buffer).unwrap_or(chrono::Duration::zero());
        expires_at - now <= buffer
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: Option<String>,
}

/// How a failed refresh is recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshFailure {
    /// The service answered and refused; the cached credential is kept while a
    /// disposable identity is provisioned.
    Rejected,
    /// The service was unreachable; the cached credential is dropped first.
    Transport,
}

impl RefreshFailure {
    pub fn classify(err: &ClientError) -> Self {
        if err.is_transport() {
            Self::Transport
        } else {
            Self::Rejected
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionOp {
    Refresh,
    SignIn(String),
}

type InflightOp = Shared<BoxFuture<'static, Result<(), ClientError>>>;

struct Inflight {
    op: SessionOp,
    epoch: u64,
    flight: InflightOp,
}

#[derive(Default)]
struct SessionState {
    credential: Option<Credential>,
    epoch: u64,
    inflight: Option<Inflight>,
}

pub struct SessionManager {
    auth: Arc<dyn AuthBackend>,
    policy: RefreshPolicy,
    state: Mutex<SessionState>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SessionManager {
    pub fn new(auth: Arc<dyn AuthBackend>, policy: RefreshPolicy) -> Arc<Self> {
        Arc::new(Self {
            auth,
            policy,
            state: Mutex::new(SessionState::default()),
            scheduler: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    /// Refreshes when the credential is absent or inside the buffer window.
    /// Joins a refresh that is already in flight regardless of freshness.
    pub async fn ensure_fresh(self: &Arc<Self>) -> Result<(), ClientError> {
        let flight = {
            let mut guard = self.state.lock().await;
            if let Some(inflight) = &guard.inflight {
                inflight.flight.clone()
            } else if guard
                .credential
                .as_ref()
                .is_some_and(|credential| !credential.needs_refresh(Utc::now(), self.policy.buffer))
            {
                return Ok(());
            } else {
                self.start_op(&mut guard, SessionOp::Refresh)
            }
        };
        flight.await
    }

    pub async fn force_refresh(self: &Arc<Self>) -> Result<(), ClientError> {
        let flight = {
            let mut guard = self.state.lock().await;
            match &guard.inflight {
                Some(inflight) => inflight.flight.clone(),
                None => self.start_op(&mut guard, SessionOp::Refresh),
            }
        };
        flight.await
    }

    /// Supersedes any refresh in flight; its result is discarded.
    pub async fn sign_in(self: &Arc<Self>, username: &str) -> Result<Identity, ClientError> {
        let op = SessionOp::SignIn(username.to_string());
        let flight = {
            let mut guard = self.state.lock().await;
            match &guard.inflight {
                Some(inflight) if inflight.op == op => inflight.flight.clone(),
                _ => {
                    guard.epoch += 1;
                    guard.inflight = None;
                    self.start_op(&mut guard, op)
                }
            }
        };
        flight.await?;
        self.identity().await.ok_or(ClientError::NotSignedIn)
    }

    /// Revokes the credential on a best-effort basis and stops the scheduler.
    pub async fn sign_out(&self) {
        let credential = {
            let mut guard = self.state.lock().await;
            guard.epoch += 1;
            guard.inflight = None;
            guard.credential.take()
        };
        self.stop_scheduler().await;
        if let Some(credential) = credential {
            if let Err(err) = self.auth.revoke(&credential.access_token).await {
                warn!(
                    user_id = credential.subject.0,
                    "session: revoke failed during sign-out: {err}"
                );
            }
            info!(user_id = credential.subject.0, "session: signed out");
        }
    }

    pub async fn current_token(self: &Arc<Self>) -> Result<String, ClientError> {
        self.ensure_fresh().await?;
        self.state
            .lock()
            .await
            .credential
            .as_ref()
            .map(|credential| credential.access_token.clone())
            .ok_or(ClientError::NotSignedIn)
    }

    pub async fn current_expiry(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .await
            .credential
            .as_ref()
            .and_then(|credential| credential.expires_at)
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.state
            .lock()
            .await
            .credential
            .as_ref()
            .map(|credential| Identity {
                user_id: credential.subject,
                display_name: credential.display_name.clone(),
            })
    }

    pub async fn next_check_delay(&self) -> Duration {
        let remaining = self
            .current_expiry()
            .await
            .map(|expires_at| expires_at - Utc::now());
        self.policy.next_check_delay(remaining)
    }

    /// Re-arms itself after each check using [`RefreshPolicy::next_check_delay`].
    /// Armed automatically whenever a credential is installed.
    pub async fn start_scheduler(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut slot = self.scheduler.lock().await;
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let manager: Weak<Self> = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            loop {
                let delay = match manager.upgrade() {
                    Some(manager) => manager.next_check_delay().await,
                    None => break,
                };
                tokio::time::sleep(delay).await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if manager.identity().await.is_none() {
                    break;
                }
                if let Err(err) = manager.ensure_fresh().await {
                    warn!("session: scheduled refresh failed: {err}");
                }
            }
        }));
    }

    pub async fn stop_scheduler(&self) {
        if let Some(task) = self.scheduler.lock().await.take() {
            task.abort();
        }
    }

    /// Stops the scheduler for good; later credentials do not re-arm it.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.stop_scheduler().await;
    }

    fn start_op(self: &Arc<Self>, state: &mut SessionState, op: SessionOp) -> InflightOp {
        let manager = Arc::clone(self);
        let epoch = state.epoch;
        let key = op.clone();
        let task = tokio::spawn(async move {
            let result = manager.run_op(&key, epoch).await;
            let mut guard = manager.state.lock().await;
            if guard
                .inflight
                .as_ref()
                .is_some_and(|inflight| inflight.epoch == epoch)
            {
                guard.inflight = None;
            }
            result
        });
        let flight = async move {
            task.await.unwrap_or_else(|err| {
                Err(ClientError::CredentialUnavailable(format!(
                    "credential task ended unexpectedly: {err}"
                )))
            })
        }
        .boxed()
        .shared();
        state.inflight = Some(Inflight {
            op,
            epoch,
            flight: flight.clone(),
        });
        flight
    }

    async fn run_op(self: &Arc<Self>, op: &SessionOp, epoch: u64) -> Result<(), ClientError> {
        match op {
            SessionOp::Refresh => self.refresh_with_fallback(epoch).await,
            SessionOp::SignIn(username) => {
                let response = self.auth.issue(username).await?;
                if let Some(credential) = self.install(response, epoch).await {
                    info!(user_id = credential.subject.0, "session: signed in");
                }
                Ok(())
            }
        }
    }

    async fn refresh_with_fallback(self: &Arc<Self>, epoch: u64) -> Result<(), ClientError> {
        let access_token = self
            .state
            .lock()
            .await
            .credential
            .as_ref()
            .map(|credential| credential.access_token.clone());
        let Some(access_token) = access_token else {
            info!("session: no cached credential; provisioning disposable identity");
            return self.provision_fallback(epoch).await;
        };

        let err = match self.auth.refresh(&access_token).await {
            Ok(response) => {
                if let Some(credential) = self.install(response, epoch).await {
                    info!(
                        user_id = credential.subject.0,
                        expires_at = ?credential.expires_at,
                        "session: credential refreshed"
                    );
                }
                return Ok(());
            }
            Err(err) => err,
        };

        {
            let mut guard = self.state.lock().await;
            if guard.epoch != epoch {
                info!("session: refresh failed after the session was replaced; ignoring: {err}");
                return Ok(());
            }
            match RefreshFailure::classify(&err) {
                RefreshFailure::Rejected => {
                    warn!(
                        status = ?err.status(),
                        "session: refresh rejected; provisioning disposable identity: {err}"
                    );
                }
                RefreshFailure::Transport => {
                    warn!("session: refresh unreachable; clearing cached credential: {err}");
                    guard.credential = None;
                }
            }
        }
        self.provision_fallback(epoch).await
    }

    async fn provision_fallback(self: &Arc<Self>, epoch: u64) -> Result<(), ClientError> {
        match self.auth.provision_guest().await {
            Ok(response) => {
                if let Some(credential) = self.install(response, epoch).await {
                    info!(
                        user_id = credential.subject.0,
                        "session: disposable identity provisioned"
                    );
                }
                Ok(())
            }
            Err(err) => {
                error!("session: disposable identity provisioning failed: {err}");
                Err(ClientError::CredentialUnavailable(err.to_string()))
            }
        }
    }

    /// Returns `None` when the session moved to a newer epoch meanwhile.
    async fn install(self: &Arc<Self>, response: TokenResponse, epoch: u64) -> Option<Credential> {
        let credential = Credential::from_response(response);
        {
            let mut guard = self.state.lock().await;
            if guard.epoch != epoch {
                info!(
                    user_id = credential.subject.0,
                    "session: discarding credential from superseded operation"
                );
                return None;
            }
            guard.credential = Some(credential.clone());
        }
        self.start_scheduler().await;
        Some(credential)
    }
}

#[derive(Deserialize)]
struct ExpiryClaims {
    exp: Option<i64>,
}

/// Reads the `exp` marker of a JWT-shaped token without verifying it.
pub(crate) fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let header = decode_header(token).ok()?;
    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let data = decode::<ExpiryClaims>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    DateTime::from_timestamp(data.claims.exp?, 0)
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
