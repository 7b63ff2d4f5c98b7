// Claims-based authorization: tokens are put to the broker's `$cbs` node and
// refreshed before they lapse.
use crate::channel::RequestResponseChannel;
use crate::dispatcher::Scheduler;
use crate::engine::ReceiveLink;
use crate::error::{ConduitError, ConduitResult};
use crate::processor::ResourceProcessor;
use async_trait::async_trait;
use bytes::Bytes;
use conduit_wire::Message;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Handle;
use tokio::sync::watch;

pub const CBS_NODE: &str = "$cbs";
pub const PUT_TOKEN_OPERATION: &str = "put-token";
pub const DEFAULT_TOKEN_TYPE: &str = "jwt";
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// Audience a token must be issued for to access `entity_path`.
pub fn audience(hostname: &str, entity_path: &str) -> String {
    format!("amqp://{hostname}/{}", entity_path.trim_start_matches('/'))
}

#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: SystemTime,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// External credential provider.
#[async_trait]
pub trait TokenCredential: Send + Sync + 'static {
    async fn get_token(&self, audience: &str) -> ConduitResult<AccessToken>;
}

/// Hands out one fixed token, valid for `validity` from each request.
pub struct StaticTokenCredential {
    token: String,
    validity: Duration,
}

impl StaticTokenCredential {
    pub fn new(token: impl Into<String>, validity: Duration) -> Self {
        Self {
            token: token.into(),
            validity,
        }
    }
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    async fn get_token(&self, _audience: &str) -> ConduitResult<AccessToken> {
        Ok(AccessToken {
            token: self.token.clone(),
            expires_at: SystemTime::now() + self.validity,
        })
    }
}

/// Puts tokens to the `$cbs` node.
pub struct CbsAuthorizer {
    channels: ResourceProcessor<RequestResponseChannel>,
    credential: Arc<dyn TokenCredential>,
    token_type: String,
}

impl CbsAuthorizer {
    pub fn new(
        channels: ResourceProcessor<RequestResponseChannel>,
        credential: Arc<dyn TokenCredential>,
    ) -> Self {
        Self {
            channels,
            credential,
            token_type: DEFAULT_TOKEN_TYPE.to_string(),
        }
    }

    /// Fetch a token for `audience` and put it. Returns the token's expiry.
    ///
    /// A rejected token surfaces as [`ConduitError::Authorization`].
    pub async fn authorize(&self, audience: &str) -> ConduitResult<SystemTime> {
        let token = self.credential.get_token(audience).await?;
        let channel = self.channels.subscribe().await?;
        let request = put_token_request(audience, &self.token_type, &token);
        match channel.send_with_ack(request).await {
            Ok(_) => {
                tracing::debug!(audience, "token accepted");
                Ok(token.expires_at)
            }
            Err(ConduitError::Response {
                status,
                description,
            }) => Err(ConduitError::Authorization(format!(
                "{audience} rejected with {status}: {description}"
            ))),
            Err(err) => Err(err),
        }
    }
}

pub fn put_token_request(audience: &str, token_type: &str, token: &AccessToken) -> Message {
    let expiration = token
        .expires_at
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0);
    Message::new(Bytes::from(token.token.clone()))
        .with_property("operation", PUT_TOKEN_OPERATION)
        .with_property("type", token_type)
        .with_property("name", audience)
        .with_property("expiration", expiration)
}

#[derive(Debug, Clone)]
pub enum AuthorizationState {
    Pending,
    Authorized { expires_at: SystemTime },
    Failed(ConduitError),
}

/// Keeps one audience authorized.
///
/// The first [`TokenManager::ensure_authorized`] puts a token; each success
/// schedules a refresh at `refresh_ratio` of the remaining validity. A failed
/// refresh fails every receive link registered with [`TokenManager::watch`].
pub struct TokenManager {
    audience: String,
    authorizer: Arc<CbsAuthorizer>,
    scheduler: Arc<dyn Scheduler>,
    runtime: Handle,
    refresh_ratio: f64,
    state: watch::Sender<AuthorizationState>,
    authorizing: tokio::sync::Mutex<()>,
    dependents: Mutex<Vec<Weak<ReceiveLink>>>,
    closed: AtomicBool,
}

impl TokenManager {
    pub fn new(
        audience: impl Into<String>,
        authorizer: Arc<CbsAuthorizer>,
        scheduler: Arc<dyn Scheduler>,
        runtime: Handle,
        refresh_ratio: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            audience: audience.into(),
            authorizer,
            scheduler,
            runtime,
            refresh_ratio,
            state: watch::channel(AuthorizationState::Pending).0,
            authorizing: tokio::sync::Mutex::new(()),
            dependents: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn states(&self) -> watch::Receiver<AuthorizationState> {
        self.state.subscribe()
    }

    /// Authorize unless a put token is still current. Concurrent callers
    /// share one put.
    pub async fn ensure_authorized(self: &Arc<Self>) -> ConduitResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConduitError::closed(format!(
                "token manager for {} is closed",
                self.audience
            )));
        }
        let _guard = self.authorizing.lock().await;
        let current = self.state.borrow().clone();
        if let AuthorizationState::Authorized { expires_at } = current
            && expires_at > SystemTime::now()
        {
            return Ok(());
        }
        self.authorize().await
    }

    /// Fail `link` if authorization for this audience later fails.
    pub fn watch(&self, link: &Arc<ReceiveLink>) {
        let mut dependents = self.dependents.lock();
        dependents.retain(|dependent| dependent.strong_count() > 0);
        dependents.push(Arc::downgrade(link));
    }

    /// Stop refreshing. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dependents.lock().clear();
        tracing::debug!(audience = %self.audience, "token manager closed");
    }

    async fn authorize(self: &Arc<Self>) -> ConduitResult<()> {
        match self.authorizer.authorize(&self.audience).await {
            Ok(expires_at) => {
                self.state
                    .send_replace(AuthorizationState::Authorized { expires_at });
                t_counter!("conduit_client_token_puts_total", "outcome" => "ok").increment(1);
                self.schedule_refresh(expires_at);
                Ok(())
            }
            Err(err) => {
                self.state.send_replace(AuthorizationState::Failed(err.clone()));
                t_counter!("conduit_client_token_puts_total", "outcome" => "error").increment(1);
                Err(err)
            }
        }
    }

    fn schedule_refresh(self: &Arc<Self>, expires_at: SystemTime) {
        let delay = refresh_delay(expires_at, SystemTime::now(), self.refresh_ratio);
        let weak = Arc::downgrade(self);
        let runtime = self.runtime.clone();
        let scheduled = self.scheduler.schedule(
            delay,
            Box::new(move || {
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                runtime.spawn(async move { manager.refresh().await });
            }),
        );
        match scheduled {
            Ok(()) => {
                tracing::debug!(
                    audience = %self.audience,
                    delay_ms = delay.as_millis() as u64,
                    "token refresh scheduled"
                );
            }
            Err(err) => {
                tracing::debug!(audience = %self.audience, error = %err, "token refresh not scheduled");
            }
        }
    }

    async fn refresh(self: Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _guard = self.authorizing.lock().await;
        if let Err(err) = self.authorize().await {
            tracing::warn!(audience = %self.audience, error = %err, "token refresh failed");
            self.fail_dependents(err);
        }
    }

    /// Rejections stay terminal. Anything that may clear on reconnect fails
    /// the links with a retryable error so their replacements authorize anew.
    fn fail_dependents(&self, error: ConduitError) {
        let error = match error {
            err @ ConduitError::Authorization(_) => err,
            err if err.is_transient() => err,
            err @ (ConduitError::Closed(_) | ConduitError::DispatcherClosed) => {
                ConduitError::Transient(format!("{}: token channel lost: {err}", self.audience))
            }
            other => ConduitError::Authorization(format!("{}: {other}", self.audience)),
        };
        let dependents = std::mem::take(&mut *self.dependents.lock());
        for link in dependents.iter().filter_map(Weak::upgrade) {
            link.fail(error.clone());
        }
    }
}

/// `ratio` of the validity left at `now`, at least one second.
pub fn refresh_delay(expires_at: SystemTime, now: SystemTime, ratio: f64) -> Duration {
    let remaining = expires_at.duration_since(now).unwrap_or(Duration::ZERO);
    remaining.mul_f64(ratio.clamp(0.0, 1.0)).max(MIN_REFRESH_DELAY)
}
