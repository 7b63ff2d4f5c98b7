//! Client facade composing connections, sessions, channels and receivers.
//!
//! # Purpose
//! Turns "receive from entity X at position P" and "talk to the management
//! node" into recoverable resources: one cached connection, named sessions
//! on it, cached `$cbs`/`$management` channels and one flow-controlled
//! pipeline per receiver.
//!
//! # Design notes
//! Every resource kind is a [`ResourceProcessor`] over a source that builds
//! on the layer below: a receive link asks for a session, which asks for the
//! connection. A failure anywhere is retried by the owning processor, so a
//! dropped connection rebuilds its dependents lazily as they recover.
use crate::auth::{CBS_NODE, CbsAuthorizer, TokenCredential, TokenManager};
use crate::channel::RequestResponseChannel;
use crate::client::connector::Connector;
use crate::client::sources::{ChannelSource, ConnectionSource, ReceiveLinkSource};
use crate::config::ClientOptions;
use crate::dispatcher::{Dispatcher, Scheduler};
use crate::endpoint::wait_active;
use crate::engine::{Connection, ReceiveLink, Session};
use crate::error::{ConduitError, ConduitResult};
use crate::management::{MANAGEMENT_NODE, ManagementNode};
use crate::position::{EventPosition, PositionTracker};
use crate::processor::{ProcessorOptions, ResourceProcessor};
use crate::receive::{BufferedHook, EventReceiver, PipelineOptions, ReceivePipeline};
use crate::retry::{RetryPolicy, retry_policy};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Handle;

pub(crate) struct ClientInner {
    pub(crate) options: ClientOptions,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) runtime: Handle,
    pub(crate) authorizer: Option<Arc<CbsAuthorizer>>,
    timer: Dispatcher<()>,
    policy: Arc<dyn RetryPolicy>,
    connections: ResourceProcessor<Connection>,
    cbs: ResourceProcessor<RequestResponseChannel>,
    management: ResourceProcessor<RequestResponseChannel>,
    token_managers: DashMap<String, Arc<TokenManager>>,
    receivers: Mutex<Vec<ReceivePipeline<ReceiveLink>>>,
    closed: AtomicBool,
}

impl ClientInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn scheduler(&self) -> Arc<dyn Scheduler> {
        Arc::new(self.timer.clone())
    }

    pub(crate) async fn connection(&self) -> ConduitResult<Arc<Connection>> {
        if self.is_closed() {
            return Err(ConduitError::closed("client is closed"));
        }
        self.connections.subscribe().await
    }

    /// Session `name` on the current connection, active.
    pub(crate) async fn session(&self, name: &str) -> ConduitResult<Arc<Session>> {
        let connection = self.connection().await?;
        let session = connection.session(name)?;
        wait_active(session.endpoint_states(), self.options.operation_timeout).await?;
        Ok(session)
    }

    pub(crate) fn token_manager(
        &self,
        audience: &str,
        authorizer: &Arc<CbsAuthorizer>,
    ) -> Arc<TokenManager> {
        self.token_managers
            .entry(audience.to_string())
            .or_insert_with(|| {
                TokenManager::new(
                    audience,
                    Arc::clone(authorizer),
                    self.scheduler(),
                    self.runtime.clone(),
                    self.options.token_refresh_ratio,
                )
            })
            .clone()
    }
}

/// Entry point for talking to one broker.
///
/// Must be created inside a Tokio runtime. Dropping the client closes it.
pub struct ConduitClient {
    inner: Arc<ClientInner>,
}

impl ConduitClient {
    /// Build a client. Nothing connects until the first operation needs to.
    ///
    /// Without a `credential` links are attached without authorization.
    pub fn new(
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        credential: Option<Arc<dyn TokenCredential>>,
    ) -> ConduitResult<Self> {
        options.install();
        let runtime = Handle::try_current().map_err(|_| {
            ConduitError::InvalidArgument("ConduitClient must be created inside a Tokio runtime".into())
        })?;
        let timer = Dispatcher::spawn("conduit-timer", |_| ())?;
        let policy = retry_policy(&options.retry);
        let inner = Arc::new_cyclic(|client| {
            let scheduler: Arc<dyn Scheduler> = Arc::new(timer.clone());
            let connections = ResourceProcessor::new(
                ProcessorOptions::new("connection"),
                Arc::new(ConnectionSource {
                    client: client.clone(),
                }),
                Arc::clone(&policy),
                Arc::clone(&scheduler),
                runtime.clone(),
            );
            let channels = |node: &'static str| {
                ResourceProcessor::new(
                    ProcessorOptions::new(node),
                    Arc::new(ChannelSource {
                        client: client.clone(),
                        node,
                    }),
                    Arc::clone(&policy),
                    Arc::clone(&scheduler),
                    runtime.clone(),
                )
            };
            let cbs = channels(CBS_NODE);
            let management = channels(MANAGEMENT_NODE);
            let authorizer =
                credential.map(|credential| Arc::new(CbsAuthorizer::new(cbs.clone(), credential)));
            ClientInner {
                options,
                connector,
                runtime: runtime.clone(),
                authorizer,
                timer: timer.clone(),
                policy: Arc::clone(&policy),
                connections,
                cbs,
                management,
                token_managers: DashMap::new(),
                receivers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }
        });
        tracing::debug!(
            hostname = inner.connector.hostname(),
            container_id = %inner.options.container_id,
            "client created"
        );
        Ok(Self { inner })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// The live connection, opened on first use and replaced after failure.
    pub async fn connection(&self) -> ConduitResult<Arc<Connection>> {
        self.inner.connection().await
    }

    pub async fn session(&self, name: &str) -> ConduitResult<Arc<Session>> {
        self.inner.session(name).await
    }

    /// Flow-controlled receive stream over `entity_path` starting at
    /// `position`. Attach a [`crate::Subscriber`] to start receiving.
    pub fn receive_pipeline(
        &self,
        entity_path: &str,
        position: EventPosition,
    ) -> ConduitResult<ReceivePipeline<ReceiveLink>> {
        if self.inner.is_closed() {
            return Err(ConduitError::closed("client is closed"));
        }
        if entity_path.is_empty() {
            return Err(ConduitError::InvalidArgument("entity path is empty".into()));
        }
        let tracker = Arc::new(PositionTracker::new(position));
        let processor = ResourceProcessor::new(
            ProcessorOptions::new(format!("receive:{entity_path}")).reconnect_on_close(true),
            Arc::new(ReceiveLinkSource {
                client: Arc::downgrade(&self.inner),
                entity_path: entity_path.to_string(),
                tracker: Arc::clone(&tracker),
            }),
            Arc::clone(&self.inner.policy),
            self.inner.scheduler(),
            self.inner.runtime.clone(),
        );
        let on_buffered: BufferedHook = Arc::new(move |message| tracker.record(message));
        let pipeline = ReceivePipeline::new(
            entity_path,
            PipelineOptions {
                prefetch: self.inner.options.prefetch,
                max_queue_size: self.inner.options.max_queue_size,
            },
            processor,
            self.inner.runtime.clone(),
            Some(on_buffered),
        );
        let mut receivers = self.inner.receivers.lock();
        receivers.retain(|receiver| !receiver.is_terminated());
        receivers.push(pipeline.clone());
        Ok(pipeline)
    }

    /// Pull-based receiver over `entity_path`.
    pub fn receiver(&self, entity_path: &str, position: EventPosition) -> ConduitResult<EventReceiver> {
        let pipeline = self.receive_pipeline(entity_path, position)?;
        EventReceiver::new(pipeline, self.inner.options.receive_batch)
    }

    pub fn management(&self) -> ManagementNode {
        ManagementNode::new(self.inner.management.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Dispose receivers, channels and the connection. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let receivers = std::mem::take(&mut *self.inner.receivers.lock());
        for receiver in receivers {
            receiver.dispose();
        }
        for manager in self.inner.token_managers.iter() {
            manager.close();
        }
        self.inner.token_managers.clear();
        self.inner.management.dispose();
        self.inner.cbs.dispose();
        self.inner.connections.dispose();
        self.inner.timer.close();
        tracing::debug!(hostname = self.inner.connector.hostname(), "client closed");
    }
}

impl Drop for ConduitClient {
    fn drop(&mut self) {
        self.close();
    }
}
