// Upstream producers for the client's processors.
//
// Each holds a weak reference to the client; once the client is closed or
// dropped the sources report exhaustion and their processors complete.
use crate::auth;
use crate::channel::RequestResponseChannel;
use crate::client::client::ClientInner;
use crate::endpoint::wait_active;
use crate::engine::{Connection, ConnectionOptions, ReceiveLink, ReceiveLinkOptions};
use crate::error::{ConduitError, ConduitResult};
use crate::position::PositionTracker;
use crate::processor::{Recoverable, ResourceSource};
use async_trait::async_trait;
use std::sync::{Arc, Weak};

/// A connection that failed moments ago may still be cached when a
/// dependent retries; its closed dispatcher or endpoints must not read as
/// permanent failures.
fn retryable(err: ConduitError) -> ConduitError {
    match err {
        ConduitError::DispatcherClosed | ConduitError::Closed(_) => {
            ConduitError::Transient(format!("stale endpoint: {err}"))
        }
        other => other,
    }
}

pub(crate) struct ConnectionSource {
    pub(crate) client: Weak<ClientInner>,
}

#[async_trait]
impl ResourceSource<Connection> for ConnectionSource {
    async fn next(&self) -> Option<ConduitResult<Arc<Connection>>> {
        let client = self.client.upgrade().filter(|client| !client.is_closed())?;
        Some(open_connection(&client).await)
    }
}

async fn open_connection(client: &ClientInner) -> ConduitResult<Arc<Connection>> {
    let stream = client.connector.connect().await?;
    let options = ConnectionOptions {
        container_id: client.options.container_id.clone(),
        hostname: client.connector.hostname().to_string(),
        max_frame_size: client.options.max_frame_size,
    };
    let connection = Connection::open(stream, &options)?;
    if let Err(err) = wait_active(connection.endpoint_states(), client.options.operation_timeout).await
    {
        connection.close();
        return Err(err);
    }
    tracing::info!(connection = connection.id(), hostname = connection.hostname(), "connection active");
    Ok(connection)
}

/// Request/response channel to a broker node such as `$cbs`.
pub(crate) struct ChannelSource {
    pub(crate) client: Weak<ClientInner>,
    pub(crate) node: &'static str,
}

#[async_trait]
impl ResourceSource<RequestResponseChannel> for ChannelSource {
    async fn next(&self) -> Option<ConduitResult<Arc<RequestResponseChannel>>> {
        let client = self.client.upgrade().filter(|client| !client.is_closed())?;
        Some(self.open(&client).await.map_err(retryable))
    }
}

impl ChannelSource {
    async fn open(&self, client: &ClientInner) -> ConduitResult<Arc<RequestResponseChannel>> {
        let session = client.session(self.node).await?;
        let channel = RequestResponseChannel::open(
            &session,
            &format!("{}-channel", self.node.trim_start_matches('$')),
            self.node,
            client.options.operation_timeout,
            &client.runtime,
        )?;
        if let Err(err) =
            wait_active(channel.endpoint_states(), client.options.operation_timeout).await
        {
            channel.close();
            return Err(err);
        }
        Ok(channel)
    }
}

/// Receive links on one entity, each attached just after the last event
/// its predecessors buffered.
pub(crate) struct ReceiveLinkSource {
    pub(crate) client: Weak<ClientInner>,
    pub(crate) entity_path: String,
    pub(crate) tracker: Arc<PositionTracker>,
}

#[async_trait]
impl ResourceSource<ReceiveLink> for ReceiveLinkSource {
    async fn next(&self) -> Option<ConduitResult<Arc<ReceiveLink>>> {
        let client = self.client.upgrade().filter(|client| !client.is_closed())?;
        Some(self.open(&client).await.map_err(retryable))
    }
}

impl ReceiveLinkSource {
    async fn open(&self, client: &ClientInner) -> ConduitResult<Arc<ReceiveLink>> {
        let tokens = match &client.authorizer {
            Some(authorizer) => {
                let audience = auth::audience(client.connector.hostname(), &self.entity_path);
                let manager = client.token_manager(&audience, authorizer);
                manager.ensure_authorized().await?;
                Some(manager)
            }
            None => None,
        };
        let session = client.session(&self.entity_path).await?;
        let position = self.tracker.current();
        let name = format!("{}-{}", self.entity_path, uuid::Uuid::new_v4());
        let link = session.receive_link(
            name,
            &self.entity_path,
            ReceiveLinkOptions {
                filter: Some(position.filter_expression()),
                ..Default::default()
            },
        )?;
        if let Some(tokens) = tokens {
            tokens.watch(&link);
        }
        if let Err(err) = wait_active(link.endpoint_states(), client.options.operation_timeout).await
        {
            link.close();
            return Err(err);
        }
        tracing::debug!(
            link = link.id(),
            entity_path = %self.entity_path,
            position = %position.filter_expression(),
            "receive link active"
        );
        Ok(link)
    }
}
