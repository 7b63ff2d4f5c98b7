// Request/response channel over a paired send and receive link.
//
// Requests carry a generated message id and the channel's reply-to address;
// the broker echoes the id as the response's correlation id. Pending callers
// sit in a concurrent table and each entry is resolved at most once: the
// first of response, timeout, caller drop or link failure removes it.
use crate::endpoint::{EndpointState, settle, wait_active};
use crate::engine::{ReceiveLink, ReceiveLinkOptions, SendLink, Session};
use crate::error::{ConduitError, ConduitResult};
use crate::processor::Recoverable;
use crate::receive::InboundLink;
use conduit_wire::Message;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

pub const STATUS_CODE: &str = "status-code";
pub const STATUS_DESCRIPTION: &str = "status-description";
const LEGACY_STATUS_CODE: &str = "statusCode";
const LEGACY_STATUS_DESCRIPTION: &str = "statusDescription";

type PendingTable = DashMap<u64, oneshot::Sender<ConduitResult<Message>>>;

/// Reply address for requests to `entity_path`.
///
/// ```
/// use conduit_client::channel::reply_address;
///
/// assert_eq!(reply_address("$cbs"), "cbs-client-reply-to");
/// ```
pub fn reply_address(entity_path: &str) -> String {
    format!("{}-client-reply-to", entity_path.replace('$', ""))
}

/// Correlated request/response over one link pair.
pub struct RequestResponseChannel {
    id: String,
    entity_path: String,
    reply_to: String,
    send_link: Arc<SendLink>,
    receive_link: Arc<ReceiveLink>,
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    operation_timeout: Duration,
    state: Arc<watch::Sender<EndpointState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RequestResponseChannel {
    /// Attach both links on `session`. The channel becomes active once both
    /// links are.
    pub fn open(
        session: &Session,
        name: &str,
        entity_path: &str,
        operation_timeout: Duration,
        runtime: &Handle,
    ) -> ConduitResult<Arc<Self>> {
        let reply_to = reply_address(entity_path);
        let send_link = session.send_link(format!("{name}:sender"), entity_path)?;
        let receive_link = session.receive_link(
            format!("{name}:receiver"),
            entity_path,
            ReceiveLinkOptions {
                target: Some(reply_to.clone()),
                ..Default::default()
            },
        )?;
        let responses = receive_link
            .take_messages()
            .ok_or_else(|| ConduitError::closed("response stream already taken"))?;
        let channel = Arc::new(Self {
            id: name.to_string(),
            entity_path: entity_path.to_string(),
            reply_to,
            send_link,
            receive_link,
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            operation_timeout,
            state: Arc::new(watch::channel(EndpointState::Opening).0),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&channel);
        let mut responses = responses;
        let response_task = runtime.spawn(async move {
            while let Some(response) = responses.recv().await {
                let Some(channel) = weak.upgrade() else {
                    return;
                };
                channel.on_response(response);
            }
        });
        let monitor_task = runtime.spawn(monitor_links(
            Arc::downgrade(&channel),
            channel.send_link.endpoint_states(),
            channel.receive_link.endpoint_states(),
        ));
        channel.tasks.lock().extend([response_task, monitor_task]);
        tracing::debug!(channel = %channel.id, entity_path = %channel.entity_path, "request/response channel opening");
        Ok(channel)
    }

    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Send `request` and wait for its response.
    ///
    /// `request` must not carry a message id or reply-to address; both are
    /// assigned here. A response with a non-success status resolves as
    /// [`ConduitError::Response`] and leaves the channel healthy.
    pub async fn send_with_ack(&self, mut request: Message) -> ConduitResult<Message> {
        if request.message_id.is_some() || request.reply_to.is_some() {
            return Err(ConduitError::InvalidArgument(
                "request message id and reply-to are assigned by the channel".into(),
            ));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(ConduitError::closed(format!("channel {} is closed", self.id)));
        }
        let correlation_id = self.next_id.fetch_add(1, Ordering::AcqRel);
        request.message_id = Some(correlation_id.to_string());
        request.reply_to = Some(self.reply_to.clone());

        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id, tx);
        let _entry = PendingEntry {
            pending: Arc::clone(&self.pending),
            correlation_id,
        };

        let exchange = async {
            wait_active(self.send_link.endpoint_states(), self.operation_timeout).await?;
            wait_active(self.receive_link.endpoint_states(), self.operation_timeout).await?;
            self.receive_link.add_credits(1)?;
            self.send_link.send(request)?;
            rx.await
                .unwrap_or_else(|_| Err(ConduitError::closed("channel dropped the request")))
        };
        match tokio::time::timeout(self.operation_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(channel = %self.id, correlation_id, "request timed out");
                Err(ConduitError::Timeout(self.operation_timeout))
            }
        }
    }

    fn on_response(&self, response: Message) {
        let Some(correlation_id) = response
            .correlation_id
            .as_deref()
            .and_then(|value| value.parse::<u64>().ok())
        else {
            tracing::warn!(
                channel = %self.id,
                correlation_id = ?response.correlation_id,
                "response without a usable correlation id dropped"
            );
            return;
        };
        let Some((_, waiter)) = self.pending.remove(&correlation_id) else {
            tracing::warn!(channel = %self.id, correlation_id, "response for unknown request dropped");
            return;
        };
        let _ = waiter.send(classify_response(response));
    }

    fn fail_pending(&self, error: &ConduitError) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, waiter)) = self.pending.remove(&id) {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    /// Fail every pending request and close both links. Runs once, from
    /// either an explicit close or a terminal link state.
    fn shut_down(&self, outcome: EndpointState) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let error = match &outcome {
            EndpointState::Failed(err) => err.clone(),
            _ => ConduitError::closed(format!("channel {} closed", self.id)),
        };
        tracing::debug!(channel = %self.id, error = %error, "request/response channel down");
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.fail_pending(&error);
        self.send_link.close();
        self.receive_link.close();
        settle(&self.state, outcome);
    }
}

impl Recoverable for RequestResponseChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn endpoint_states(&self) -> watch::Receiver<EndpointState> {
        self.state.subscribe()
    }

    fn close(&self) {
        self.shut_down(EndpointState::Closed);
    }
}

impl Drop for RequestResponseChannel {
    fn drop(&mut self) {
        self.shut_down(EndpointState::Closed);
    }
}

struct PendingEntry {
    pending: Arc<PendingTable>,
    correlation_id: u64,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

/// Combined state of both directions: failed or closed as soon as either
/// is, active once both are.
async fn monitor_links(
    channel: std::sync::Weak<RequestResponseChannel>,
    mut send: watch::Receiver<EndpointState>,
    mut receive: watch::Receiver<EndpointState>,
) {
    loop {
        let send_state = send.borrow_and_update().clone();
        let receive_state = receive.borrow_and_update().clone();
        let Some(channel) = channel.upgrade() else {
            return;
        };
        match combine(send_state, receive_state) {
            outcome @ (EndpointState::Failed(_) | EndpointState::Closed) => {
                channel.shut_down(outcome);
                return;
            }
            EndpointState::Active => {
                channel.state.send_if_modified(|current| {
                    if matches!(current, EndpointState::Active) || current.is_terminal() {
                        return false;
                    }
                    *current = EndpointState::Active;
                    true
                });
            }
            _ => {}
        }
        drop(channel);
        tokio::select! {
            changed = send.changed() => if changed.is_err() { return },
            changed = receive.changed() => if changed.is_err() { return },
        }
    }
}

fn combine(send: EndpointState, receive: EndpointState) -> EndpointState {
    match (send, receive) {
        (EndpointState::Failed(err), _) | (_, EndpointState::Failed(err)) => {
            EndpointState::Failed(err)
        }
        (EndpointState::Closed, _) | (_, EndpointState::Closed) => EndpointState::Closed,
        (EndpointState::Active, EndpointState::Active) => EndpointState::Active,
        _ => EndpointState::Opening,
    }
}

/// Map a response's status properties to the caller's result.
pub fn classify_response(response: Message) -> ConduitResult<Message> {
    let status = response
        .property_i64(STATUS_CODE)
        .or_else(|| response.property_i64(LEGACY_STATUS_CODE));
    match status {
        Some(200 | 202 | 204) => Ok(response),
        status => {
            let description = response
                .property_str(STATUS_DESCRIPTION)
                .or_else(|| response.property_str(LEGACY_STATUS_DESCRIPTION))
                .unwrap_or("no status description")
                .to_string();
            Err(ConduitError::Response {
                status: status.unwrap_or(0),
                description,
            })
        }
    }
}
