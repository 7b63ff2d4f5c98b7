// Thread-safe handles onto engine endpoints.
//
// Every mutation is a job submitted to the connection's dispatcher; handles
// only hold identifiers and a view of the endpoint's state.
use crate::dispatcher::Dispatcher;
use crate::endpoint::{EndpointState, settle};
use crate::engine::state::{ConnectionEngine, LinkEntry, ReceiveEntry, SendEntry, StateTx};
use crate::error::{ConduitError, ConduitResult};
use crate::processor::Recoverable;
use crate::receive::{CreditSupplier, InboundLink};
use conduit_transport::{ConnectionId, TransportStream};
use conduit_wire::{ErrorCondition, Message, Performative, Role, Value};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

/// Parameters of the `Open` performative.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub container_id: String,
    pub hostname: String,
    pub max_frame_size: u32,
}

fn new_state() -> (StateTx, watch::Receiver<EndpointState>) {
    let (tx, rx) = watch::channel(EndpointState::Uninitialized);
    (Arc::new(tx), rx)
}

/// One multiplexed connection to a broker.
pub struct Connection {
    id: String,
    connection_id: ConnectionId,
    hostname: String,
    dispatcher: Dispatcher<ConnectionEngine>,
    state: StateTx,
    sessions: Arc<DashMap<String, Arc<Session>>>,
    next_channel: AtomicU16,
    closed: AtomicBool,
}

impl Connection {
    /// Start the connection's dispatcher and open the protocol connection on
    /// `stream`. The returned connection is `Opening`; wait for `Active` via
    /// its endpoint states.
    pub fn open(stream: TransportStream, options: &ConnectionOptions) -> ConduitResult<Arc<Self>> {
        let connection_id = stream.info.id;
        let (state, _) = new_state();
        let open = Performative::Open {
            container_id: options.container_id.clone(),
            hostname: options.hostname.clone(),
            max_frame_size: options.max_frame_size,
        };
        let engine_state = Arc::clone(&state);
        let dispatcher = Dispatcher::spawn(
            format!("conduit-connection-{}", connection_id.0),
            move |dispatcher| ConnectionEngine::start(dispatcher, stream, engine_state, open),
        )?;
        t_counter!("conduit_client_connections_opened_total").increment(1);
        Ok(Arc::new(Self {
            id: format!("connection-{}", connection_id.0),
            connection_id,
            hostname: options.hostname.clone(),
            dispatcher,
            state,
            sessions: Arc::new(DashMap::new()),
            next_channel: AtomicU16::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn state(&self) -> EndpointState {
        self.state.borrow().clone()
    }

    /// Session registered under `name`, begun on first use.
    ///
    /// Only one session exists per name, even under concurrent callers. A
    /// session that has closed or failed is replaced.
    pub fn session(&self, name: &str) -> ConduitResult<Arc<Session>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConduitError::closed(format!("{} is closed", self.id)));
        }
        match self.sessions.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().state.borrow().is_terminal() {
                    return Ok(Arc::clone(occupied.get()));
                }
                let session = self.begin_session(name)?;
                occupied.insert(Arc::clone(&session));
                self.forget_when_ended(name, &session);
                Ok(session)
            }
            Entry::Vacant(vacant) => {
                let session = self.begin_session(name)?;
                vacant.insert(Arc::clone(&session));
                self.forget_when_ended(name, &session);
                Ok(session)
            }
        }
    }

    /// Drop the registry entry once `session` ends, unless it was replaced.
    /// Outside a runtime the entry is replaced on the next lookup instead.
    fn forget_when_ended(&self, name: &str, session: &Arc<Session>) {
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let sessions = Arc::downgrade(&self.sessions);
        let ended = Arc::downgrade(session);
        let mut states = session.state.subscribe();
        let name = name.to_string();
        runtime.spawn(async move {
            if states.wait_for(EndpointState::is_terminal).await.is_err() {
                return;
            }
            if let Some(sessions) = sessions.upgrade() {
                sessions.remove_if(&name, |_, current| {
                    std::ptr::eq(Arc::as_ptr(current), ended.as_ptr())
                });
            }
        });
    }

    /// End and forget the session registered under `name`.
    pub fn remove_session(&self, name: &str) {
        if let Some((_, session)) = self.sessions.remove(name) {
            session.close();
        }
    }

    /// Sessions that have not ended yet.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn begin_session(&self, name: &str) -> ConduitResult<Arc<Session>> {
        let channel = self.next_channel.fetch_add(1, Ordering::AcqRel);
        let (state, _) = new_state();
        let engine_state = Arc::clone(&state);
        self.dispatcher
            .submit(move |engine| engine.begin_session(channel, engine_state))?;
        tracing::debug!(connection = %self.id, session = name, channel, "session requested");
        Ok(Arc::new(Session {
            name: name.to_string(),
            channel,
            dispatcher: self.dispatcher.clone(),
            state,
            next_handle: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }))
    }
}

impl Recoverable for Connection {
    fn id(&self) -> &str {
        &self.id
    }

    fn endpoint_states(&self) -> watch::Receiver<EndpointState> {
        self.state.subscribe()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sessions.clear();
        if self.dispatcher.submit(|engine| engine.close()).is_err() {
            settle(&self.state, EndpointState::Closed);
        }
        tracing::debug!(connection = %self.id, "connection close requested");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state.borrow().name())
            .finish()
    }
}

/// Options for attaching a receive link.
#[derive(Debug, Clone, Default)]
pub struct ReceiveLinkOptions {
    /// Address the peer should deliver to, e.g. a reply-to address.
    pub target: Option<String>,
    /// Attach filter, e.g. an event position expression.
    pub filter: Option<String>,
    pub properties: BTreeMap<String, Value>,
}

/// A named group of links on one connection channel.
pub struct Session {
    name: String,
    channel: u16,
    dispatcher: Dispatcher<ConnectionEngine>,
    state: StateTx,
    next_handle: AtomicU32,
    closed: AtomicBool,
}

impl Session {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    pub fn endpoint_states(&self) -> watch::Receiver<EndpointState> {
        self.state.subscribe()
    }

    /// Attach a receiving link reading from `source`.
    pub fn receive_link(
        &self,
        name: impl Into<String>,
        source: &str,
        options: ReceiveLinkOptions,
    ) -> ConduitResult<Arc<ReceiveLink>> {
        let name = name.into();
        let handle = self.next_handle.fetch_add(1, Ordering::AcqRel);
        let (state, _) = new_state();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let attach = Performative::Attach {
            channel: self.channel,
            handle,
            name: name.clone(),
            role: Role::Receiver,
            source: Some(source.to_string()),
            target: options.target,
            filter: options.filter,
            properties: options.properties,
        };
        let entry = LinkEntry::Receive(ReceiveEntry {
            name: name.clone(),
            state: Arc::clone(&state),
            messages: messages_tx,
            credit: 0,
            supplier: None,
        });
        let channel = self.channel;
        self.dispatcher
            .submit(move |engine| engine.attach_link(channel, handle, attach, entry))?;
        Ok(Arc::new(ReceiveLink {
            link: LinkRef {
                name,
                entity_path: source.to_string(),
                channel,
                handle,
                dispatcher: self.dispatcher.clone(),
                state,
                closed: AtomicBool::new(false),
            },
            messages: Mutex::new(Some(messages_rx)),
        }))
    }

    /// Attach a sending link writing to `target`.
    pub fn send_link(&self, name: impl Into<String>, target: &str) -> ConduitResult<Arc<SendLink>> {
        let name = name.into();
        let handle = self.next_handle.fetch_add(1, Ordering::AcqRel);
        let (state, _) = new_state();
        let attach = Performative::Attach {
            channel: self.channel,
            handle,
            name: name.clone(),
            role: Role::Sender,
            source: None,
            target: Some(target.to_string()),
            filter: None,
            properties: BTreeMap::new(),
        };
        let entry = LinkEntry::Send(SendEntry {
            name: name.clone(),
            state: Arc::clone(&state),
            credit: 0,
            pending: VecDeque::new(),
        });
        let channel = self.channel;
        self.dispatcher
            .submit(move |engine| engine.attach_link(channel, handle, attach, entry))?;
        Ok(Arc::new(SendLink {
            link: LinkRef {
                name,
                entity_path: target.to_string(),
                channel,
                handle,
                dispatcher: self.dispatcher.clone(),
                state,
                closed: AtomicBool::new(false),
            },
        }))
    }

    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channel = self.channel;
        if self.dispatcher.submit(move |engine| engine.end_session(channel)).is_err() {
            settle(&self.state, EndpointState::Closed);
        }
    }
}

struct LinkRef {
    name: String,
    entity_path: String,
    channel: u16,
    handle: u32,
    dispatcher: Dispatcher<ConnectionEngine>,
    state: StateTx,
    closed: AtomicBool,
}

impl LinkRef {
    fn submit<F>(&self, work: F) -> ConduitResult<()>
    where
        F: FnOnce(&mut ConnectionEngine, u16, u32) + Send + 'static,
    {
        let (channel, handle) = (self.channel, self.handle);
        self.dispatcher.submit(move |engine| work(engine, channel, handle))
    }

    fn detach(&self, error: Option<ErrorCondition>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self
            .submit(move |engine, channel, handle| engine.detach_link(channel, handle, error))
            .is_err()
        {
            settle(&self.state, EndpointState::Closed);
        }
    }
}

/// Receiving end of a link.
pub struct ReceiveLink {
    link: LinkRef,
    messages: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

impl ReceiveLink {
    pub fn entity_path(&self) -> &str {
        &self.link.entity_path
    }

    pub fn state(&self) -> EndpointState {
        self.link.state.borrow().clone()
    }

    /// Fail the link from outside the engine, e.g. after its authorization
    /// lapsed. The link's processor sees the failure on its state stream.
    pub fn fail(&self, error: ConduitError) {
        tracing::debug!(link = %self.link.name, error = %error, "failing link");
        settle(&self.link.state, EndpointState::Failed(error));
        self.link.detach(None);
    }
}

impl Recoverable for ReceiveLink {
    fn id(&self) -> &str {
        &self.link.name
    }

    fn endpoint_states(&self) -> watch::Receiver<EndpointState> {
        self.link.state.subscribe()
    }

    fn close(&self) {
        self.link.detach(None);
    }
}

impl InboundLink for ReceiveLink {
    fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.messages.lock().take()
    }

    fn add_credits(&self, credits: u32) -> ConduitResult<()> {
        self.link
            .submit(move |engine, channel, handle| engine.add_credit(channel, handle, credits))
    }

    fn set_credit_supplier(&self, supplier: CreditSupplier) -> ConduitResult<()> {
        self.link
            .submit(move |engine, channel, handle| engine.set_supplier(channel, handle, supplier))
    }

    fn replenish_if_empty(&self) -> ConduitResult<()> {
        self.link
            .submit(|engine, channel, handle| engine.replenish(channel, handle))
    }
}

/// Sending end of a link. Transfers queue until the peer grants credit.
pub struct SendLink {
    link: LinkRef,
}

impl SendLink {
    pub fn entity_path(&self) -> &str {
        &self.link.entity_path
    }

    pub fn send(&self, message: Message) -> ConduitResult<()> {
        if self.link.closed.load(Ordering::Acquire) {
            return Err(ConduitError::closed(format!("{} is closed", self.link.name)));
        }
        self.link
            .submit(move |engine, channel, handle| engine.send_transfer(channel, handle, message))
    }
}

impl Recoverable for SendLink {
    fn id(&self) -> &str {
        &self.link.name
    }

    fn endpoint_states(&self) -> watch::Receiver<EndpointState> {
        self.link.state.subscribe()
    }

    fn close(&self) {
        self.link.detach(None);
    }
}
