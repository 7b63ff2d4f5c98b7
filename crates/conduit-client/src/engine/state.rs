// Protocol engine: all endpoint state of one connection.
//
// Lives on the connection's dispatcher thread and is only reached through
// dispatcher jobs. Endpoint states are published through watch channels
// shared with the handles; everything else is private to this thread.
use crate::dispatcher::Dispatcher;
use crate::endpoint::{EndpointState, settle};
use crate::engine::io::{read_loop, write_loop};
use crate::error::ConduitError;
use crate::receive::CreditSupplier;
use conduit_transport::{ConnectionId, TransportStream};
use conduit_wire::{ErrorCondition, Message, Performative};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub(crate) type StateTx = Arc<watch::Sender<EndpointState>>;

pub(crate) struct ReceiveEntry {
    pub(crate) name: String,
    pub(crate) state: StateTx,
    pub(crate) messages: mpsc::UnboundedSender<Message>,
    pub(crate) credit: u32,
    pub(crate) supplier: Option<CreditSupplier>,
}

pub(crate) struct SendEntry {
    pub(crate) name: String,
    pub(crate) state: StateTx,
    pub(crate) credit: u32,
    pub(crate) pending: VecDeque<Message>,
}

pub(crate) enum LinkEntry {
    Receive(ReceiveEntry),
    Send(SendEntry),
}

impl LinkEntry {
    fn state(&self) -> &StateTx {
        match self {
            Self::Receive(entry) => &entry.state,
            Self::Send(entry) => &entry.state,
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Receive(entry) => &entry.name,
            Self::Send(entry) => &entry.name,
        }
    }
}

struct SessionEntry {
    state: StateTx,
    links: HashMap<u32, LinkEntry>,
}

pub struct ConnectionEngine {
    id: ConnectionId,
    dispatcher: Dispatcher<ConnectionEngine>,
    outbound: Option<mpsc::UnboundedSender<Performative>>,
    state: StateTx,
    sessions: HashMap<u16, SessionEntry>,
    next_delivery_id: u64,
}

impl ConnectionEngine {
    /// Split the stream into reader and writer tasks on the current runtime
    /// and queue the `Open` performative.
    pub(crate) fn start(
        dispatcher: &Dispatcher<ConnectionEngine>,
        stream: TransportStream,
        state: StateTx,
        open: Performative,
    ) -> Self {
        let id = stream.info.id;
        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(reader, dispatcher.clone()));
        tokio::spawn(write_loop(writer, outbound_rx, dispatcher.clone()));
        let mut engine = Self {
            id,
            dispatcher: dispatcher.clone(),
            outbound: Some(outbound_tx),
            state,
            sessions: HashMap::new(),
            next_delivery_id: 0,
        };
        state_transition(&engine.state, EndpointState::Opening);
        engine.emit(open);
        tracing::debug!(connection_id = engine.id.0, "connection opening");
        engine
    }

    fn emit(&mut self, performative: Performative) {
        let sent = self
            .outbound
            .as_ref()
            .is_some_and(|outbound| outbound.send(performative).is_ok());
        if !sent {
            tracing::debug!(connection_id = self.id.0, "outbound queue closed, frame dropped");
        }
    }

    pub(crate) fn begin_session(&mut self, channel: u16, state: StateTx) {
        if self.state.borrow().is_terminal() {
            settle(&state, self.terminal_for_children());
            return;
        }
        state_transition(&state, EndpointState::Opening);
        self.sessions.insert(
            channel,
            SessionEntry {
                state,
                links: HashMap::new(),
            },
        );
        self.emit(Performative::Begin {
            channel,
            remote_channel: None,
        });
    }

    pub(crate) fn attach_link(&mut self, channel: u16, handle: u32, attach: Performative, entry: LinkEntry) {
        let inherited = self.terminal_for_children();
        let Some(session) = self.sessions.get_mut(&channel) else {
            settle(entry.state(), inherited);
            return;
        };
        if session.state.borrow().is_terminal() {
            settle(entry.state(), session_outcome(&session.state));
            return;
        }
        state_transition(entry.state(), EndpointState::Opening);
        tracing::debug!(
            connection_id = self.id.0,
            channel,
            handle,
            link = entry.name(),
            "attaching link"
        );
        session.links.insert(handle, entry);
        self.emit(attach);
    }

    pub(crate) fn add_credit(&mut self, channel: u16, handle: u32, credits: u32) {
        if credits == 0 {
            return;
        }
        let Some(LinkEntry::Receive(entry)) = self.link_mut(channel, handle) else {
            return;
        };
        entry.credit = entry.credit.saturating_add(credits);
        t_counter!("conduit_client_credits_granted_total").increment(u64::from(credits));
        #[cfg(feature = "telemetry")]
        crate::counters::frame_counters()
            .credits_granted
            .fetch_add(u64::from(credits), std::sync::atomic::Ordering::Relaxed);
        self.emit(Performative::Flow {
            channel,
            handle,
            link_credit: credits,
        });
    }

    pub(crate) fn set_supplier(&mut self, channel: u16, handle: u32, supplier: CreditSupplier) {
        if let Some(LinkEntry::Receive(entry)) = self.link_mut(channel, handle) {
            entry.supplier = Some(supplier);
        }
    }

    /// Consult the supplier if the link has no credit left.
    pub(crate) fn replenish(&mut self, channel: u16, handle: u32) {
        let credits = match self.link_mut(channel, handle) {
            Some(LinkEntry::Receive(entry)) if entry.credit == 0 => {
                entry.supplier.as_ref().map_or(0, |supplier| supplier())
            }
            _ => 0,
        };
        self.add_credit(channel, handle, credits);
    }

    pub(crate) fn send_transfer(&mut self, channel: u16, handle: u32, message: Message) {
        match self.link_mut(channel, handle) {
            Some(LinkEntry::Send(entry)) => entry.pending.push_back(message),
            _ => {
                tracing::debug!(connection_id = self.id.0, channel, handle, "transfer on unknown link dropped");
                return;
            }
        }
        self.flush_pending(channel, handle);
    }

    fn flush_pending(&mut self, channel: u16, handle: u32) {
        let mut ready = Vec::new();
        if let Some(LinkEntry::Send(entry)) = self.link_mut(channel, handle) {
            while entry.credit > 0 {
                let Some(message) = entry.pending.pop_front() else {
                    break;
                };
                entry.credit -= 1;
                ready.push(message);
            }
        }
        for message in ready {
            let delivery_id = self.next_delivery_id;
            self.next_delivery_id += 1;
            self.emit(Performative::Transfer {
                channel,
                handle,
                delivery_id,
                message,
            });
        }
    }

    /// Local detach: the link is closed at once, the peer is told.
    pub(crate) fn detach_link(&mut self, channel: u16, handle: u32, error: Option<ErrorCondition>) {
        let Some(entry) = self
            .sessions
            .get_mut(&channel)
            .and_then(|session| session.links.remove(&handle))
        else {
            return;
        };
        settle(entry.state(), EndpointState::Closed);
        self.emit(Performative::Detach {
            channel,
            handle,
            closed: true,
            error,
        });
    }

    pub(crate) fn end_session(&mut self, channel: u16) {
        let Some(session) = self.sessions.remove(&channel) else {
            return;
        };
        close_session(&session, EndpointState::Closed);
        self.emit(Performative::End {
            channel,
            error: None,
        });
    }

    /// Local close. The writer closes the dispatcher once `Close` is out.
    pub(crate) fn close(&mut self) {
        for (_, session) in self.sessions.drain() {
            close_session(&session, EndpointState::Closed);
        }
        settle(&self.state, EndpointState::Closed);
        self.emit(Performative::Close { error: None });
        if self.outbound.take().is_none() {
            self.dispatcher.close();
        }
        tracing::debug!(connection_id = self.id.0, "connection closed locally");
    }

    pub(crate) fn on_performative(&mut self, performative: Performative) {
        tracing::trace!(connection_id = self.id.0, performative = performative.name(), "inbound");
        match performative {
            Performative::Open { container_id, .. } => {
                tracing::debug!(connection_id = self.id.0, peer = %container_id, "connection active");
                state_transition(&self.state, EndpointState::Active);
            }
            Performative::Begin {
                channel,
                remote_channel,
            } => {
                let local = remote_channel.unwrap_or(channel);
                if let Some(session) = self.sessions.get(&local) {
                    state_transition(&session.state, EndpointState::Active);
                }
            }
            Performative::Attach { channel, handle, .. } => {
                if let Some(entry) = self.link_mut(channel, handle) {
                    state_transition(entry.state(), EndpointState::Active);
                }
            }
            Performative::Flow {
                channel,
                handle,
                link_credit,
            } => {
                if let Some(LinkEntry::Send(entry)) = self.link_mut(channel, handle) {
                    entry.credit = entry.credit.saturating_add(link_credit);
                    self.flush_pending(channel, handle);
                }
            }
            Performative::Transfer {
                channel,
                handle,
                message,
                ..
            } => self.on_transfer(channel, handle, message),
            Performative::Detach {
                channel,
                handle,
                error,
                ..
            } => {
                let Some(entry) = self
                    .sessions
                    .get_mut(&channel)
                    .and_then(|session| session.links.remove(&handle))
                else {
                    return;
                };
                tracing::debug!(
                    connection_id = self.id.0,
                    link = entry.name(),
                    error = ?error,
                    "link detached by peer"
                );
                settle(entry.state(), remote_outcome(error));
            }
            Performative::End { channel, error } => {
                if let Some(session) = self.sessions.remove(&channel) {
                    tracing::debug!(connection_id = self.id.0, channel, error = ?error, "session ended by peer");
                    close_session(&session, remote_outcome(error));
                }
            }
            Performative::Close { error } => {
                tracing::info!(connection_id = self.id.0, error = ?error, "connection closed by peer");
                self.shutdown(remote_outcome(error));
            }
        }
    }

    fn on_transfer(&mut self, channel: u16, handle: u32, message: Message) {
        let credits = {
            let Some(LinkEntry::Receive(entry)) = self.link_mut(channel, handle) else {
                tracing::debug!(connection_id = self.id.0, channel, handle, "transfer for unknown link");
                return;
            };
            entry.credit = entry.credit.saturating_sub(1);
            let _ = entry.messages.send(message);
            if entry.credit > 0 {
                0
            } else {
                entry.supplier.as_ref().map_or(0, |supplier| supplier())
            }
        };
        t_counter!("conduit_client_transfers_received_total").increment(1);
        #[cfg(feature = "telemetry")]
        crate::counters::frame_counters()
            .transfers_in
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.add_credit(channel, handle, credits);
    }

    pub(crate) fn on_transport_closed(&mut self, reason: Option<String>) {
        if self.state.borrow().is_terminal() {
            self.shutdown(EndpointState::Closed);
            return;
        }
        let reason = reason.unwrap_or_else(|| "connection reset by peer".to_string());
        tracing::warn!(connection_id = self.id.0, reason = %reason, "transport closed");
        self.shutdown(EndpointState::Failed(ConduitError::Transient(format!(
            "transport closed: {reason}"
        ))));
    }

    fn shutdown(&mut self, outcome: EndpointState) {
        for (_, session) in self.sessions.drain() {
            close_session(&session, outcome.clone());
        }
        settle(&self.state, outcome);
        if self.outbound.take().is_none() {
            self.dispatcher.close();
        }
    }

    fn link_mut(&mut self, channel: u16, handle: u32) -> Option<&mut LinkEntry> {
        self.sessions
            .get_mut(&channel)
            .and_then(|session| session.links.get_mut(&handle))
    }

    fn terminal_for_children(&self) -> EndpointState {
        session_outcome(&self.state)
    }
}

impl Drop for ConnectionEngine {
    fn drop(&mut self) {
        for (_, session) in self.sessions.drain() {
            close_session(&session, EndpointState::Closed);
        }
        settle(&self.state, EndpointState::Closed);
    }
}

/// Move a non-terminal endpoint forward; terminal states are kept.
fn state_transition(state: &StateTx, next: EndpointState) {
    state.send_if_modified(|current| {
        if current.is_terminal() {
            return false;
        }
        *current = next;
        true
    });
}

fn session_outcome(state: &StateTx) -> EndpointState {
    match &*state.borrow() {
        EndpointState::Failed(err) => EndpointState::Failed(err.clone()),
        _ => EndpointState::Closed,
    }
}

fn close_session(session: &SessionEntry, outcome: EndpointState) {
    for entry in session.links.values() {
        settle(entry.state(), outcome.clone());
    }
    settle(&session.state, outcome);
}

fn remote_outcome(error: Option<ErrorCondition>) -> EndpointState {
    match error {
        Some(condition) => EndpointState::Failed(ConduitError::Protocol(condition)),
        None => EndpointState::Closed,
    }
}
