// In-process broker speaking the conduit wire protocol, for end-to-end tests.
//
// It answers Open/Begin/Attach, grants credit to client senders, answers
// `$cbs` and `$management` requests on the client's reply link and delivers
// partition events within the credit the client grants. Hooks let tests
// publish events, detach receivers, drop connections and reject tokens.
#![allow(dead_code)]

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use conduit_transport::{QuicServer, TransportConfig, TransportStream};
use conduit_wire::{ErrorCondition, Frame, FrameHeader, Message, Performative, Role, Value};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const SEQUENCE_NUMBER: &str = "x-opt-sequence-number";
pub const OFFSET: &str = "x-opt-offset";
const SENDER_CREDIT: u32 = 100;

/// Attach filter seen by the broker, by link source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRecord {
    pub source: String,
    pub filter: Option<String>,
}

enum Delivery {
    Events { source: String, next: usize },
    Responses { pending: VecDeque<Message> },
}

struct OutboundLink {
    channel: u16,
    handle: u32,
    target: Option<String>,
    credit: u32,
    delivery: Delivery,
    next_delivery_id: u64,
}

struct InboundLink {
    target: Option<String>,
}

#[derive(Default)]
struct ConnectionLinks {
    // Links the broker sends on (client receivers), by (channel, handle).
    outbound: HashMap<(u16, u32), OutboundLink>,
    // Links the broker receives on (client senders).
    inbound: HashMap<(u16, u32), InboundLink>,
}

struct BrokerConnection {
    outbound: mpsc::UnboundedSender<Performative>,
    links: Mutex<ConnectionLinks>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct BrokerState {
    partitions: Mutex<HashMap<String, Vec<Message>>>,
    connections: Mutex<Vec<Arc<BrokerConnection>>>,
    attaches: Mutex<Vec<AttachRecord>>,
    deny_tokens: AtomicBool,
    token_puts: AtomicUsize,
    connections_accepted: AtomicUsize,
    requests: AtomicUsize,
}

pub struct MockBroker {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    accept_task: JoinHandle<()>,
}

impl MockBroker {
    /// Listen on a loopback TCP port.
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind mock broker")?;
        let addr = listener.local_addr().context("mock broker address")?;
        let state = Arc::new(BrokerState::default());
        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                serve(Arc::clone(&accept_state), TransportStream::from_io(socket));
            }
        });
        Ok(Self {
            addr,
            state,
            accept_task,
        })
    }

    /// Listen for QUIC connections; each connection's first bidirectional
    /// stream carries the protocol. Returns the certificate to trust.
    pub async fn start_quic() -> Result<(Self, quinn::ClientConfig)> {
        let (server_config, client_config) = quic_configs()?;
        let server = QuicServer::bind(
            "127.0.0.1:0".parse()?,
            server_config,
            TransportConfig::default(),
        )?;
        let addr = server.local_addr()?;
        let state = Arc::new(BrokerState::default());
        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok(connection) = server.accept().await {
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    if let Ok(stream) = connection.accept_stream().await {
                        serve(state, stream);
                    }
                });
            }
        });
        Ok((
            Self {
                addr,
                state,
                accept_task,
            },
            client_config,
        ))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Append events to `source`, numbering them from the partition's end.
    pub fn publish(&self, source: &str, bodies: &[&str]) {
        {
            let mut partitions = self.state.partitions.lock();
            let events = partitions.entry(source.to_string()).or_default();
            for body in bodies {
                let sequence_number = events.len() as i64;
                events.push(
                    Message::new(Bytes::from(body.to_string()))
                        .with_annotation(SEQUENCE_NUMBER, sequence_number)
                        .with_annotation(OFFSET, sequence_number.to_string()),
                );
            }
        }
        for connection in self.state.connections.lock().iter() {
            pump(&self.state, connection);
        }
    }

    /// Create `source` without events so management reads see it.
    pub fn create_partition(&self, source: &str) {
        self.state
            .partitions
            .lock()
            .entry(source.to_string())
            .or_default();
    }

    /// Detach every event link with `error`.
    pub fn detach_receivers(&self, error: Option<ErrorCondition>) {
        for connection in self.state.connections.lock().iter() {
            let mut links = connection.links.lock();
            let detached: Vec<(u16, u32)> = links
                .outbound
                .iter()
                .filter(|(_, link)| matches!(link.delivery, Delivery::Events { .. }))
                .map(|(key, _)| *key)
                .collect();
            for (channel, handle) in detached {
                links.outbound.remove(&(channel, handle));
                let _ = connection.outbound.send(Performative::Detach {
                    channel,
                    handle,
                    closed: true,
                    error: error.clone(),
                });
            }
        }
    }

    /// Abort every connection's tasks, dropping the sockets.
    pub fn drop_connections(&self) {
        let connections = std::mem::take(&mut *self.state.connections.lock());
        for connection in connections {
            for task in connection.tasks.lock().drain(..) {
                task.abort();
            }
        }
    }

    pub fn deny_tokens(&self, deny: bool) {
        self.state.deny_tokens.store(deny, Ordering::SeqCst);
    }

    pub fn token_puts(&self) -> usize {
        self.state.token_puts.load(Ordering::SeqCst)
    }

    pub fn connections_accepted(&self) -> usize {
        self.state.connections_accepted.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn attaches(&self) -> Vec<AttachRecord> {
        self.state.attaches.lock().clone()
    }

    /// Attach records for event links on `source`.
    pub fn event_attaches(&self, source: &str) -> Vec<AttachRecord> {
        self.attaches()
            .into_iter()
            .filter(|record| record.source == source)
            .collect()
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

fn serve(state: Arc<BrokerState>, stream: TransportStream) {
    state.connections_accepted.fetch_add(1, Ordering::SeqCst);
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Performative>();
    let connection = Arc::new(BrokerConnection {
        outbound: tx,
        links: Mutex::new(ConnectionLinks::default()),
        tasks: Mutex::new(Vec::new()),
    });
    let write_task = tokio::spawn(async move {
        while let Some(performative) = rx.recv().await {
            let Ok(frame) = performative.encode() else {
                return;
            };
            if writer.write_all(&frame.encode()).await.is_err() {
                return;
            }
            let _ = writer.flush().await;
            if matches!(performative, Performative::Close { .. }) {
                let _ = writer.shutdown().await;
                return;
            }
        }
    });
    let read_state = Arc::clone(&state);
    let read_connection = Arc::clone(&connection);
    let read_task = tokio::spawn(async move {
        while let Ok(Some(performative)) = read_performative(&mut reader).await {
            if !handle(&read_state, &read_connection, performative) {
                break;
            }
        }
        read_state
            .connections
            .lock()
            .retain(|candidate| !Arc::ptr_eq(candidate, &read_connection));
    });
    connection.tasks.lock().extend([write_task, read_task]);
    state.connections.lock().push(connection);
}

async fn read_performative<R>(reader: &mut R) -> Result<Option<Performative>>
where
    R: tokio::io::AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FrameHeader::LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let header = FrameHeader::decode(Bytes::copy_from_slice(&header))?;
    let mut payload = BytesMut::zeroed(header.length as usize);
    reader.read_exact(&mut payload).await?;
    let frame = Frame {
        header,
        payload: payload.freeze(),
    };
    Ok(Some(Performative::decode(frame)?))
}

/// Returns false once the connection is closed.
fn handle(state: &Arc<BrokerState>, connection: &Arc<BrokerConnection>, performative: Performative) -> bool {
    let send = |performative: Performative| {
        let _ = connection.outbound.send(performative);
    };
    match performative {
        Performative::Open { .. } => send(Performative::Open {
            container_id: "mock-broker".into(),
            hostname: "localhost".into(),
            max_frame_size: 256 * 1024,
        }),
        Performative::Begin { channel, .. } => send(Performative::Begin {
            channel,
            remote_channel: Some(channel),
        }),
        Performative::Attach {
            channel,
            handle,
            name,
            role,
            source,
            target,
            filter,
            ..
        } => {
            send(Performative::Attach {
                channel,
                handle,
                name,
                role: match role {
                    Role::Sender => Role::Receiver,
                    Role::Receiver => Role::Sender,
                },
                source: source.clone(),
                target: target.clone(),
                filter: filter.clone(),
                properties: BTreeMap::new(),
            });
            match role {
                Role::Sender => {
                    connection
                        .links
                        .lock()
                        .inbound
                        .insert((channel, handle), InboundLink { target });
                    send(Performative::Flow {
                        channel,
                        handle,
                        link_credit: SENDER_CREDIT,
                    });
                }
                Role::Receiver => {
                    let source = source.unwrap_or_default();
                    let delivery = if source.starts_with('$') {
                        Delivery::Responses {
                            pending: VecDeque::new(),
                        }
                    } else {
                        state.attaches.lock().push(AttachRecord {
                            source: source.clone(),
                            filter: filter.clone(),
                        });
                        let available = state
                            .partitions
                            .lock()
                            .get(&source)
                            .map_or(0, Vec::len);
                        Delivery::Events {
                            next: start_index(filter.as_deref(), available),
                            source,
                        }
                    };
                    connection.links.lock().outbound.insert(
                        (channel, handle),
                        OutboundLink {
                            channel,
                            handle,
                            target,
                            credit: 0,
                            delivery,
                            next_delivery_id: 0,
                        },
                    );
                }
            }
        }
        Performative::Flow {
            channel,
            handle,
            link_credit,
        } => {
            if let Some(link) = connection.links.lock().outbound.get_mut(&(channel, handle)) {
                link.credit = link.credit.saturating_add(link_credit);
            }
            pump(state, connection);
        }
        Performative::Transfer {
            channel,
            handle,
            message,
            ..
        } => {
            let node = connection
                .links
                .lock()
                .inbound
                .get(&(channel, handle))
                .and_then(|link| link.target.clone());
            if let Some(node) = node {
                state.requests.fetch_add(1, Ordering::SeqCst);
                let delay = message.property_i64("delay-ms").unwrap_or(0);
                let response = respond(state, &node, &message);
                let state = Arc::clone(state);
                let connection = Arc::clone(connection);
                tokio::spawn(async move {
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                    }
                    enqueue_response(&connection, message.reply_to.as_deref(), response);
                    pump(&state, &connection);
                });
            }
        }
        Performative::Detach {
            channel, handle, ..
        } => {
            let mut links = connection.links.lock();
            let known = links.outbound.remove(&(channel, handle)).is_some()
                | links.inbound.remove(&(channel, handle)).is_some();
            drop(links);
            if known {
                send(Performative::Detach {
                    channel,
                    handle,
                    closed: true,
                    error: None,
                });
            }
        }
        Performative::End { channel, .. } => {
            let mut links = connection.links.lock();
            links.outbound.retain(|(link_channel, _), _| *link_channel != channel);
            links.inbound.retain(|(link_channel, _), _| *link_channel != channel);
            drop(links);
            send(Performative::End {
                channel,
                error: None,
            });
        }
        Performative::Close { .. } => {
            send(Performative::Close { error: None });
            return false;
        }
    }
    true
}

fn start_index(filter: Option<&str>, available: usize) -> usize {
    let Some(filter) = filter else {
        return 0;
    };
    let inclusive = filter.contains(">=");
    let value = filter.rsplit('\'').nth(1).unwrap_or_default();
    if value == "@latest" {
        return available;
    }
    match value.parse::<i64>() {
        Ok(value) if value < 0 => 0,
        Ok(value) if inclusive => value as usize,
        Ok(value) => value as usize + 1,
        Err(_) => 0,
    }
}

fn respond(state: &BrokerState, node: &str, request: &Message) -> Message {
    let operation = request.property_str("operation").unwrap_or_default();
    let (status, description, body) = match (node, operation) {
        ("$cbs", "put-token") => {
            state.token_puts.fetch_add(1, Ordering::SeqCst);
            if state.deny_tokens.load(Ordering::SeqCst) {
                (401, "token rejected", Bytes::new())
            } else {
                (202, "accepted", Bytes::new())
            }
        }
        ("$management", "READ") => read_entity(state, request),
        (_, "echo") => (200, "ok", request.body.clone()),
        (_, "fail") => (500, "requested failure", Bytes::new()),
        _ => (400, "unknown operation", Bytes::new()),
    };
    let mut response = Message::new(body)
        .with_property("status-code", status)
        .with_property("status-description", description);
    response.correlation_id = request.message_id.clone();
    response
}

fn read_entity(state: &BrokerState, request: &Message) -> (i64, &'static str, Bytes) {
    let name = request.property_str("name").unwrap_or_default();
    let partitions = state.partitions.lock();
    let prefix = format!("{name}/partitions/");
    let body = match (
        request.property_str("type").unwrap_or_default(),
        request.property_str("partition"),
    ) {
        ("com.conduit:eventhub", _) => {
            let mut ids: Vec<String> = partitions
                .keys()
                .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
                .collect();
            ids.sort();
            if ids.is_empty() {
                None
            } else {
                Some(serde_json::json!({ "name": name, "partition_ids": ids }))
            }
        }
        ("com.conduit:partition", Some(partition)) => partitions
            .get(&format!("{prefix}{partition}"))
            .map(|events| {
                serde_json::json!({
                    "entity": name,
                    "id": partition,
                    "beginning_sequence_number": 0,
                    "last_enqueued_sequence_number": events.len() as i64 - 1,
                    "is_empty": events.is_empty(),
                })
            }),
        _ => None,
    };
    match body {
        Some(body) => (200, "ok", Bytes::from(body.to_string())),
        None => (404, "entity not found", Bytes::new()),
    }
}

fn enqueue_response(connection: &BrokerConnection, reply_to: Option<&str>, response: Message) {
    let mut links = connection.links.lock();
    let link = links
        .outbound
        .values_mut()
        .find(|link| link.target.as_deref() == reply_to);
    if let Some(OutboundLink {
        delivery: Delivery::Responses { pending },
        ..
    }) = link
    {
        pending.push_back(response);
    }
}

/// Send whatever the granted credit allows on every outbound link.
fn pump(state: &BrokerState, connection: &BrokerConnection) {
    let partitions = state.partitions.lock();
    let mut links = connection.links.lock();
    for link in links.outbound.values_mut() {
        while link.credit > 0 {
            let message = match &mut link.delivery {
                Delivery::Events { source, next } => {
                    let Some(event) = partitions.get(source.as_str()).and_then(|events| events.get(*next))
                    else {
                        break;
                    };
                    *next += 1;
                    event.clone()
                }
                Delivery::Responses { pending } => match pending.pop_front() {
                    Some(response) => response,
                    None => break,
                },
            };
            link.credit -= 1;
            let delivery_id = link.next_delivery_id;
            link.next_delivery_id += 1;
            let _ = connection.outbound.send(Performative::Transfer {
                channel: link.channel,
                handle: link.handle,
                delivery_id,
                message,
            });
        }
    }
}

fn quic_configs() -> Result<(quinn::ServerConfig, quinn::ClientConfig)> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
        .context("generate self-signed cert")?;
    let cert_der = rustls::pki_types::CertificateDer::from(cert.serialize_der()?);
    let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.get_key_pair().serialize_der());
    let server_config = quinn::ServerConfig::with_single_cert(vec![cert_der.clone()], key_der.into())
        .context("build server config")?;
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).context("add root cert")?;
    let client_config = quinn::ClientConfig::with_root_certificates(Arc::new(roots))?;
    Ok((server_config, client_config))
}

/// Property map helper for management requests.
pub fn properties(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
