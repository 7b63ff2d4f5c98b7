// Wire format for framing protocol performatives on a byte stream.
use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MAGIC: u32 = 0x434E4431;
pub const VERSION: u16 = 1;
// Flags describe how to interpret the frame payload.
pub const FLAG_PERFORMATIVE: u16 = 0x0000;

pub type Result<T> = std::result::Result<T, Error>;

/// Application property and annotation values are carried as JSON values.
pub type Value = serde_json::Value;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("failed to serialize performative")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize performative")]
    Deserialize(serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    // Create a header with the current protocol constants.
    pub fn new(flags: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        // Always encode in network byte order for portability.
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
    }

    pub fn encode_into(&self, out: &mut [u8; Self::LEN]) {
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..6].copy_from_slice(&self.version.to_be_bytes());
        out[6..8].copy_from_slice(&self.flags.to_be_bytes());
        out[8..12].copy_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate header before we trust the length.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            length,
        })
    }
}

/// Frame containing a header and payload.
///
/// ```
/// use bytes::Bytes;
/// use conduit_wire::Frame;
///
/// let frame = Frame::new(0x1, Bytes::from_static(b"hello")).expect("frame");
/// let encoded = frame.encode();
/// let decoded = Frame::decode(encoded).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u16, payload: Bytes) -> Result<Self> {
        // Keep length within the on-wire u32 size.
        if payload.len() > u32::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        Ok(Self {
            header: FrameHeader::new(flags, payload.len() as u32),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        // Pre-allocate the exact size to avoid reallocation.
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        // Split header and payload based on the declared length.
        if input.len() < FrameHeader::LEN {
            return Err(Error::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}

/// Well-known error condition names carried in `Detach`, `End` and `Close`.
pub mod conditions {
    pub const INTERNAL_ERROR: &str = "amqp:internal-error";
    pub const NOT_FOUND: &str = "amqp:not-found";
    pub const UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
    pub const NOT_ALLOWED: &str = "amqp:not-allowed";
    pub const PRECONDITION_FAILED: &str = "amqp:precondition-failed";
    pub const CONNECTION_FORCED: &str = "amqp:connection:forced";
    pub const FRAMING_ERROR: &str = "amqp:connection:framing-error";
    pub const LINK_DETACH_FORCED: &str = "amqp:link:detach-forced";
    pub const LINK_STOLEN: &str = "amqp:link:stolen";
    pub const SERVER_BUSY: &str = "conduit:server-busy";
    pub const TIMEOUT: &str = "conduit:timeout";
}

/// Remote error condition attached to a closing endpoint.
///
/// ```
/// use conduit_wire::{conditions, ErrorCondition};
///
/// let busy = ErrorCondition::new(conditions::SERVER_BUSY, "try later");
/// assert!(busy.is_transient());
/// let denied = ErrorCondition::new(conditions::UNAUTHORIZED_ACCESS, "no token");
/// assert!(!denied.is_transient());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCondition {
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ErrorCondition {
    pub fn new(condition: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            description: Some(description.into()),
        }
    }

    /// Conditions a client may recover from by reconnecting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.condition.as_str(),
            conditions::INTERNAL_ERROR
                | conditions::CONNECTION_FORCED
                | conditions::LINK_DETACH_FORCED
                | conditions::SERVER_BUSY
                | conditions::TIMEOUT
        )
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.condition, description),
            None => f.write_str(&self.condition),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sender,
    Receiver,
}

/// Application message carried by a `Transfer`.
///
/// Identity and reply-address fields are plain options; the request/response
/// layer owns assigning them.
///
/// ```
/// use conduit_wire::Message;
///
/// let message = Message::new(&b"payload"[..]).with_property("operation", "READ");
/// assert_eq!(message.property_str("operation"), Some("READ"));
/// assert!(message.encoded_len_hint() >= 7);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub application_properties: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, Value>,
    #[serde(default, with = "base64_bytes")]
    pub body: Bytes,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.application_properties.get(key)
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.property(key).and_then(Value::as_str)
    }

    pub fn property_i64(&self, key: &str) -> Option<i64> {
        self.property(key).and_then(Value::as_i64)
    }

    pub fn annotation_i64(&self, key: &str) -> Option<i64> {
        self.annotations.get(key).and_then(Value::as_i64)
    }

    /// Rough encoded size used for buffer sizing; never smaller than the body.
    pub fn encoded_len_hint(&self) -> usize {
        let ids = [
            &self.message_id,
            &self.correlation_id,
            &self.reply_to,
            &self.to,
            &self.subject,
        ]
        .iter()
        .filter_map(|field| field.as_ref().map(String::len))
        .sum::<usize>();
        let maps = self
            .application_properties
            .iter()
            .chain(self.annotations.iter())
            .map(|(key, value)| key.len() + value_len_hint(value))
            .sum::<usize>();
        // Body is base64 on the wire: 4 output bytes per 3 input bytes.
        self.body.len().div_ceil(3) * 4 + ids + maps
    }
}

fn value_len_hint(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 5,
        Value::Number(_) => 20,
        Value::String(s) => s.len() + 2,
        Value::Array(items) => items.iter().map(value_len_hint).sum::<usize>() + 2,
        Value::Object(map) => {
            map.iter()
                .map(|(key, value)| key.len() + value_len_hint(value))
                .sum::<usize>()
                + 2
        }
    }
}

/// Protocol performatives encoded one per frame.
///
/// ```
/// use conduit_wire::Performative;
///
/// let flow = Performative::Flow { channel: 0, handle: 1, link_credit: 10 };
/// let frame = flow.encode().expect("encode");
/// let decoded = Performative::decode(frame).expect("decode");
/// assert_eq!(flow, decoded);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Performative {
    // Connection open; the peer answers with its own Open.
    Open {
        container_id: String,
        hostname: String,
        max_frame_size: u32,
    },
    // Session begin; the peer echoes our channel in remote_channel.
    Begin {
        channel: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_channel: Option<u16>,
    },
    // Link attach; the peer answers with the same name and handle.
    Attach {
        channel: u16,
        handle: u32,
        name: String,
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        properties: BTreeMap<String, Value>,
    },
    // Credit grant from a receiver to a sender.
    Flow {
        channel: u16,
        handle: u32,
        link_credit: u32,
    },
    // One message on a link.
    Transfer {
        channel: u16,
        handle: u32,
        delivery_id: u64,
        message: Message,
    },
    // Link detach; an error marks the link failed.
    Detach {
        channel: u16,
        handle: u32,
        closed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorCondition>,
    },
    // Session end.
    End {
        channel: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorCondition>,
    },
    // Connection close.
    Close {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorCondition>,
    },
}

impl Performative {
    pub fn encode(&self) -> Result<Frame> {
        // JSON-encode into a framed payload.
        let payload = serde_json::to_vec(self).map_err(Error::Serialize)?;
        Frame::new(FLAG_PERFORMATIVE, Bytes::from(payload))
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        serde_json::from_slice(&frame.payload).map_err(Error::Deserialize)
    }

    /// Session channel the performative addresses, if any.
    pub fn channel(&self) -> Option<u16> {
        match self {
            Self::Open { .. } | Self::Close { .. } => None,
            Self::Begin { channel, .. }
            | Self::Attach { channel, .. }
            | Self::Flow { channel, .. }
            | Self::Transfer { channel, .. }
            | Self::Detach { channel, .. }
            | Self::End { channel, .. } => Some(*channel),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Begin { .. } => "begin",
            Self::Attach { .. } => "attach",
            Self::Flow { .. } => "flow",
            Self::Transfer { .. } => "transfer",
            Self::Detach { .. } => "detach",
            Self::End { .. } => "end",
            Self::Close { .. } => "close",
        }
    }
}

mod base64_bytes {
    use super::*;
    use serde::de::Error;

    // Encode Bytes as base64 string for JSON payloads.
    pub fn serialize<S>(value: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    // Decode base64 string into Bytes.
    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Bytes, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}
