// Error taxonomy shared by every client component.
use conduit_wire::ErrorCondition;
use std::sync::Arc;
use std::time::Duration;

pub type ConduitResult<T> = std::result::Result<T, ConduitError>;

/// Errors surfaced by the client core.
///
/// Errors are `Clone` because one failure is fanned out to every waiter of a
/// resource and replayed to late subscribers.
///
/// ```
/// use conduit_client::ConduitError;
///
/// assert!(ConduitError::Transient("link reset".into()).is_transient());
/// assert!(!ConduitError::AlreadySubscribed.is_transient());
/// ```
#[derive(thiserror::Error, Debug, Clone)]
pub enum ConduitError {
    /// Recoverable local condition such as a dropped transport or full buffer.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Error condition reported by the remote peer.
    #[error("remote error: {0}")]
    Protocol(ErrorCondition),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("dispatcher is closed")]
    DispatcherClosed,
    #[error("a downstream subscriber is already attached")]
    AlreadySubscribed,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("request failed with status {status}: {description}")]
    Response { status: i64, description: String },
    #[error("response could not be decoded: {0}")]
    InvalidResponse(String),
    #[error("authorization failed: {0}")]
    Authorization(String),
    #[error("closed: {0}")]
    Closed(String),
    /// Upstream finished without error; no further resources will be produced.
    #[error("upstream completed")]
    Completed,
    #[error("receive buffer overflow: {0} messages buffered")]
    QueueOverflow(usize),
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("wire error: {0}")]
    Wire(Arc<conduit_wire::Error>),
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConduitError {
    /// Whether reconnecting may clear the failure. Only retry policies consult this.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_)
            | Self::Timeout(_)
            | Self::QueueOverflow(_)
            | Self::Io(_)
            | Self::Transport(_) => true,
            Self::Protocol(condition) => condition.is_transient(),
            Self::DispatcherClosed
            | Self::AlreadySubscribed
            | Self::InvalidArgument(_)
            | Self::Response { .. }
            | Self::InvalidResponse(_)
            | Self::Authorization(_)
            | Self::Closed(_)
            | Self::Completed
            | Self::Wire(_) => false,
        }
    }

    pub(crate) fn closed(what: impl Into<String>) -> Self {
        Self::Closed(what.into())
    }
}

impl From<std::io::Error> for ConduitError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<conduit_wire::Error> for ConduitError {
    fn from(err: conduit_wire::Error) -> Self {
        Self::Wire(Arc::new(err))
    }
}

impl From<anyhow::Error> for ConduitError {
    fn from(err: anyhow::Error) -> Self {
        Self::Transport(format!("{err:#}"))
    }
}

impl From<ErrorCondition> for ConduitError {
    fn from(condition: ErrorCondition) -> Self {
        Self::Protocol(condition)
    }
}
