// Broker client transport core.
//
// A dedicated dispatcher thread per connection owns the protocol engine;
// everything else talks to it by submitting jobs. On top of that sit
// recoverable resources (connection, request/response channels, receive
// links) replaced under a retry policy, and a credit-based receive pipeline
// that keeps delivery flowing across link replacements.
//
// Layering, bottom up:
// - `dispatcher`: single-writer work queue with delayed jobs
// - `engine`: connection/session/link state driven by inbound performatives
// - `processor`: one live resource shared by waiters, replaced on failure
// - `receive`: demand-driven delivery with link credit
// - `channel`, `auth`, `management`: request/response control plane
// - `client`: composes the above per broker
#[macro_use]
mod macros;

pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod counters;
pub mod dispatcher;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod management;
pub mod position;
pub mod processor;
pub mod receive;
pub mod retry;
mod wire;

pub use auth::{AccessToken, AuthorizationState, StaticTokenCredential, TokenCredential};
pub use channel::RequestResponseChannel;
pub use client::{ConduitClient, Connector, QuicConnector, TcpConnector, connector_for};
pub use config::{ClientOptions, RetryMode, RetryOptions, TransportType};
pub use counters::{FrameCountersSnapshot, frame_counters_snapshot, reset_frame_counters};
pub use dispatcher::{Dispatcher, Scheduler};
pub use endpoint::EndpointState;
pub use error::{ConduitError, ConduitResult};
pub use management::{EntityProperties, ManagementNode, PartitionProperties};
pub use position::EventPosition;
pub use processor::{
    ProcessorOptions, Recoverable, ResourceObserver, ResourceProcessor, ResourceSource,
};
pub use receive::{EventReceiver, ReceivePipeline, Subscriber, Subscription};
pub use retry::{ExponentialRetryPolicy, FixedRetryPolicy, RetryPolicy, retry_policy};
