// Client orchestration: connectors, resource sources and the client facade.
#![allow(clippy::module_inception)]
pub mod client;
pub mod connector;
mod sources;

pub use self::client::ConduitClient;
pub use self::connector::{Connector, QuicConnector, TcpConnector, connector_for};
