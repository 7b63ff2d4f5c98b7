// Connection, session and link endpoints driven by a per-connection dispatcher.
mod handles;
mod io;
mod state;

pub use self::handles::{
    Connection, ConnectionOptions, ReceiveLink, ReceiveLinkOptions, SendLink, Session,
};
pub use self::state::ConnectionEngine;
