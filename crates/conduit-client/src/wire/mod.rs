// Frame IO and decode diagnostics for conduit-wire performatives.
pub(crate) use self::frame_io::{read_performative, write_performative};

mod decode_log;
mod frame_io;
