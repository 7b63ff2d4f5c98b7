// Reader and single-writer loops bridging the byte stream and the engine.
//
// Both loops run as tasks on the dispatcher's runtime. The reader turns each
// inbound performative into a dispatcher job; the writer is the only owner of
// the write half and drains the outbound queue in order.
use crate::dispatcher::Dispatcher;
use crate::engine::state::ConnectionEngine;
use crate::wire::{read_performative, write_performative};
use bytes::BytesMut;
use conduit_transport::{BoxReader, BoxWriter};
use conduit_wire::Performative;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

const READ_SCRATCH_BYTES: usize = 64 * 1024;

pub(crate) async fn read_loop(mut reader: BoxReader, dispatcher: Dispatcher<ConnectionEngine>) {
    let mut scratch = BytesMut::with_capacity(READ_SCRATCH_BYTES);
    loop {
        match read_performative(&mut reader, &mut scratch).await {
            Ok(Some(performative)) => {
                if dispatcher
                    .submit(move |engine| engine.on_performative(performative))
                    .is_err()
                {
                    return;
                }
            }
            Ok(None) => {
                let _ = dispatcher.submit(|engine| engine.on_transport_closed(None));
                return;
            }
            Err(err) => {
                let reason = format!("{err:#}");
                let _ = dispatcher.submit(move |engine| engine.on_transport_closed(Some(reason)));
                return;
            }
        }
    }
}

pub(crate) async fn write_loop(
    mut writer: BoxWriter,
    mut outbound: mpsc::UnboundedReceiver<Performative>,
    dispatcher: Dispatcher<ConnectionEngine>,
) {
    while let Some(performative) = outbound.recv().await {
        if let Err(err) = write_performative(&mut writer, &performative).await {
            let reason = format!("{err:#}");
            let _ = dispatcher.submit(move |engine| engine.on_transport_closed(Some(reason)));
            break;
        }
        if matches!(performative, Performative::Close { .. }) {
            break;
        }
    }
    let _ = writer.shutdown().await;
    // Close written, queue dropped or stream broken: the connection is done.
    dispatcher.close();
}
