// Low-level frame IO for conduit-wire over any byte stream.
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use conduit_wire::{Frame, FrameHeader, Performative};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::runtime_config;
#[cfg(feature = "telemetry")]
use crate::counters::frame_counters;
use crate::wire::decode_log::log_decode_error;

/// Read and decode one performative. `Ok(None)` on a clean end of stream.
pub(crate) async fn read_performative<R>(
    reader: &mut R,
    frame_scratch: &mut BytesMut,
) -> Result<Option<Performative>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let frame = match read_frame_into(reader, frame_scratch).await? {
        Some(frame) => frame,
        None => return Ok(None),
    };
    match Performative::decode(frame.clone()).context("decode performative") {
        Ok(performative) => Ok(Some(performative)),
        Err(err) => {
            #[cfg(feature = "telemetry")]
            {
                let counters = frame_counters();
                counters
                    .frames_in_err
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            log_decode_error("read_performative", &err, &frame);
            Err(err)
        }
    }
}

pub(crate) async fn read_frame_into<R>(
    reader: &mut R,
    scratch: &mut BytesMut,
) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header_bytes = [0u8; FrameHeader::LEN];
    match reader.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("read frame header"),
    }

    let header = FrameHeader::decode(Bytes::copy_from_slice(&header_bytes))
        .context("decode frame header")?;
    let length = usize::try_from(header.length).context("frame length")?;

    // The cap is checked before the payload buffer is sized.
    let max_frame_bytes = runtime_config().max_frame_bytes;
    if length > max_frame_bytes {
        return Err(anyhow::anyhow!(
            "frame too large: {length} bytes (cap {max_frame_bytes}); refusing"
        ));
    }

    scratch.clear();
    scratch.resize(length, 0u8);
    reader
        .read_exact(&mut scratch[..])
        .await
        .context("read frame payload")?;

    let frame = Frame {
        header,
        payload: scratch.split().freeze(),
    };
    #[cfg(feature = "telemetry")]
    {
        let counters = frame_counters();
        counters
            .frames_in_ok
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let bytes = (FrameHeader::LEN + frame.payload.len()) as u64;
        counters
            .bytes_in
            .fetch_add(bytes, std::sync::atomic::Ordering::Relaxed);
    }
    Ok(Some(frame))
}

pub(crate) async fn write_frame_parts<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut header_bytes = [0u8; FrameHeader::LEN];
    frame.header.encode_into(&mut header_bytes);
    writer
        .write_all(&header_bytes)
        .await
        .context("write frame header")?;
    writer
        .write_all(&frame.payload)
        .await
        .context("write frame payload")?;
    #[cfg(feature = "telemetry")]
    {
        let counters = frame_counters();
        counters
            .frames_out_ok
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let bytes = (FrameHeader::LEN + frame.payload.len()) as u64;
        counters
            .bytes_out
            .fetch_add(bytes, std::sync::atomic::Ordering::Relaxed);
    }
    Ok(())
}

pub(crate) async fn write_performative<W>(writer: &mut W, performative: &Performative) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = performative.encode().context("encode performative")?;
    write_frame_parts(writer, &frame).await?;
    writer.flush().await.context("flush frame")
}
