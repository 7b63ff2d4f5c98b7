// Rate-limited decode error logging for inbound frames.
use conduit_wire::Frame;

#[cfg(feature = "telemetry")]
use crate::counters::DECODE_ERROR_LOGS;

#[cfg(feature = "telemetry")]
const DECODE_ERROR_LOG_LIMIT: usize = 20;

#[cfg(feature = "telemetry")]
pub(crate) fn log_decode_error(context: &str, err: &anyhow::Error, frame: &Frame) {
    let count = DECODE_ERROR_LOGS.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    if count >= DECODE_ERROR_LOG_LIMIT {
        return;
    }
    let (hex, printable) = preview(frame);
    tracing::warn!(
        context,
        error = %err,
        frame_len = frame.header.length,
        payload_len = frame.payload.len(),
        preview_hex = %hex,
        preview_printable = %printable,
        "conduit-client decode error"
    );
}

#[cfg(not(feature = "telemetry"))]
pub(crate) fn log_decode_error(context: &str, err: &anyhow::Error, frame: &Frame) {
    tracing::debug!(
        context,
        error = %err,
        payload_len = frame.payload.len(),
        "conduit-client decode error"
    );
}

#[cfg_attr(not(feature = "telemetry"), allow(dead_code))]
fn preview(frame: &Frame) -> (String, String) {
    let preview_len = frame.payload.len().min(64);
    let preview = &frame.payload[..preview_len];
    let hex = preview
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    let printable = preview
        .iter()
        .map(|b| {
            let c = *b as char;
            if c.is_ascii_graphic() || c == ' ' {
                c
            } else {
                '.'
            }
        })
        .collect::<String>();
    (hex, printable)
}
