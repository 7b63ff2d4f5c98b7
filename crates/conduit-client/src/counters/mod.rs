// Frame counters and telemetry snapshots for the client.
#[cfg(feature = "telemetry")]
use std::sync::atomic::AtomicUsize;
#[cfg(feature = "telemetry")]
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "telemetry")]
#[derive(Default)]
pub(crate) struct FrameCounters {
    pub(crate) frames_in_ok: AtomicU64,
    pub(crate) frames_in_err: AtomicU64,
    pub(crate) frames_out_ok: AtomicU64,
    pub(crate) bytes_in: AtomicU64,
    pub(crate) bytes_out: AtomicU64,
    pub(crate) transfers_in: AtomicU64,
    pub(crate) credits_granted: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct FrameCountersSnapshot {
    pub frames_in_ok: u64,
    pub frames_in_err: u64,
    pub frames_out_ok: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub transfers_in: u64,
    pub credits_granted: u64,
}

#[cfg(feature = "telemetry")]
static FRAME_COUNTERS: std::sync::OnceLock<FrameCounters> = std::sync::OnceLock::new();
#[cfg(feature = "telemetry")]
pub(crate) static DECODE_ERROR_LOGS: AtomicUsize = AtomicUsize::new(0);

#[cfg(feature = "telemetry")]
pub(crate) fn frame_counters() -> &'static FrameCounters {
    FRAME_COUNTERS.get_or_init(FrameCounters::default)
}

pub fn frame_counters_snapshot() -> FrameCountersSnapshot {
    #[cfg(feature = "telemetry")]
    {
        let counters = frame_counters();
        FrameCountersSnapshot {
            frames_in_ok: counters.frames_in_ok.load(Ordering::Relaxed),
            frames_in_err: counters.frames_in_err.load(Ordering::Relaxed),
            frames_out_ok: counters.frames_out_ok.load(Ordering::Relaxed),
            bytes_in: counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: counters.bytes_out.load(Ordering::Relaxed),
            transfers_in: counters.transfers_in.load(Ordering::Relaxed),
            credits_granted: counters.credits_granted.load(Ordering::Relaxed),
        }
    }
    #[cfg(not(feature = "telemetry"))]
    {
        FrameCountersSnapshot::default()
    }
}

pub fn reset_frame_counters() {
    #[cfg(feature = "telemetry")]
    {
        let counters = frame_counters();
        counters.frames_in_ok.store(0, Ordering::Relaxed);
        counters.frames_in_err.store(0, Ordering::Relaxed);
        counters.frames_out_ok.store(0, Ordering::Relaxed);
        counters.bytes_in.store(0, Ordering::Relaxed);
        counters.bytes_out.store(0, Ordering::Relaxed);
        counters.transfers_in.store(0, Ordering::Relaxed);
        counters.credits_granted.store(0, Ordering::Relaxed);
    }
}
