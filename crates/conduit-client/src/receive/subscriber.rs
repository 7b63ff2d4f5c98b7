// Downstream subscriber contract with explicit demand.
use crate::error::ConduitError;
use conduit_wire::Message;
use std::sync::{Arc, Weak};

/// Receives messages pushed by a receive pipeline.
///
/// Calls are never concurrent for one subscriber. `on_error` and
/// `on_complete` are terminal and delivered at most once.
pub trait Subscriber: Send + Sync + 'static {
    fn on_subscribe(&self, subscription: Subscription);
    fn on_next(&self, message: Message);
    fn on_error(&self, error: ConduitError);
    fn on_complete(&self);
}

pub(crate) trait Demand: Send + Sync + 'static {
    fn request(&self, n: u64);
    fn cancel(&self);
}

struct Detached;

impl Demand for Detached {
    fn request(&self, _n: u64) {}
    fn cancel(&self) {}
}

/// Demand handle given to a subscriber in `on_subscribe`.
#[derive(Clone)]
pub struct Subscription {
    control: Weak<dyn Demand>,
}

impl Subscription {
    pub(crate) fn new(control: Weak<dyn Demand>) -> Self {
        Self { control }
    }

    /// Handle for a subscriber that only receives a replayed terminal signal.
    pub(crate) fn detached() -> Self {
        let control: Weak<dyn Demand> = Weak::<Detached>::new();
        Self { control }
    }

    /// Add `n` to outstanding demand. `u64::MAX` (or anything at or above
    /// `i64::MAX`) means unbounded.
    pub fn request(&self, n: u64) {
        if let Some(control) = self.control.upgrade() {
            control.request(n);
        }
    }

    /// Stop delivery and discard buffered messages. Idempotent.
    pub fn cancel(&self) {
        if let Some(control) = self.control.upgrade() {
            control.cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &(self.control.strong_count() > 0))
            .finish()
    }
}

pub(crate) fn attach(control: &Arc<impl Demand>) -> Subscription {
    let weak = Arc::downgrade(control);
    let weak: Weak<dyn Demand> = weak;
    Subscription::new(weak)
}
