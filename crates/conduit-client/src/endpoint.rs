// Endpoint lifecycle states published by connections, sessions and links.
use crate::error::{ConduitError, ConduitResult};
use std::time::Duration;
use tokio::sync::watch;

/// `Uninitialized -> Opening -> Active -> Closing -> Closed | Failed`.
#[derive(Debug, Clone, Default)]
pub enum EndpointState {
    #[default]
    Uninitialized,
    Opening,
    Active,
    Closing,
    Closed,
    Failed(ConduitError),
}

impl EndpointState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Opening => "opening",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed(_) => "failed",
        }
    }
}

/// Wait until the endpoint is active, failing on a terminal state or timeout.
///
/// ```
/// use conduit_client::{EndpointState, endpoint::wait_active};
/// use std::time::Duration;
/// use tokio::sync::watch;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let (tx, rx) = watch::channel(EndpointState::Opening);
/// tx.send_replace(EndpointState::Active);
/// wait_active(rx, Duration::from_millis(10)).await.expect("active");
/// # }
/// ```
pub async fn wait_active(
    mut states: watch::Receiver<EndpointState>,
    timeout: Duration,
) -> ConduitResult<()> {
    let wait = async {
        loop {
            let state = states.borrow_and_update().clone();
            match state {
                EndpointState::Active => return Ok(()),
                EndpointState::Failed(err) => return Err(err),
                EndpointState::Closed => return Err(ConduitError::closed("endpoint closed")),
                _ => {}
            }
            if states.changed().await.is_err() {
                return Err(ConduitError::closed("endpoint state dropped"));
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| ConduitError::Timeout(timeout))?
}

/// Move `state` to a terminal value unless it already holds one.
pub(crate) fn settle(state: &watch::Sender<EndpointState>, next: EndpointState) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() {
            false
        } else {
            *current = next;
            true
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_active_reports_failure() {
        let (tx, rx) = watch::channel(EndpointState::Opening);
        let waiter = tokio::spawn(wait_active(rx, Duration::from_secs(1)));
        tx.send_replace(EndpointState::Failed(ConduitError::Transient("reset".into())));
        let result = waiter.await.expect("join");
        assert!(matches!(result, Err(ConduitError::Transient(_))));
    }

    #[tokio::test]
    async fn wait_active_times_out() {
        let (_tx, rx) = watch::channel(EndpointState::Opening);
        let result = wait_active(rx, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ConduitError::Timeout(_))));
    }

    #[test]
    fn settle_keeps_first_terminal_state() {
        let (tx, rx) = watch::channel(EndpointState::Active);
        assert!(settle(&tx, EndpointState::Closed));
        assert!(!settle(
            &tx,
            EndpointState::Failed(ConduitError::Transient("late".into()))
        ));
        assert!(matches!(*rx.borrow(), EndpointState::Closed));
    }
}
