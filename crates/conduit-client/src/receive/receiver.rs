// Async pull adapter over a receive pipeline.
use crate::engine::ReceiveLink;
use crate::error::{ConduitError, ConduitResult};
use crate::receive::pipeline::{InboundLink, ReceivePipeline};
use crate::receive::subscriber::{Subscriber, Subscription};
use conduit_wire::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

enum Event {
    Message(Message),
    Error(ConduitError),
    Complete,
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl Subscriber for ChannelSink {
    fn on_subscribe(&self, _subscription: Subscription) {}

    fn on_next(&self, message: Message) {
        let _ = self.tx.send(Event::Message(message));
    }

    fn on_error(&self, error: ConduitError) {
        let _ = self.tx.send(Event::Error(error));
    }

    fn on_complete(&self) {
        let _ = self.tx.send(Event::Complete);
    }
}

/// Receives messages from one entity, requesting demand in batches.
///
/// Reconnects happen underneath; callers only see a pause in delivery or a
/// final error once retries are exhausted. Dropping the receiver disposes
/// the pipeline and its link.
pub struct EventReceiver<L: InboundLink = ReceiveLink> {
    pipeline: ReceivePipeline<L>,
    events: mpsc::UnboundedReceiver<Event>,
    batch: u32,
    outstanding: u64,
    pending_error: Option<ConduitError>,
    done: bool,
}

impl<L: InboundLink> EventReceiver<L> {
    pub fn new(pipeline: ReceivePipeline<L>, batch: u32) -> ConduitResult<Self> {
        if batch == 0 {
            return Err(ConduitError::InvalidArgument(
                "receive batch must be positive".into(),
            ));
        }
        let (tx, events) = mpsc::unbounded_channel();
        pipeline.subscribe(Arc::new(ChannelSink { tx }))?;
        Ok(Self {
            pipeline,
            events,
            batch,
            outstanding: 0,
            pending_error: None,
            done: false,
        })
    }

    pub fn name(&self) -> &str {
        self.pipeline.name()
    }

    /// Next message, `Some(Err)` once on a terminal error, `None` after
    /// completion or close.
    pub async fn next_message(&mut self) -> Option<ConduitResult<Message>> {
        if self.done {
            return None;
        }
        if let Some(err) = self.pending_error.take() {
            self.done = true;
            return Some(Err(err));
        }
        if self.outstanding == 0 {
            self.outstanding = u64::from(self.batch);
            self.pipeline.request(u64::from(self.batch));
        }
        match self.events.recv().await {
            Some(Event::Message(message)) => {
                self.outstanding = self.outstanding.saturating_sub(1);
                Some(Ok(message))
            }
            Some(Event::Error(err)) => {
                self.done = true;
                Some(Err(err))
            }
            Some(Event::Complete) | None => {
                self.done = true;
                None
            }
        }
    }

    /// Up to `max` messages, waiting at most `wait` for the first one.
    /// Messages already delivered are returned without further waiting.
    pub async fn receive(&mut self, max: usize, wait: Duration) -> ConduitResult<Vec<Message>> {
        if max == 0 {
            return Err(ConduitError::InvalidArgument(
                "max messages must be positive".into(),
            ));
        }
        let mut batch = Vec::new();
        let first = match tokio::time::timeout(wait, self.next_message()).await {
            Ok(Some(result)) => result?,
            Ok(None) | Err(_) => return Ok(batch),
        };
        batch.push(first);
        while batch.len() < max {
            match self.events.try_recv() {
                Ok(Event::Message(message)) => {
                    self.outstanding = self.outstanding.saturating_sub(1);
                    batch.push(message);
                }
                Ok(Event::Error(err)) => {
                    // Hand over what arrived; the error surfaces on the next call.
                    self.pending_error = Some(err);
                    break;
                }
                Ok(Event::Complete) => {
                    self.done = true;
                    break;
                }
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Stop receiving. Buffered messages are discarded. Idempotent.
    pub fn close(&mut self) {
        self.done = true;
        self.pipeline.dispose();
    }
}

impl<L: InboundLink> Drop for EventReceiver<L> {
    fn drop(&mut self) {
        self.pipeline.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointState;
    use crate::receive::pipeline::tests::{LinkSource, MockLink, eventually, pipeline};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn next_message_requests_in_batches() -> anyhow::Result<()> {
        let link = MockLink::new("l1");
        let (pipeline, timer) = pipeline(LinkSource::new(vec![Some(Ok(Arc::clone(&link)))]), 0, 100);
        let mut receiver = EventReceiver::new(pipeline.clone(), 2)?;
        assert_eq!(pipeline.requested(), 0);

        let first = tokio::spawn(async move {
            let message = receiver.next_message().await;
            (receiver, message)
        });
        eventually(|| pipeline.requested() == 2).await;
        eventually(|| link.grants() == vec![2]).await;
        link.deliver(7);
        let (mut receiver, message) = first.await?;
        let message = message.expect("message")?;
        assert_eq!(message.annotation_i64("x-opt-sequence-number"), Some(7));
        assert_eq!(pipeline.requested(), 1);

        link.deliver(8);
        receiver.next_message().await.expect("second")?;
        assert_eq!(pipeline.requested(), 0);
        timer.close();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminal_error_is_reported_once() -> anyhow::Result<()> {
        let link = MockLink::new("l1");
        let (pipeline, timer) = pipeline(LinkSource::new(vec![Some(Ok(Arc::clone(&link)))]), 5, 100);
        let mut receiver = EventReceiver::new(pipeline.clone(), 5)?;
        eventually(|| pipeline.current_link().is_some()).await;

        link.set(EndpointState::Failed(ConduitError::Authorization("expired".into())));
        let result = tokio::time::timeout(Duration::from_secs(2), receiver.next_message())
            .await?
            .expect("terminal event");
        assert!(matches!(result, Err(ConduitError::Authorization(_))));
        assert!(receiver.next_message().await.is_none());
        assert!(receiver.is_done());
        timer.close();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn receive_collects_available_messages() -> anyhow::Result<()> {
        let link = MockLink::new("l1");
        let (pipeline, timer) = pipeline(LinkSource::new(vec![Some(Ok(Arc::clone(&link)))]), 10, 100);
        let mut receiver = EventReceiver::new(pipeline.clone(), 10)?;
        eventually(|| pipeline.current_link().is_some()).await;

        let empty = receiver.receive(5, Duration::from_millis(30)).await?;
        assert!(empty.is_empty());

        for seq in 0..3 {
            link.deliver(seq);
        }
        eventually(|| pipeline.buffered() == 0).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let batch = receiver.receive(5, Duration::from_secs(1)).await?;
        assert_eq!(batch.len(), 3);
        timer.close();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drop_disposes_the_link() -> anyhow::Result<()> {
        let link = MockLink::new("l1");
        let (pipeline, timer) = pipeline(LinkSource::new(vec![Some(Ok(Arc::clone(&link)))]), 1, 10);
        let receiver = EventReceiver::new(pipeline.clone(), 1)?;
        eventually(|| pipeline.current_link().is_some()).await;
        drop(receiver);
        assert_eq!(link.closes(), 1);
        assert!(pipeline.is_terminated());
        timer.close();
        Ok(())
    }
}
