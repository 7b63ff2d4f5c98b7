// Flow-controlled receive pipeline over a sequence of recoverable links.
//
// Messages from the current link are appended to a bounded queue. A drain
// loop emits them to the single downstream subscriber while demand remains.
// The drain is guarded by a work-in-progress counter: the thread that moves
// it from zero runs the loop, every other trigger only bumps the counter so
// the running loop re-checks queue and demand before it exits.
use crate::error::{ConduitError, ConduitResult};
use crate::processor::{Recoverable, ResourceObserver, ResourceProcessor};
use crate::receive::subscriber::{Demand, Subscriber, Subscription, attach};
use conduit_wire::Message;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Demand value meaning "no limit".
pub const UNBOUNDED: i64 = i64::MAX;

/// Computes further credit for a link whose remote credit reached zero.
pub type CreditSupplier = Arc<dyn Fn() -> u32 + Send + Sync>;

/// Called for every message accepted into the buffer.
pub type BufferedHook = Arc<dyn Fn(&Message) + Send + Sync>;

/// Receive side of a link as seen by the pipeline.
pub trait InboundLink: Recoverable {
    /// Message stream of this link; yields `Some` once.
    fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<Message>>;
    fn add_credits(&self, credits: u32) -> ConduitResult<()>;
    /// Invoked by the link whenever its remote credit drops to zero.
    fn set_credit_supplier(&self, supplier: CreditSupplier) -> ConduitResult<()>;
    /// Ask the supplier for credit now if the link has none left.
    fn replenish_if_empty(&self) -> ConduitResult<()>;
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Credit granted to the first link before any demand is expressed.
    pub prefetch: u32,
    pub max_queue_size: usize,
}

struct LinkSlot<L> {
    /// Cleared when the link is retired; its stragglers are then ignored.
    link: Option<Arc<L>>,
    generation: usize,
    credited: bool,
    first: bool,
    forwarder: Option<JoinHandle<()>>,
}

struct PipelineInner<L: InboundLink> {
    name: String,
    options: PipelineOptions,
    processor: ResourceProcessor<L>,
    runtime: Handle,
    on_buffered: Option<BufferedHook>,
    queue: Mutex<VecDeque<Message>>,
    requested: AtomicI64,
    wip: AtomicUsize,
    downstream: Mutex<Option<Arc<dyn Subscriber>>>,
    subscribed: AtomicBool,
    cancelled: AtomicBool,
    terminal: Mutex<Option<ConduitError>>,
    links_seen: AtomicUsize,
    slot: Mutex<LinkSlot<L>>,
}

/// Single-subscriber receive stream with credit-based flow control.
pub struct ReceivePipeline<L: InboundLink> {
    inner: Arc<PipelineInner<L>>,
}

impl<L: InboundLink> Clone for ReceivePipeline<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct LinkObserver<L: InboundLink> {
    pipeline: Weak<PipelineInner<L>>,
}

impl<L: InboundLink> ResourceObserver<L> for LinkObserver<L> {
    fn on_resource(&self, link: &Arc<L>) {
        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline.install(link);
        }
    }

    fn on_terminated(&self, outcome: &ConduitError) {
        if let Some(pipeline) = self.pipeline.upgrade() {
            *pipeline.terminal.lock() = Some(outcome.clone());
            pipeline.drain();
        }
    }
}

impl<L: InboundLink> ReceivePipeline<L> {
    /// `processor` should reconnect on graceful close so delivery resumes
    /// while a subscriber is attached.
    pub fn new(
        name: impl Into<String>,
        options: PipelineOptions,
        processor: ResourceProcessor<L>,
        runtime: Handle,
        on_buffered: Option<BufferedHook>,
    ) -> Self {
        let inner = Arc::new(PipelineInner {
            name: name.into(),
            options,
            processor,
            runtime,
            on_buffered,
            queue: Mutex::new(VecDeque::new()),
            requested: AtomicI64::new(0),
            wip: AtomicUsize::new(0),
            downstream: Mutex::new(None),
            subscribed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            terminal: Mutex::new(None),
            links_seen: AtomicUsize::new(0),
            slot: Mutex::new(LinkSlot {
                link: None,
                generation: usize::MAX,
                credited: false,
                first: false,
                forwarder: None,
            }),
        });
        inner.processor.set_observer(Arc::new(LinkObserver {
            pipeline: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Attach the single downstream subscriber and start requesting links.
    ///
    /// A terminated pipeline replays its outcome to the subscriber at once.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> ConduitResult<()> {
        let terminal = self.inner.terminal.lock().clone();
        if let Some(outcome) = terminal {
            subscriber.on_subscribe(Subscription::detached());
            deliver_terminal(subscriber.as_ref(), outcome);
            return Ok(());
        }
        if self.inner.cancelled.load(Ordering::Acquire) {
            return Err(ConduitError::closed("receive pipeline cancelled"));
        }
        if self.inner.subscribed.swap(true, Ordering::AcqRel) {
            return Err(ConduitError::AlreadySubscribed);
        }
        *self.inner.downstream.lock() = Some(Arc::clone(&subscriber));
        subscriber.on_subscribe(attach(&self.inner));
        self.inner.processor.request();
        self.inner.grant_initial_credit();
        self.inner.drain();
        Ok(())
    }

    pub fn request(&self, n: u64) {
        self.inner.request(n);
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Cancel delivery and stop requesting links. Idempotent.
    pub fn dispose(&self) {
        self.inner.cancel();
        self.inner.processor.dispose();
        let forwarder = self.inner.slot.lock().forwarder.take();
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
    }

    pub fn requested(&self) -> i64 {
        self.inner.requested.load(Ordering::Acquire)
    }

    pub fn buffered(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminal.lock().is_some()
    }

    pub fn current_link(&self) -> Option<Arc<L>> {
        self.inner.slot.lock().link.clone()
    }

    pub fn processor(&self) -> &ResourceProcessor<L> {
        &self.inner.processor
    }
}

impl<L: InboundLink> PipelineInner<L> {
    fn install(self: &Arc<Self>, link: &Arc<L>) {
        let weak = Arc::downgrade(self);
        let supplier: CreditSupplier = {
            let weak = weak.clone();
            Arc::new(move || weak.upgrade().map_or(0, |pipeline| pipeline.credits_to_add()))
        };
        if let Err(err) = link.set_credit_supplier(supplier) {
            tracing::debug!(pipeline = %self.name, error = %err, "credit supplier not registered");
        }
        let generation = self.links_seen.fetch_add(1, Ordering::AcqRel);
        let first = generation == 0;
        {
            let mut slot = self.slot.lock();
            if let Some(previous) = slot.forwarder.take() {
                previous.abort();
            }
            let forwarder = link.take_messages().map(|mut messages| {
                self.runtime.spawn(async move {
                    while let Some(message) = messages.recv().await {
                        let Some(pipeline) = weak.upgrade() else {
                            break;
                        };
                        pipeline.on_message(generation, message);
                    }
                })
            });
            *slot = LinkSlot {
                link: Some(Arc::clone(link)),
                generation,
                credited: false,
                first,
                forwarder,
            };
        }
        tracing::debug!(pipeline = %self.name, link = link.id(), first, "receive link installed");
        if self.subscribed.load(Ordering::Acquire) && !self.cancelled.load(Ordering::Acquire) {
            self.grant_initial_credit();
        }
        self.drain();
    }

    /// Grant the link's first credit once. The first link gets the prefetch
    /// count; replacements get whatever demand is still unmet.
    fn grant_initial_credit(&self) -> bool {
        let (link, credits) = {
            let mut slot = self.slot.lock();
            if slot.credited {
                return false;
            }
            let Some(link) = slot.link.clone() else {
                return false;
            };
            let credits = if slot.first && self.options.prefetch > 0 {
                self.options.prefetch
            } else {
                self.credits_to_add()
            };
            if credits == 0 {
                return false;
            }
            slot.credited = true;
            (link, credits)
        };
        tracing::debug!(pipeline = %self.name, link = link.id(), credits, "initial credit");
        if let Err(err) = link.add_credits(credits) {
            tracing::debug!(pipeline = %self.name, error = %err, "initial credit not granted");
        }
        true
    }

    /// Unbounded demand asks for one message at a time; otherwise unmet
    /// demand, clamped to the 32-bit credit range.
    fn credits_to_add(&self) -> u32 {
        let requested = self.requested.load(Ordering::Acquire);
        if requested == UNBOUNDED {
            return 1;
        }
        let buffered = i64::try_from(self.queue.lock().len()).unwrap_or(i64::MAX);
        let outstanding = requested.saturating_sub(buffered).max(0);
        u32::try_from(outstanding).unwrap_or(u32::MAX)
    }

    fn on_message(&self, generation: usize, message: Message) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let overflow = {
            let mut slot = self.slot.lock();
            if slot.generation != generation || slot.link.is_none() {
                return;
            }
            let mut queue = self.queue.lock();
            if queue.len() >= self.options.max_queue_size {
                // Nothing after the dropped message may be buffered, or the
                // replacement would resume past it.
                slot.link = None;
                if let Some(forwarder) = slot.forwarder.take() {
                    forwarder.abort();
                }
                Some(queue.len())
            } else {
                if let Some(hook) = &self.on_buffered {
                    hook(&message);
                }
                queue.push_back(message);
                None
            }
        };
        if let Some(buffered) = overflow {
            tracing::warn!(pipeline = %self.name, buffered, "receive buffer full, recycling link");
            self.processor.fail(ConduitError::QueueOverflow(buffered));
            return;
        }
        self.drain();
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            self.drain_pass();
            let remaining = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if remaining == 0 {
                return;
            }
            missed = remaining;
        }
    }

    fn drain_pass(&self) {
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                let discarded = {
                    let mut queue = self.queue.lock();
                    let discarded = queue.len();
                    queue.clear();
                    discarded
                };
                if self.downstream.lock().take().is_some() || discarded > 0 {
                    tracing::debug!(pipeline = %self.name, discarded, "downstream cancelled");
                }
                return;
            }
            let terminal = self.terminal.lock().clone();
            if let Some(outcome) = terminal {
                self.queue.lock().clear();
                let subscriber = self.downstream.lock().take();
                if let Some(subscriber) = subscriber {
                    deliver_terminal(subscriber.as_ref(), outcome);
                }
                return;
            }
            let Some(subscriber) = self.downstream.lock().clone() else {
                return;
            };
            if self.requested.load(Ordering::Acquire) <= 0 {
                return;
            }
            let Some(message) = self.queue.lock().pop_front() else {
                return;
            };
            let _ = self
                .requested
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    (current != UNBOUNDED).then(|| current - 1)
                });
            t_counter!("conduit_client_messages_delivered_total").increment(1);
            subscriber.on_next(message);
        }
    }
}

impl<L: InboundLink> Demand for PipelineInner<L> {
    fn request(&self, n: u64) {
        if n == 0 {
            tracing::warn!(pipeline = %self.name, "ignoring request for zero messages");
            return;
        }
        let add = i64::try_from(n).unwrap_or(UNBOUNDED);
        let _ = self
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(if current == UNBOUNDED {
                    UNBOUNDED
                } else {
                    current.saturating_add(add)
                })
            });
        if !self.grant_initial_credit() {
            let link = self.slot.lock().link.clone();
            if let Some(link) = link
                && let Err(err) = link.replenish_if_empty()
            {
                tracing::debug!(pipeline = %self.name, error = %err, "credit not replenished");
            }
        }
        self.drain();
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.drain();
    }
}

fn deliver_terminal(subscriber: &dyn Subscriber, outcome: ConduitError) {
    match outcome {
        ConduitError::Completed => subscriber.on_complete(),
        err => subscriber.on_error(err),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::endpoint::EndpointState;
    use crate::processor::{ProcessorOptions, ResourceSource};
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::watch;

    pub(crate) struct MockLink {
        id: String,
        state: watch::Sender<EndpointState>,
        sender: mpsc::UnboundedSender<Message>,
        receiver: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
        credit: AtomicU32,
        grants: Mutex<Vec<u32>>,
        supplier: Mutex<Option<CreditSupplier>>,
        closes: AtomicUsize,
    }

    impl MockLink {
        pub(crate) fn new(id: &str) -> Arc<Self> {
            let (sender, receiver) = mpsc::unbounded_channel();
            Arc::new(Self {
                id: id.to_string(),
                state: watch::channel(EndpointState::Active).0,
                sender,
                receiver: Mutex::new(Some(receiver)),
                credit: AtomicU32::new(0),
                grants: Mutex::new(Vec::new()),
                supplier: Mutex::new(None),
                closes: AtomicUsize::new(0),
            })
        }

        /// Push one transfer the way the engine does: consume a credit and
        /// consult the supplier when credit runs out.
        pub(crate) fn deliver(&self, seq: i64) {
            let message = Message::new(Bytes::from(seq.to_string()))
                .with_annotation("x-opt-sequence-number", seq);
            let _ = self.credit.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some(c.saturating_sub(1))
            });
            let _ = self.sender.send(message);
            if self.credit.load(Ordering::SeqCst) == 0 {
                self.consult_supplier();
            }
        }

        fn consult_supplier(&self) {
            let supplier = self.supplier.lock().clone();
            if let Some(supplier) = supplier {
                let credits = supplier();
                if credits > 0 {
                    self.credit.fetch_add(credits, Ordering::SeqCst);
                    self.grants.lock().push(credits);
                }
            }
        }

        pub(crate) fn grants(&self) -> Vec<u32> {
            self.grants.lock().clone()
        }

        pub(crate) fn set(&self, state: EndpointState) {
            self.state.send_replace(state);
        }

        pub(crate) fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    impl Recoverable for MockLink {
        fn id(&self) -> &str {
            &self.id
        }

        fn endpoint_states(&self) -> watch::Receiver<EndpointState> {
            self.state.subscribe()
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl InboundLink for MockLink {
        fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
            self.receiver.lock().take()
        }

        fn add_credits(&self, credits: u32) -> ConduitResult<()> {
            self.credit.fetch_add(credits, Ordering::SeqCst);
            self.grants.lock().push(credits);
            Ok(())
        }

        fn set_credit_supplier(&self, supplier: CreditSupplier) -> ConduitResult<()> {
            *self.supplier.lock() = Some(supplier);
            Ok(())
        }

        fn replenish_if_empty(&self) -> ConduitResult<()> {
            if self.credit.load(Ordering::SeqCst) == 0 {
                self.consult_supplier();
            }
            Ok(())
        }
    }

    pub(crate) struct LinkSource {
        links: Mutex<VecDeque<Option<ConduitResult<Arc<MockLink>>>>>,
    }

    impl LinkSource {
        pub(crate) fn new(links: Vec<Option<ConduitResult<Arc<MockLink>>>>) -> Arc<Self> {
            Arc::new(Self {
                links: Mutex::new(links.into()),
            })
        }
    }

    #[async_trait]
    impl ResourceSource<MockLink> for LinkSource {
        async fn next(&self) -> Option<ConduitResult<Arc<MockLink>>> {
            let step = self.links.lock().pop_front();
            match step {
                Some(step) => step,
                // Out of script: behave like a link that never arrives.
                None => std::future::pending().await,
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct Recorder {
        pub(crate) subscription: Mutex<Option<Subscription>>,
        pub(crate) messages: Mutex<Vec<Message>>,
        pub(crate) errors: Mutex<Vec<ConduitError>>,
        pub(crate) completions: AtomicUsize,
        in_next: AtomicBool,
        pub(crate) overlaps: AtomicUsize,
        refill: AtomicBool,
    }

    impl Recorder {
        pub(crate) fn request(&self, n: u64) {
            let subscription = self.subscription.lock().clone();
            subscription.expect("subscribed").request(n);
        }

        pub(crate) fn received(&self) -> usize {
            self.messages.lock().len()
        }
    }

    impl Subscriber for Recorder {
        fn on_subscribe(&self, subscription: Subscription) {
            *self.subscription.lock() = Some(subscription);
        }

        fn on_next(&self, message: Message) {
            if self.in_next.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            self.messages.lock().push(message);
            if self.refill.load(Ordering::SeqCst) {
                let subscription = self.subscription.lock().clone();
                if let Some(subscription) = subscription {
                    subscription.request(1);
                }
            }
            self.in_next.store(false, Ordering::SeqCst);
        }

        fn on_error(&self, error: ConduitError) {
            self.errors.lock().push(error);
        }

        fn on_complete(&self) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn policy() -> Arc<dyn RetryPolicy> {
        Arc::new(|err: &ConduitError, attempt: u32| {
            (err.is_transient() && attempt <= 3).then(|| Duration::from_millis(20))
        })
    }

    pub(crate) fn pipeline(
        source: Arc<LinkSource>,
        prefetch: u32,
        max_queue_size: usize,
    ) -> (ReceivePipeline<MockLink>, Dispatcher<()>) {
        pipeline_with_hook(source, prefetch, max_queue_size, None)
    }

    fn pipeline_with_hook(
        source: Arc<LinkSource>,
        prefetch: u32,
        max_queue_size: usize,
        on_buffered: Option<BufferedHook>,
    ) -> (ReceivePipeline<MockLink>, Dispatcher<()>) {
        let timer = Dispatcher::spawn("pipeline-timer", |_| ()).expect("timer");
        let processor = ResourceProcessor::new(
            ProcessorOptions::new("links").reconnect_on_close(true),
            source,
            policy(),
            Arc::new(timer.clone()),
            Handle::current(),
        );
        let pipeline = ReceivePipeline::new(
            "test-pipeline",
            PipelineOptions {
                prefetch,
                max_queue_size,
            },
            processor,
            Handle::current(),
            on_buffered,
        );
        (pipeline, timer)
    }

    pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn prefetch_covers_initial_demand() -> anyhow::Result<()> {
        let link = MockLink::new("l1");
        let (pipeline, timer) = pipeline(LinkSource::new(vec![Some(Ok(Arc::clone(&link)))]), 10, 100);
        let recorder = Arc::new(Recorder::default());
        pipeline.subscribe(recorder.clone())?;
        eventually(|| pipeline.current_link().is_some()).await;
        assert_eq!(link.grants(), vec![10]);

        recorder.request(5);
        assert_eq!(link.grants(), vec![10]);
        for seq in 0..5 {
            link.deliver(seq);
        }
        eventually(|| recorder.received() == 5).await;
        assert_eq!(pipeline.requested(), 0);
        assert_eq!(pipeline.buffered(), 0);
        assert_eq!(link.grants(), vec![10]);
        timer.close();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivery_never_exceeds_demand() -> anyhow::Result<()> {
        let link = MockLink::new("l1");
        let (pipeline, timer) = pipeline(LinkSource::new(vec![Some(Ok(Arc::clone(&link)))]), 10, 100);
        let recorder = Arc::new(Recorder::default());
        pipeline.subscribe(recorder.clone())?;
        eventually(|| pipeline.current_link().is_some()).await;

        recorder.request(3);
        for seq in 0..10 {
            link.deliver(seq);
        }
        eventually(|| pipeline.buffered() == 7).await;
        assert_eq!(recorder.received(), 3);

        recorder.request(2);
        eventually(|| recorder.received() == 5).await;
        assert_eq!(pipeline.buffered(), 5);
        assert_eq!(pipeline.requested(), 0);
        timer.close();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exhausted_credit_is_refilled_from_unmet_demand() -> anyhow::Result<()> {
        let link = MockLink::new("l1");
        let (pipeline, timer) = pipeline(LinkSource::new(vec![Some(Ok(Arc::clone(&link)))]), 2, 100);
        let recorder = Arc::new(Recorder::default());
        pipeline.subscribe(recorder.clone())?;
        eventually(|| pipeline.current_link().is_some()).await;
        recorder.request(5);
        eventually(|| pipeline.requested() == 5).await;

        link.deliver(0);
        link.deliver(1);
        eventually(|| link.grants().len() == 2).await;
        let grants = link.grants();
        assert_eq!(grants[0], 2);
        // Demand 5, at most two buffered or delivered: three to five more.
        assert!((3..=5).contains(&grants[1]), "grants {grants:?}");
        timer.close();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn starved_link_is_replenished_on_request() -> anyhow::Result<()> {
        let link = MockLink::new("l1");
        let (pipeline, timer) = pipeline(LinkSource::new(vec![Some(Ok(Arc::clone(&link)))]), 2, 100);
        let recorder = Arc::new(Recorder::default());
        pipeline.subscribe(recorder.clone())?;
        eventually(|| pipeline.current_link().is_some()).await;

        link.deliver(0);
        link.deliver(1);
        eventually(|| pipeline.buffered() == 2).await;
        assert_eq!(link.grants(), vec![2]);

        recorder.request(6);
        eventually(|| recorder.received() == 2).await;
        assert_eq!(link.grants(), vec![2, 4]);
        timer.close();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unbounded_demand_is_not_decremented() -> anyhow::Result<()> {
        let link = MockLink::new("l1");
        let (pipeline, timer) = pipeline(LinkSource::new(vec![Some(Ok(Arc::clone(&link)))]), 1, 100);
        let recorder = Arc::new(Recorder::default());
        pipeline.subscribe(recorder.clone())?;
        eventually(|| pipeline.current_link().is_some()).await;

        recorder.request(u64::MAX);
        recorder.request(10);
        for seq in 0..4 {
            link.deliver(seq);
        }
        eventually(|| recorder.received() == 4).await;
        assert_eq!(pipeline.requested(), UNBOUNDED);
        assert_eq!(link.grants(), vec![1, 1, 1, 1, 1]);
        timer.close();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_subscriber_is_rejected() -> anyhow::Result<()> {
        let (pipeline, timer) = pipeline(LinkSource::new(vec![]), 1, 10);
        pipeline.subscribe(Arc::new(Recorder::default()))?;
        let err = pipeline
            .subscribe(Arc::new(Recorder::default()))
            .expect_err("second subscriber");
        assert!(matches!(err, ConduitError::AlreadySubscribed));
        timer.close();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_discards_buffer_and_detaches() -> anyhow::Result<()> {
        let link = MockLink::new("l1");
        let (pipeline, timer) = pipeline(LinkSource::new(vec![Some(Ok(Arc::clone(&link)))]), 10, 100);
        let recorder = Arc::new(Recorder::default());
        pipeline.subscribe(recorder.clone())?;
        eventually(|| pipeline.current_link().is_some()).await;
        for seq in 0..4 {
            link.deliver(seq);
        }
        eventually(|| pipeline.buffered() == 4).await;

        pipeline.cancel();
        pipeline.cancel();
        assert_eq!(pipeline.buffered(), 0);
        recorder.request(10);
        link.deliver(4);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(recorder.received(), 0);
        assert!(recorder.errors.lock().is_empty());
        assert_eq!(recorder.completions.load(Ordering::SeqCst), 0);
        // Cancel leaves the link alone; dispose tears it down.
        assert_eq!(link.closes(), 0);
        pipeline.dispose();
        pipeline.dispose();
        assert_eq!(link.closes(), 1);
        timer.close();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fatal_link_error_is_delivered_once_and_replayed() -> anyhow::Result<()> {
        let link = MockLink::new("l1");
        let (pipeline, timer) = pipeline(LinkSource::new(vec![Some(Ok(Arc::clone(&link)))]), 10, 100);
        let recorder = Arc::new(Recorder::default());
        pipeline.subscribe(recorder.clone())?;
        eventually(|| pipeline.current_link().is_some()).await;
        link.deliver(0);
        eventually(|| pipeline.buffered() == 1).await;

        link.set(EndpointState::Failed(ConduitError::Authorization("revoked".into())));
        eventually(|| recorder.errors.lock().len() == 1).await;
        assert_eq!(pipeline.buffered(), 0);
        assert_eq!(recorder.received(), 0);

        let late = Arc::new(Recorder::default());
        pipeline.subscribe(late.clone())?;
        assert!(matches!(
            late.errors.lock().first(),
            Some(ConduitError::Authorization(_))
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(recorder.errors.lock().len(), 1);
        timer.close();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn upstream_completion_completes_downstream() -> anyhow::Result<()> {
        let (pipeline, timer) = pipeline(LinkSource::new(vec![None]), 10, 100);
        let recorder = Arc::new(Recorder::default());
        pipeline.subscribe(recorder.clone())?;
        eventually(|| recorder.completions.load(Ordering::SeqCst) == 1).await;
        assert!(pipeline.is_terminated());
        timer.close();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replacement_link_gets_unmet_demand_not_prefetch() -> anyhow::Result<()> {
        let first = MockLink::new("l1");
        let second = MockLink::new("l2");
        let source = LinkSource::new(vec![
            Some(Ok(Arc::clone(&first))),
            Some(Ok(Arc::clone(&second))),
        ]);
        let (pipeline, timer) = pipeline(source, 10, 100);
        let recorder = Arc::new(Recorder::default());
        pipeline.subscribe(recorder.clone())?;
        eventually(|| pipeline.current_link().is_some()).await;
        recorder.request(4);

        first.set(EndpointState::Failed(ConduitError::Transient("reset".into())));
        eventually(|| {
            pipeline
                .current_link()
                .is_some_and(|link| Arc::ptr_eq(&link, &second))
        })
        .await;
        assert_eq!(first.closes(), 1);
        assert_eq!(second.grants(), vec![4]);

        second.deliver(0);
        eventually(|| recorder.received() == 1).await;
        assert!(recorder.errors.lock().is_empty());
        timer.close();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn graceful_link_close_reconnects_immediately() -> anyhow::Result<()> {
        let first = MockLink::new("l1");
        let second = MockLink::new("l2");
        let source = LinkSource::new(vec![
            Some(Ok(Arc::clone(&first))),
            Some(Ok(Arc::clone(&second))),
        ]);
        let (pipeline, timer) = pipeline(source, 10, 100);
        pipeline.subscribe(Arc::new(Recorder::default()))?;
        eventually(|| pipeline.current_link().is_some()).await;

        first.set(EndpointState::Closed);
        eventually(|| {
            pipeline
                .current_link()
                .is_some_and(|link| Arc::ptr_eq(&link, &second))
        })
        .await;
        assert_eq!(pipeline.processor().retry_attempts(), 0);
        timer.close();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overflow_recycles_the_link() -> anyhow::Result<()> {
        let first = MockLink::new("l1");
        let second = MockLink::new("l2");
        let source = LinkSource::new(vec![
            Some(Ok(Arc::clone(&first))),
            Some(Ok(Arc::clone(&second))),
        ]);
        let (pipeline, timer) = pipeline(source, 5, 2);
        pipeline.subscribe(Arc::new(Recorder::default()))?;
        eventually(|| pipeline.current_link().is_some()).await;

        for seq in 0..3 {
            first.deliver(seq);
        }
        eventually(|| {
            pipeline
                .current_link()
                .is_some_and(|link| Arc::ptr_eq(&link, &second))
        })
        .await;
        assert_eq!(first.closes(), 1);
        assert_eq!(pipeline.buffered(), 2);
        assert!(matches!(
            pipeline.processor().last_error(),
            Some(ConduitError::QueueOverflow(2))
        ));
        timer.close();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recycled_link_stragglers_are_not_buffered() -> anyhow::Result<()> {
        let first = MockLink::new("l1");
        let second = MockLink::new("l2");
        let source = LinkSource::new(vec![
            Some(Ok(Arc::clone(&first))),
            Some(Ok(Arc::clone(&second))),
        ]);
        let highest = Arc::new(AtomicI64::new(-1));
        let hook: BufferedHook = {
            let highest = Arc::clone(&highest);
            Arc::new(move |message| {
                if let Some(seq) = message.annotation_i64("x-opt-sequence-number") {
                    highest.fetch_max(seq, Ordering::SeqCst);
                }
            })
        };
        let (pipeline, timer) = pipeline_with_hook(source, 10, 2, Some(hook));
        let recorder = Arc::new(Recorder::default());
        pipeline.subscribe(recorder.clone())?;
        eventually(|| pipeline.current_link().is_some()).await;

        first.deliver(0);
        first.deliver(1);
        eventually(|| pipeline.buffered() == 2).await;
        first.deliver(2);
        eventually(|| {
            matches!(
                pipeline.processor().last_error(),
                Some(ConduitError::QueueOverflow(_))
            )
        })
        .await;

        // A slot frees up before the old link's next transfer shows up.
        recorder.request(1);
        eventually(|| recorder.received() == 1).await;
        first.deliver(3);
        eventually(|| {
            pipeline
                .current_link()
                .is_some_and(|link| Arc::ptr_eq(&link, &second))
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(highest.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.buffered(), 1);
        timer.close();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_never_overlap_emission() -> anyhow::Result<()> {
        let link = MockLink::new("l1");
        let (pipeline, timer) = pipeline(LinkSource::new(vec![Some(Ok(Arc::clone(&link)))]), 500, 1000);
        let recorder = Arc::new(Recorder::default());
        recorder.refill.store(true, Ordering::SeqCst);
        pipeline.subscribe(recorder.clone())?;
        eventually(|| pipeline.current_link().is_some()).await;

        let mut requesters = Vec::new();
        for _ in 0..4 {
            let recorder = Arc::clone(&recorder);
            requesters.push(tokio::spawn(async move {
                for _ in 0..25 {
                    recorder.request(1);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for seq in 0..400 {
            link.deliver(seq);
        }
        for requester in requesters {
            requester.await?;
        }
        eventually(|| recorder.received() == 400).await;
        assert_eq!(recorder.overlaps.load(Ordering::SeqCst), 0);
        let order: Vec<Bytes> = recorder
            .messages
            .lock()
            .iter()
            .map(|m| m.body.clone())
            .collect();
        let expected: Vec<Bytes> = (0..400).map(|seq: i64| Bytes::from(seq.to_string())).collect();
        assert_eq!(order, expected);
        timer.close();
        Ok(())
    }
}
