// Single-threaded dispatcher that owns a protocol engine.
//
// The engine is not safe for concurrent use, so it lives on one dedicated
// thread and every mutation is a job sent to that thread. Callers on any
// thread enqueue jobs through an unbounded channel; the channel wake is what
// returns the dispatcher from its wait. Jobs run strictly in submission order.
// Delayed jobs wait in a deadline heap and may run after later immediate jobs.
use crate::error::{ConduitError, ConduitResult};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

type Job<E> = Box<dyn FnOnce(&mut E) + Send>;

enum Command<E> {
    Run(Job<E>),
    RunAt(Instant, Job<E>),
    Shutdown,
}

struct Delayed<E> {
    deadline: Instant,
    seq: u64,
    job: Job<E>,
}

impl<E> PartialEq for Delayed<E> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<E> Eq for Delayed<E> {}

impl<E> PartialOrd for Delayed<E> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Delayed<E> {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Shared<E> {
    name: String,
    tx: mpsc::UnboundedSender<Command<E>>,
    closed: AtomicBool,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// Handle to a dispatcher thread running an engine of type `E`.
///
/// ```
/// use conduit_client::Dispatcher;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> conduit_client::ConduitResult<()> {
/// let dispatcher = Dispatcher::spawn("counter", |_| 0u64)?;
/// dispatcher.submit(|count| *count += 1)?;
/// let count = dispatcher.invoke(|count| *count).await?;
/// assert_eq!(count, 1);
/// dispatcher.close();
/// # Ok(())
/// # }
/// ```
pub struct Dispatcher<E> {
    inner: Arc<Shared<E>>,
}

impl<E> Clone for Dispatcher<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> std::fmt::Debug for Dispatcher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<E: 'static> Dispatcher<E> {
    /// Start the dispatcher thread. `factory` runs on that thread, inside its
    /// runtime, so the engine may spawn IO tasks and never crosses threads.
    pub fn spawn<F>(name: impl Into<String>, factory: F) -> ConduitResult<Self>
    where
        F: FnOnce(&Dispatcher<E>) -> E + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            inner: Arc::new(Shared {
                name: name.clone(),
                tx,
                closed: AtomicBool::new(false),
                thread: Mutex::new(None),
            }),
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = dispatcher.clone();
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || runtime.block_on(run_loop(handle, rx, factory)))?;
        *dispatcher.inner.thread.lock() = Some(thread);
        Ok(dispatcher)
    }
}

impl<E> Dispatcher<E> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Enqueue `work` to run as soon as possible. Never blocks.
    pub fn submit<F>(&self, work: F) -> ConduitResult<()>
    where
        F: FnOnce(&mut E) + Send + 'static,
    {
        self.send(Command::Run(Box::new(work)))
    }

    /// Run `work` once `delay` has elapsed from now.
    pub fn submit_after<F>(&self, delay: Duration, work: F) -> ConduitResult<()>
    where
        F: FnOnce(&mut E) + Send + 'static,
    {
        self.send(Command::RunAt(Instant::now() + delay, Box::new(work)))
    }

    /// Run `work` on the dispatcher and wait for its result.
    pub async fn invoke<R, F>(&self, work: F) -> ConduitResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut E) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(move |engine| {
            let _ = tx.send(work(engine));
        })?;
        rx.await
            .map_err(|_| ConduitError::closed("dispatched work did not complete"))
    }

    /// Stop accepting work. Already queued immediate work still runs; delayed
    /// work is discarded and counted. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.tx.send(Command::Shutdown);
        tracing::debug!(dispatcher = %self.inner.name, "dispatcher close requested");
    }

    /// Close and wait for the thread to exit. Must not be called from the
    /// dispatcher thread itself.
    pub fn close_and_join(&self) {
        self.close();
        let thread = self.inner.thread.lock().take();
        if let Some(thread) = thread
            && thread.thread().id() != std::thread::current().id()
            && thread.join().is_err()
        {
            tracing::warn!(dispatcher = %self.inner.name, "dispatcher thread panicked");
        }
    }

    fn send(&self, command: Command<E>) -> ConduitResult<()> {
        if self.is_closed() {
            return Err(ConduitError::DispatcherClosed);
        }
        self.inner
            .tx
            .send(command)
            .map_err(|_| ConduitError::DispatcherClosed)
    }
}

/// Timer facility used by retry and refresh logic.
pub trait Scheduler: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, work: Box<dyn FnOnce() + Send>) -> ConduitResult<()>;
}

impl<E: 'static> Scheduler for Dispatcher<E> {
    fn schedule(&self, delay: Duration, work: Box<dyn FnOnce() + Send>) -> ConduitResult<()> {
        self.submit_after(delay, move |_| work())
    }
}

async fn run_loop<E, F>(
    handle: Dispatcher<E>,
    mut rx: mpsc::UnboundedReceiver<Command<E>>,
    factory: F,
) where
    F: FnOnce(&Dispatcher<E>) -> E,
{
    let name = handle.inner.name.clone();
    let mut engine = factory(&handle);
    drop(handle);
    let mut delayed: BinaryHeap<Delayed<E>> = BinaryHeap::new();
    let mut seq = 0u64;
    tracing::debug!(dispatcher = %name, "dispatcher started");

    loop {
        let next_deadline = delayed.peek().map(|item| item.deadline);
        tokio::select! {
            biased;
            _ = sleep_until_opt(next_deadline), if next_deadline.is_some() => {
                let now = Instant::now();
                while delayed.peek().is_some_and(|item| item.deadline <= now) {
                    if let Some(item) = delayed.pop() {
                        run_job(&name, &mut engine, item.job);
                    }
                }
            }
            command = rx.recv() => match command {
                Some(Command::Run(job)) => run_job(&name, &mut engine, job),
                Some(Command::RunAt(deadline, job)) => {
                    seq += 1;
                    delayed.push(Delayed { deadline, seq, job });
                }
                Some(Command::Shutdown) | None => break,
            },
        }
    }

    // Teardown: refuse new work, then account for everything still queued.
    rx.close();
    let mut executed = 0usize;
    let mut discarded = delayed.len();
    while let Ok(command) = rx.try_recv() {
        match command {
            Command::Run(job) => {
                run_job(&name, &mut engine, job);
                executed += 1;
            }
            Command::RunAt(..) => discarded += 1,
            Command::Shutdown => {}
        }
    }
    drop(delayed);
    drop(engine);
    t_counter!("conduit_client_dispatch_discarded_total").increment(discarded as u64);
    tracing::debug!(dispatcher = %name, executed, discarded, "dispatcher stopped");
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn run_job<E>(name: &str, engine: &mut E, job: Job<E>) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| job(engine))) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        t_counter!("conduit_client_dispatch_panics_total").increment(1);
        tracing::error!(dispatcher = %name, panic = %message, "dispatched work panicked");
    }
}
