// One live recoverable resource shared by many waiters, replaced on failure.
//
// State machine: Idle -> AwaitingUpstream -> Publishing(resource)
//   -> (failure) AwaitingRetry -> AwaitingUpstream -> ...
// until terminated by a non-retryable error, upstream completion or dispose.
//
// All mutation of the current resource and the waiting set happens under one
// mutex. `upstream_in_flight` keeps at most one upstream request outstanding.
use crate::dispatcher::Scheduler;
use crate::endpoint::EndpointState;
use crate::error::{ConduitError, ConduitResult};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// A resource whose liveness is observable and which can be closed.
pub trait Recoverable: Send + Sync + 'static {
    fn id(&self) -> &str;
    /// Liveness stream; a `Failed` state re-enters the processor's failure path.
    fn endpoint_states(&self) -> watch::Receiver<EndpointState>;
    /// Idempotent.
    fn close(&self);
}

/// Upstream producer, pulled one resource at a time. `None` means exhausted.
#[async_trait]
pub trait ResourceSource<T>: Send + Sync + 'static {
    async fn next(&self) -> Option<ConduitResult<Arc<T>>>;
}

/// Hooks for components layered on a processor.
pub trait ResourceObserver<T>: Send + Sync + 'static {
    fn on_resource(&self, resource: &Arc<T>);
    fn on_terminated(&self, outcome: &ConduitError);
}

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub name: String,
    /// Request a replacement immediately when the resource closes without
    /// error. Otherwise the next `subscribe` requests one.
    pub reconnect_on_close: bool,
}

impl ProcessorOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reconnect_on_close: false,
        }
    }

    pub fn reconnect_on_close(mut self, value: bool) -> Self {
        self.reconnect_on_close = value;
        self
    }
}

struct State<T> {
    current: Option<Arc<T>>,
    generation: u64,
    waiters: Vec<oneshot::Sender<ConduitResult<Arc<T>>>>,
    upstream_in_flight: bool,
    retry_pending: bool,
    retry_attempts: u32,
    last_error: Option<ConduitError>,
    terminal: Option<ConduitError>,
    monitor: Option<JoinHandle<()>>,
}

struct Inner<T> {
    options: ProcessorOptions,
    source: Arc<dyn ResourceSource<T>>,
    policy: Arc<dyn RetryPolicy>,
    scheduler: Arc<dyn Scheduler>,
    runtime: Handle,
    observer: Mutex<Option<Arc<dyn ResourceObserver<T>>>>,
    state: Mutex<State<T>>,
}

#[derive(Clone, Copy)]
enum FailureOrigin {
    Resource(u64),
    Upstream,
    External,
}

enum FailureAction {
    Ignore,
    Retry(Duration),
    Terminate,
}

/// Cache of one live `T` with retry-driven replacement.
pub struct ResourceProcessor<T: Recoverable> {
    inner: Arc<Inner<T>>,
}

impl<T: Recoverable> Clone for ResourceProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Recoverable> ResourceProcessor<T> {
    pub fn new(
        options: ProcessorOptions,
        source: Arc<dyn ResourceSource<T>>,
        policy: Arc<dyn RetryPolicy>,
        scheduler: Arc<dyn Scheduler>,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                source,
                policy,
                scheduler,
                runtime,
                observer: Mutex::new(None),
                state: Mutex::new(State {
                    current: None,
                    generation: 0,
                    waiters: Vec::new(),
                    upstream_in_flight: false,
                    retry_pending: false,
                    retry_attempts: 0,
                    last_error: None,
                    terminal: None,
                    monitor: None,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn set_observer(&self, observer: Arc<dyn ResourceObserver<T>>) {
        *self.inner.observer.lock() = Some(observer);
    }

    /// Resolve with the live resource, waiting for one if necessary.
    ///
    /// Never blocks: terminal outcomes and a live resource resolve at once,
    /// otherwise the caller joins the waiting set.
    pub fn subscribe(&self) -> BoxFuture<'static, ConduitResult<Arc<T>>> {
        let mut state = self.inner.state.lock();
        if let Some(outcome) = &state.terminal {
            return futures::future::ready(Err(outcome.clone())).boxed();
        }
        if let Some(current) = &state.current {
            return futures::future::ready(Ok(Arc::clone(current))).boxed();
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push(tx);
        let request = Self::claim_upstream(&mut state);
        drop(state);
        if request {
            self.inner.request_upstream();
        }
        async move {
            rx.await
                .unwrap_or_else(|_| Err(ConduitError::closed("resource processor dropped")))
        }
        .boxed()
    }

    /// Request a resource without waiting for it.
    pub fn request(&self) {
        let mut state = self.inner.state.lock();
        if state.terminal.is_some() || state.current.is_some() {
            return;
        }
        let request = Self::claim_upstream(&mut state);
        drop(state);
        if request {
            self.inner.request_upstream();
        }
    }

    /// Report a failure detected outside the resource's own liveness stream.
    pub fn fail(&self, error: ConduitError) {
        let origin = {
            let state = self.inner.state.lock();
            match state.current {
                Some(_) => FailureOrigin::Resource(state.generation),
                None => FailureOrigin::External,
            }
        };
        self.inner.on_failure(error, origin);
    }

    /// Tear down the current resource and refuse future subscribers. Idempotent.
    pub fn dispose(&self) {
        let outcome = ConduitError::closed(format!("{} disposed", self.inner.options.name));
        self.inner.terminate(outcome);
    }

    pub fn current(&self) -> Option<Arc<T>> {
        self.inner.state.lock().current.clone()
    }

    /// Consecutive failed attempts since the last resource became active.
    pub fn retry_attempts(&self) -> u32 {
        self.inner.state.lock().retry_attempts
    }

    pub fn has_been_retried(&self) -> bool {
        self.retry_attempts() > 0
    }

    pub fn last_error(&self) -> Option<ConduitError> {
        self.inner.state.lock().last_error.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().terminal.is_some()
    }

    fn claim_upstream(state: &mut State<T>) -> bool {
        if state.upstream_in_flight || state.retry_pending {
            return false;
        }
        state.upstream_in_flight = true;
        true
    }
}

impl<T: Recoverable> Inner<T> {
    fn request_upstream(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tracing::debug!(processor = %self.options.name, "requesting resource from upstream");
        self.runtime.spawn(async move {
            match inner.source.next().await {
                Some(Ok(resource)) => inner.on_resource(resource),
                Some(Err(err)) => inner.on_failure(err, FailureOrigin::Upstream),
                None => {
                    inner.state.lock().upstream_in_flight = false;
                    inner.terminate(ConduitError::Completed);
                }
            }
        });
    }

    fn on_resource(self: &Arc<Self>, resource: Arc<T>) {
        let (previous, waiters) = {
            let mut state = self.state.lock();
            state.upstream_in_flight = false;
            if state.terminal.is_some() {
                drop(state);
                resource.close();
                return;
            }
            state.generation += 1;
            let generation = state.generation;
            if let Some(monitor) = state.monitor.take() {
                monitor.abort();
            }
            state.monitor = Some(self.spawn_monitor(&resource, generation));
            let previous = state.current.replace(Arc::clone(&resource));
            (previous, std::mem::take(&mut state.waiters))
        };
        tracing::debug!(
            processor = %self.options.name,
            resource = resource.id(),
            waiters = waiters.len(),
            "resource installed"
        );
        if let Some(previous) = previous {
            previous.close();
        }
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer.on_resource(&resource);
        }
        for waiter in waiters {
            let _ = waiter.send(Ok(Arc::clone(&resource)));
        }
    }

    fn spawn_monitor(self: &Arc<Self>, resource: &Arc<T>, generation: u64) -> JoinHandle<()> {
        let mut states = resource.endpoint_states();
        let weak: Weak<Self> = Arc::downgrade(self);
        self.runtime.spawn(async move {
            loop {
                let state = states.borrow_and_update().clone();
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match state {
                    EndpointState::Active => inner.on_active(generation),
                    EndpointState::Closed => {
                        inner.on_closed(generation);
                        return;
                    }
                    EndpointState::Failed(err) => {
                        inner.on_failure(err, FailureOrigin::Resource(generation));
                        return;
                    }
                    _ => {}
                }
                drop(inner);
                if states.changed().await.is_err() {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_closed(generation);
                    }
                    return;
                }
            }
        })
    }

    fn on_active(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation && state.retry_attempts > 0 {
            tracing::debug!(
                processor = %self.options.name,
                attempts = state.retry_attempts,
                "resource active, retry counter reset"
            );
            state.retry_attempts = 0;
        }
    }

    fn on_closed(self: &Arc<Self>, generation: u64) {
        let (closed, request) = {
            let mut state = self.state.lock();
            if state.terminal.is_some() || state.generation != generation {
                return;
            }
            let Some(closed) = state.current.take() else {
                return;
            };
            state.monitor = None;
            let request = self.options.reconnect_on_close
                && !state.upstream_in_flight
                && !state.retry_pending;
            if request {
                state.upstream_in_flight = true;
            }
            (closed, request)
        };
        tracing::debug!(
            processor = %self.options.name,
            resource = closed.id(),
            reconnect = request,
            "resource closed"
        );
        closed.close();
        if request {
            self.request_upstream();
        }
    }

    fn on_failure(self: &Arc<Self>, error: ConduitError, origin: FailureOrigin) {
        let (failed, action, attempt) = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            let mut failed = None;
            match origin {
                FailureOrigin::Resource(generation) => {
                    if generation != state.generation || state.current.is_none() {
                        return;
                    }
                    failed = state.current.take();
                    if let Some(monitor) = state.monitor.take() {
                        monitor.abort();
                    }
                }
                FailureOrigin::Upstream => state.upstream_in_flight = false,
                FailureOrigin::External => {}
            }
            state.last_error = Some(error.clone());
            let attempt = state.retry_attempts.saturating_add(1);
            let action = match (self.policy.decide(&error, attempt), state.retry_pending) {
                (None, _) => FailureAction::Terminate,
                (Some(_), true) => FailureAction::Ignore,
                (Some(delay), false) => {
                    state.retry_attempts = attempt;
                    state.retry_pending = true;
                    FailureAction::Retry(delay)
                }
            };
            (failed, action, attempt)
        };
        if let Some(failed) = failed {
            failed.close();
        }
        t_counter!("conduit_client_resource_failures_total").increment(1);
        match action {
            FailureAction::Ignore => {
                tracing::debug!(
                    processor = %self.options.name,
                    error = %error,
                    "retry already pending, failure ignored"
                );
            }
            FailureAction::Retry(delay) => {
                tracing::info!(
                    processor = %self.options.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "resource failed, retrying"
                );
                let weak = Arc::downgrade(self);
                let scheduled = self.scheduler.schedule(
                    delay,
                    Box::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.on_retry_due();
                        }
                    }),
                );
                if let Err(err) = scheduled {
                    self.terminate(err);
                }
            }
            FailureAction::Terminate => {
                tracing::warn!(
                    processor = %self.options.name,
                    attempt,
                    error = %error,
                    "resource failed permanently"
                );
                self.terminate(error);
            }
        }
    }

    fn on_retry_due(self: &Arc<Self>) {
        let request = {
            let mut state = self.state.lock();
            state.retry_pending = false;
            if state.terminal.is_some() || state.current.is_some() || state.upstream_in_flight {
                false
            } else {
                state.upstream_in_flight = true;
                true
            }
        };
        if request {
            self.request_upstream();
        }
    }

    fn terminate(self: &Arc<Self>, outcome: ConduitError) {
        let (current, waiters) = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(outcome.clone());
            if let Some(monitor) = state.monitor.take() {
                monitor.abort();
            }
            (state.current.take(), std::mem::take(&mut state.waiters))
        };
        tracing::debug!(processor = %self.options.name, outcome = %outcome, "processor terminated");
        if let Some(current) = current {
            current.close();
        }
        for waiter in waiters {
            let _ = waiter.send(Err(outcome.clone()));
        }
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer.on_terminated(&outcome);
        }
    }
}
