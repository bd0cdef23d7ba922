//! Bounded fan-out engine shared by every pipeline job.
//!
//! Work units run with at most `limit` in flight and start in submission
//! order. Post-phase effects run strictly one at a time, in the order they
//! were posted, and never before every unit known at post time has started.
//!
//! A failing unit never cancels its siblings. The failure is counted, sent
//! to subscribers as [`ProcessorEvent::Error`] and returned through that
//! unit's [`UnitHandle`]; [`Processor::run`] still resolves `Ok` with the
//! final [`ProcessorSummary`] whether or not anyone subscribed.
//!
//! A unit must not await the handle of an effect it posted: it still holds
//! its slot, and the effect may be waiting for queued units to start.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinSet;

type Deferred = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;
type Outcome = Result<(), ProcessorError>;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("processor has already finished")]
    Closed,

    #[error("processor is already running")]
    AlreadyRunning,

    #[error("work panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Failed(anyhow::Error),
}

/// Final counts reported by [`Processor::run`] and [`ProcessorEvent::Finish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub effects_succeeded: usize,
    pub effects_failed: usize,
}

impl ProcessorSummary {
    /// Number of work units that ran to completion, successfully or not.
    pub fn settled(&self) -> usize {
        self.succeeded + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorEvent {
    Error { message: String },
    EffectError { message: String },
    Finish(ProcessorSummary),
}

/// Resolves once the submitted unit or effect has settled.
#[derive(Debug)]
pub struct UnitHandle {
    rx: oneshot::Receiver<Outcome>,
}

impl Future for UnitHandle {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ProcessorError::Closed)))
    }
}

impl UnitHandle {
    fn settled(outcome: Outcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { rx }
    }
}

struct PendingUnit {
    work: Deferred,
    done: oneshot::Sender<Outcome>,
}

struct PendingEffect {
    after: usize,
    work: Deferred,
    done: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<PendingUnit>,
    closed: bool,
}

struct Shared {
    limit: usize,
    queue: Mutex<Queue>,
    wake: Notify,
    submitted: AtomicUsize,
    started: watch::Sender<usize>,
    effects_tx: Mutex<Option<mpsc::UnboundedSender<PendingEffect>>>,
    effects_rx: Mutex<Option<mpsc::UnboundedReceiver<PendingEffect>>>,
    events: broadcast::Sender<ProcessorEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn pop_front(&self) -> Option<PendingUnit> {
        lock(&self.queue).pending.pop_front()
    }

    /// Closes the queue if nothing is pending. Checked under the same lock
    /// as `add`, so no unit can slip in between the check and the close.
    fn close_if_idle(&self) -> bool {
        let mut queue = lock(&self.queue);
        if queue.pending.is_empty() {
            queue.closed = true;
            true
        } else {
            false
        }
    }
}

/// Cheaply clonable handle; units capture a clone to post effects or to
/// submit follow-up units while the processor runs.
#[derive(Clone)]
pub struct Processor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("limit", &self.shared.limit)
            .field("submitted", &self.shared.submitted.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Processor {
    /// Create a processor running at most `limit` units at once (minimum 1).
    pub fn new(limit: usize) -> Self {
        let (effects_tx, effects_rx) = mpsc::unbounded_channel();
        let (started, _) = watch::channel(0);
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                limit: limit.max(1),
                queue: Mutex::new(Queue::default()),
                wake: Notify::new(),
                submitted: AtomicUsize::new(0),
                started,
                effects_tx: Mutex::new(Some(effects_tx)),
                effects_rx: Mutex::new(Some(effects_rx)),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.shared.events.subscribe()
    }

    /// Register a work unit. Safe before or during [`Processor::run`]; after
    /// the run has finished the returned handle resolves to
    /// [`ProcessorError::Closed`].
    pub fn add<F, Fut>(&self, unit: F) -> UnitHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        {
            let mut queue = lock(&self.shared.queue);
            if queue.closed {
                return UnitHandle::settled(Err(ProcessorError::Closed));
            }
            queue.pending.push_back(PendingUnit {
                work: Box::new(move || unit().boxed()),
                done,
            });
            self.shared.submitted.fetch_add(1, Ordering::SeqCst);
        }
        self.shared.wake.notify_one();
        UnitHandle { rx }
    }

    /// Register a post-phase effect. It runs after every unit submitted so
    /// far has started, and never concurrently with another effect.
    pub fn post<F, Fut>(&self, effect: F) -> UnitHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        let pending = PendingEffect {
            after: self.shared.submitted.load(Ordering::SeqCst),
            work: Box::new(move || effect().boxed()),
            done,
        };
        let tx = lock(&self.shared.effects_tx);
        match tx.as_ref() {
            Some(tx) => {
                if let Err(mpsc::error::SendError(rejected)) = tx.send(pending) {
                    let _ = rejected.done.send(Err(ProcessorError::Closed));
                }
            }
            None => {
                let _ = pending.done.send(Err(ProcessorError::Closed));
            }
        }
        UnitHandle { rx }
    }

    /// Drain every unit, including units added while draining, then every
    /// effect posted before the drain finished.
    pub async fn run(&self) -> Result<ProcessorSummary, ProcessorError> {
        let effects_rx = lock(&self.shared.effects_rx)
            .take()
            .ok_or(ProcessorError::AlreadyRunning)?;
        let serial = tokio::spawn(drain_effects(
            effects_rx,
            self.shared.started.subscribe(),
            self.shared.events.clone(),
        ));

        let mut running: JoinSet<bool> = JoinSet::new();
        let mut summary = ProcessorSummary::default();

        loop {
            // A joined-but-unreaped task still counts, so this never
            // overshoots the ceiling.
            while running.len() < self.shared.limit {
                let Some(unit) = self.shared.pop_front() else {
                    break;
                };
                let shared = Arc::clone(&self.shared);
                running.spawn(async move {
                    let PendingUnit { work, done } = unit;
                    // Counted from inside the task, so an effect gated on
                    // this unit cannot run before the unit's first poll.
                    shared.started.send_modify(|n| *n += 1);
                    let outcome = settle(work).await;
                    let failed = outcome.is_err();
                    if let Err(e) = &outcome {
                        let _ = shared.events.send(ProcessorEvent::Error {
                            message: format!("{e:#}"),
                        });
                    }
                    let _ = done.send(outcome);
                    failed
                });
            }

            if running.is_empty() {
                if self.shared.close_if_idle() {
                    break;
                }
                continue;
            }

            tokio::select! {
                joined = running.join_next() => match joined {
                    Some(Ok(false)) => summary.succeeded += 1,
                    Some(Ok(true)) => summary.failed += 1,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Work unit task aborted");
                        summary.failed += 1;
                    }
                    None => {}
                },
                _ = self.shared.wake.notified() => {}
            }
        }

        // Dropping the sender lets the serial worker finish once drained.
        lock(&self.shared.effects_tx).take();
        match serial.await {
            Ok((ok, failed)) => {
                summary.effects_succeeded = ok;
                summary.effects_failed = failed;
            }
            Err(e) => tracing::warn!(error = %e, "Post-phase worker aborted"),
        }

        let _ = self.shared.events.send(ProcessorEvent::Finish(summary));
        Ok(summary)
    }
}

async fn drain_effects(
    mut rx: mpsc::UnboundedReceiver<PendingEffect>,
    mut started: watch::Receiver<usize>,
    events: broadcast::Sender<ProcessorEvent>,
) -> (usize, usize) {
    let mut ok = 0;
    let mut failed = 0;
    while let Some(effect) = rx.recv().await {
        let PendingEffect { after, work, done } = effect;
        // The sender lives as long as the processor, so this only errors
        // if the processor itself is gone.
        let _ = started.wait_for(|n| *n >= after).await;
        let outcome = settle(work).await;
        match &outcome {
            Ok(()) => ok += 1,
            Err(e) => {
                failed += 1;
                let _ = events.send(ProcessorEvent::EffectError {
                    message: format!("{e:#}"),
                });
            }
        }
        let _ = done.send(outcome);
    }
    (ok, failed)
}

async fn settle(work: Deferred) -> Outcome {
    match AssertUnwindSafe(async move { work().await })
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ProcessorError::Failed(e)),
        Err(panic) => Err(ProcessorError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
