//! Cluster-wide concurrency caps.
//!
//! Every in-flight call owns an entry in its key's history set, so the size
//! of that set is the number of calls in flight across all processes. A call
//! that finds the set over capacity is queued in the process that made it and
//! waits for enough release notifications on the key's channel.
//!
//! Each process counts the notifications it has seen on a [`SequenceCounter`].
//! A queued call records the counter value it must reach, `acks + (in_flight
//! - capacity)`, so calls queued earlier are released by earlier
//! notifications. Only the count of notifications matters, never their order
//! or payload.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::OnceCell;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::Clock;
use crate::SequenceCounter;
use crate::ShapeError;
use crate::history::HistoryStore;
use crate::history::request_id;
use crate::store::CoordinationStore;
use crate::store::Messages;

/// Where a controller stands with a key's release channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
}

enum Event {
    Enqueue {
        request_id: String,
        behind: i64,
        release: oneshot::Sender<()>,
    },
    Cancel {
        request_id: String,
    },
    Queued {
        reply: oneshot::Sender<usize>,
    },
}

#[derive(Debug)]
struct WaitingRequest {
    target: SequenceCounter,
    release: oneshot::Sender<()>,
}

/// The single consumer of one key's release notifications.
///
/// It alone owns the key's ack counter and queued calls; everybody else talks
/// to it through `events`.
#[derive(Debug)]
struct KeyWorker {
    events: mpsc::UnboundedSender<Event>,
    task: AbortHandle,
}

impl KeyWorker {
    fn spawn(key: &str, releases: Messages) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_worker(key.to_string(), receiver, releases));
        Self {
            events,
            task: task.abort_handle(),
        }
    }
}

impl Drop for KeyWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A key's worker and the number of local calls using the key.
#[derive(Debug, Default)]
struct KeyEntry {
    worker: Arc<OnceCell<KeyWorker>>,
    users: usize,
}

type Workers = Arc<Mutex<HashMap<String, KeyEntry>>>;

/// Keeps a key's worker alive while a local call is waiting on the key or
/// holds one of its slots. The last lease to go retires the worker, and the
/// key's subscription goes with it.
struct KeyLease {
    key: String,
    workers: Workers,
}

impl KeyLease {
    fn acquire(workers: &Workers, key: &str) -> (Self, Arc<OnceCell<KeyWorker>>) {
        let mut entries = lock(workers);
        let entry = entries.entry(key.to_string()).or_default();
        if entry
            .worker
            .get()
            .is_some_and(|worker| worker.events.is_closed())
        {
            entry.worker = Arc::default();
        }
        entry.users += 1;
        let worker = entry.worker.clone();
        drop(entries);

        let lease = Self {
            key: key.to_string(),
            workers: workers.clone(),
        };
        (lease, worker)
    }
}

impl fmt::Debug for KeyLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyLease").field(&self.key).finish()
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        let mut entries = lock(&self.workers);
        let Some(entry) = entries.get_mut(&self.key) else {
            return;
        };
        entry.users = entry.users.saturating_sub(1);
        if entry.users == 0 {
            entries.remove(&self.key);
            debug!(key = self.key, "retired idle key worker");
        }
    }
}

async fn run_worker(
    key: String,
    mut events: mpsc::UnboundedReceiver<Event>,
    mut releases: Messages,
) {
    let mut acks = SequenceCounter::new();
    let mut waiting: HashMap<String, WaitingRequest> = HashMap::new();

    loop {
        tokio::select! {
            // Enqueues sent before a release was published must see the ack
            // counter from before that release
            biased;

            event = events.recv() => match event {
                Some(Event::Enqueue { request_id, behind, release }) => {
                    match acks.ahead_by(behind) {
                        Ok(target) => {
                            trace!(key, request_id, target = target.get(), "waiting for release");
                            waiting.insert(request_id, WaitingRequest { target, release });
                        }
                        // Dropping `release` fails the waiting call
                        Err(err) => warn!(key, request_id, %err, "cannot queue request"),
                    }
                }
                Some(Event::Cancel { request_id }) => {
                    waiting.remove(&request_id);
                }
                Some(Event::Queued { reply }) => {
                    let _ = reply.send(waiting.len());
                }
                None => break,
            },
            message = releases.next() => match message {
                Some(_) => match acks.inc(1) {
                    Ok(()) => release_reached(&key, &acks, &mut waiting),
                    Err(err) => warn!(key, %err, "cannot count release"),
                },
                None => {
                    warn!(key, queued = waiting.len(), "release channel closed");
                    break;
                }
            },
        }
    }
}

fn release_reached(key: &str, acks: &SequenceCounter, waiting: &mut HashMap<String, WaitingRequest>) {
    let reached: Vec<String> = waiting
        .iter()
        .filter(|(_, request)| acks.diff(&request.target) >= 0)
        .map(|(request_id, _)| request_id.clone())
        .collect();

    for request_id in reached {
        if let Some(request) = waiting.remove(&request_id) {
            trace!(key, request_id, acks = acks.get(), "released");
            // The caller may have given up already; its own cleanup runs then
            let _ = request.release.send(());
        }
    }
}

/// Vacates slots: removes the holder's entry and, only if there was one,
/// announces the release to every process.
#[derive(Debug, Clone)]
pub(crate) struct Releaser {
    history: HistoryStore,
    publisher: Arc<dyn CoordinationStore>,
    timeout: Duration,
}

impl Releaser {
    pub(crate) async fn release(&self, key: &str, request_id: &str) -> Result<bool, ShapeError> {
        timeout(self.timeout, self.vacate(key, request_id))
            .await?
            .map_err(ShapeError::unavailable)
    }

    async fn vacate(&self, key: &str, request_id: &str) -> Result<bool, ShapeError> {
        if self.history.remove(key, request_id).await? == 0 {
            debug!(key, request_id, "slot already vacated");
            return Ok(false);
        }
        self.publisher.publish(key, request_id).await?;
        Ok(true)
    }

    /// Release from a synchronous context, if a runtime is around to do it.
    fn release_detached(&self, key: String, request_id: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key, request_id, "no runtime to release slot; it expires with the history");
            return;
        };
        let releaser = self.clone();
        runtime.spawn(async move {
            if let Err(err) = releaser.release(&key, &request_id).await {
                warn!(key, request_id, %err, "failed to release slot; it expires with the history");
            }
        });
    }
}

/// A concurrency slot held by an admitted call.
///
/// Call [`ack`](Slot::ack) once the guarded work is done. A slot dropped
/// without a successful ack is released in the background.
#[derive(Debug)]
pub struct Slot {
    key: String,
    request_id: String,
    queued: bool,
    releaser: Releaser,
    acked: AtomicBool,
    _lease: KeyLease,
}

impl Slot {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Whether the call had to wait for another call to finish.
    pub fn was_queued(&self) -> bool {
        self.queued
    }

    /// Give the slot back.
    ///
    /// Returns `false` if the slot had already been vacated, by an earlier
    /// ack or by the history expiring. That is not an error, and in that case
    /// nothing is announced.
    ///
    /// After a failed ack the slot is still held, and dropping it releases
    /// it in the background.
    pub async fn ack(&self) -> Result<bool, ShapeError> {
        let released = self.releaser.release(&self.key, &self.request_id).await?;
        self.acked.store(true, Ordering::Release);
        Ok(released)
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if !self.acked.load(Ordering::Acquire) {
            self.releaser
                .release_detached(std::mem::take(&mut self.key), std::mem::take(&mut self.request_id));
        }
    }
}

/// Cleans up a call that is still waiting for admission when it goes away.
struct PendingAdmission<'a> {
    key: &'a str,
    request_id: &'a str,
    events: &'a mpsc::UnboundedSender<Event>,
    releaser: &'a Releaser,
    armed: bool,
}

impl PendingAdmission<'_> {
    fn cancel_local(&self) {
        let _ = self.events.send(Event::Cancel {
            request_id: self.request_id.to_string(),
        });
    }
}

impl Drop for PendingAdmission<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(key = self.key, request_id = self.request_id, "admission cancelled");
            self.cancel_local();
            self.releaser
                .release_detached(self.key.to_string(), self.request_id.to_string());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn worker_gone() -> ShapeError {
    ShapeError::StoreUnavailable("release subscription closed".to_string())
}

/// Caps the number of calls in flight per key across every process sharing
/// the coordination store.
#[derive(Debug)]
pub struct ConcurrencyAdmissionController {
    history: HistoryStore,
    subscriber: Arc<dyn CoordinationStore>,
    releaser: Releaser,
    capacity: usize,
    retention: Duration,
    timeout: Duration,
    clock: Clock,
    workers: Workers,
}

impl ConcurrencyAdmissionController {
    /// `retention` bounds how long a slot survives without an ack, so slots
    /// held by crashed processes are eventually reclaimed.
    pub fn new(
        command: Arc<dyn CoordinationStore>,
        publisher: Arc<dyn CoordinationStore>,
        subscriber: Arc<dyn CoordinationStore>,
        capacity: usize,
        retention: Duration,
        timeout: Duration,
    ) -> Self {
        Self::with_clock(
            command,
            publisher,
            subscriber,
            capacity,
            retention,
            timeout,
            Clock::new(),
        )
    }

    pub fn with_clock(
        command: Arc<dyn CoordinationStore>,
        publisher: Arc<dyn CoordinationStore>,
        subscriber: Arc<dyn CoordinationStore>,
        capacity: usize,
        retention: Duration,
        timeout: Duration,
        clock: Clock,
    ) -> Self {
        let history = HistoryStore::new(command);
        Self {
            releaser: Releaser {
                history: history.clone(),
                publisher,
                timeout,
            },
            history,
            subscriber,
            capacity,
            retention,
            timeout,
            clock,
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscription(&self, key: &str) -> SubscriptionState {
        match lock(&self.workers).get(key) {
            None => SubscriptionState::Unsubscribed,
            Some(entry) if entry.worker.initialized() => SubscriptionState::Subscribed,
            Some(_) => SubscriptionState::Subscribing,
        }
    }

    /// Number of calls on `key` queued in this process.
    pub async fn queued(&self, key: &str) -> usize {
        let Some(events) = self.existing_worker(key) else {
            return 0;
        };
        let (reply, count) = oneshot::channel();
        if events.send(Event::Queued { reply }).is_err() {
            return 0;
        }
        count.await.unwrap_or_default()
    }

    /// Block until a slot on `key` is free, then hold it.
    ///
    /// # Errors
    ///
    /// `Timeout` if admission takes longer than the configured timeout,
    /// `ShapingUnavailable` if the store fails. Either way the call holds no
    /// slot afterwards: its entry is released before the error is returned.
    pub async fn wait(&self, key: &str) -> Result<Slot, ShapeError> {
        let (lease, worker) = KeyLease::acquire(&self.workers, key);
        let events = timeout(self.timeout, self.subscribe(key, &worker))
            .await?
            .map_err(ShapeError::unavailable)?;

        let now = self.clock.now_micros();
        let request_id = request_id(now);
        let mut pending = PendingAdmission {
            key,
            request_id: &request_id,
            events: &events,
            releaser: &self.releaser,
            armed: true,
        };

        let outcome = match timeout(self.timeout, self.admit(&events, key, &request_id, now)).await
        {
            Ok(outcome) => outcome,
            Err(elapsed) => Err(elapsed.into()),
        };

        match outcome {
            Ok(queued) => {
                pending.armed = false;
                drop(pending);
                Ok(Slot {
                    key: key.to_string(),
                    request_id,
                    queued,
                    releaser: self.releaser.clone(),
                    acked: AtomicBool::new(false),
                    _lease: lease,
                })
            }
            Err(err) => {
                pending.cancel_local();
                let released = self.releaser.release(key, &request_id).await;
                pending.armed = false;
                if let Err(release_err) = released {
                    warn!(
                        key,
                        request_id,
                        %release_err,
                        "failed to release slot; it expires with the history"
                    );
                }
                Err(err.unavailable())
            }
        }
    }

    async fn admit(
        &self,
        events: &mpsc::UnboundedSender<Event>,
        key: &str,
        request_id: &str,
        now: i64,
    ) -> Result<bool, ShapeError> {
        let history = self
            .history
            .record(key, request_id, now, self.retention)
            .await?;
        let in_flight = history.len() + 1;

        if in_flight <= self.capacity {
            debug!(key, in_flight, capacity = self.capacity, "admitted");
            return Ok(false);
        }

        let behind = (in_flight - self.capacity) as i64;
        let (release, released) = oneshot::channel();
        events
            .send(Event::Enqueue {
                request_id: request_id.to_string(),
                behind,
                release,
            })
            .map_err(|_| worker_gone())?;
        debug!(key, in_flight, behind, "queued");

        released.await.map_err(|_| worker_gone())?;
        debug!(key, request_id, "admitted after release");
        Ok(true)
    }

    fn existing_worker(&self, key: &str) -> Option<mpsc::UnboundedSender<Event>> {
        lock(&self.workers)
            .get(key)
            .and_then(|entry| entry.worker.get())
            .map(|worker| worker.events.clone())
    }

    /// Subscribe to `key`'s release channel unless a worker already has.
    async fn subscribe(
        &self,
        key: &str,
        worker: &OnceCell<KeyWorker>,
    ) -> Result<mpsc::UnboundedSender<Event>, ShapeError> {
        let worker = worker
            .get_or_try_init(|| async {
                let releases = self.subscriber.subscribe(key).await?;
                debug!(key, "subscribed to releases");
                Ok::<_, ShapeError>(KeyWorker::spawn(key, releases))
            })
            .await?;
        Ok(worker.events.clone())
    }
}
