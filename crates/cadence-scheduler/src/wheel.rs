//! In-memory timer holding every schedulable schedule.
//!
//! One driver task sleeps until the earliest due instant, hands the firing to
//! a [`FireSink`], and only then computes that schedule's following instant,
//! so firings of one schedule are emitted in strictly increasing order.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use cadence_core::types::Schedule;
use cadence_cron::CronSchedule;
use cadence_store::Store;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest single sleep; the wall clock is re-read at least this often.
const MAX_SLEEP: StdDuration = StdDuration::from_secs(60);
/// A firing later than this is not emitted; the schedule skips ahead.
const MAX_LATENESS_SECS: i64 = 60;

/// Receives due firings from the wheel.
#[async_trait]
pub trait FireSink: Send + Sync {
    /// Called on the driver task; should return once the firing is queued.
    async fn fire(&self, schedule: Arc<Schedule>, scheduled_time: DateTime<Utc>, catch_up: bool);
}

/// Public view of one registered job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelEntry {
    pub schedule_id: Uuid,
    pub next_fire: DateTime<Utc>,
}

struct Job {
    schedule: Arc<Schedule>,
    cron: CronSchedule,
    zone: Tz,
    next: DateTime<Utc>,
    generation: u64,
}

impl Job {
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron
            .next_after(&after.with_timezone(&self.zone))
            .map(|t| t.with_timezone(&Utc))
    }
}

#[derive(Default)]
struct WheelState {
    jobs: HashMap<Uuid, Job>,
    due: BTreeSet<(DateTime<Utc>, u64, Uuid)>,
    generation: u64,
}

impl WheelState {
    fn remove(&mut self, id: Uuid) -> bool {
        match self.jobs.remove(&id) {
            Some(job) => {
                self.due.remove(&(job.next, job.generation, id));
                true
            }
            None => false,
        }
    }
}

type NextWrite = (Uuid, Option<DateTime<Utc>>);

struct WheelInner {
    state: RwLock<WheelState>,
    wake: Notify,
    sink: Arc<dyn FireSink>,
    /// Next-fire writes, sent while the state lock is held so the writer
    /// applies them in the order the wheel changed.
    persist: mpsc::UnboundedSender<NextWrite>,
}

#[derive(Clone)]
pub struct TimeWheel {
    inner: Arc<WheelInner>,
    cancel: CancellationToken,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
    writer: Arc<Mutex<Option<(mpsc::UnboundedReceiver<NextWrite>, Arc<dyn Store>)>>>,
}

impl TimeWheel {
    pub fn new(sink: Arc<dyn FireSink>, store: Arc<dyn Store>) -> Self {
        Self::with_cancel(sink, store, CancellationToken::new())
    }

    /// Like [`TimeWheel::new`], but the driver also stops when `cancel` does.
    pub fn with_cancel(
        sink: Arc<dyn FireSink>,
        store: Arc<dyn Store>,
        cancel: CancellationToken,
    ) -> Self {
        let (persist, pending) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(WheelInner {
                state: RwLock::new(WheelState::default()),
                wake: Notify::new(),
                sink,
                persist,
            }),
            cancel,
            driver: Arc::new(Mutex::new(None)),
            writer: Arc::new(Mutex::new(Some((pending, store)))),
        }
    }

    /// Install or replace the job for `schedule`. Schedules that are disabled,
    /// not active, or never fire again are unregistered instead.
    pub fn register(&self, schedule: Schedule) {
        let id = schedule.id;
        if !schedule.is_schedulable() {
            self.unregister(id);
            return;
        }
        let cron = match schedule.cron() {
            Ok(cron) => cron,
            Err(e) => {
                warn!(schedule_id = %id, error = %e, "not registering schedule");
                self.unregister(id);
                return;
            }
        };
        let zone = schedule.zone();
        let mut job = Job {
            schedule: Arc::new(schedule),
            cron,
            zone,
            next: Utc::now(),
            generation: 0,
        };
        let Some(next) = job.next_after(Utc::now()) else {
            warn!(schedule_id = %id, "schedule has no future firing");
            self.unregister(id);
            return;
        };
        job.next = next;

        if let Ok(mut state) = self.inner.state.write() {
            state.remove(id);
            state.generation += 1;
            job.generation = state.generation;
            state.due.insert((next, job.generation, id));
            state.jobs.insert(id, job);
            let _ = self.inner.persist.send((id, Some(next)));
        }
        debug!(schedule_id = %id, next_fire = %next, "schedule registered");
        self.inner.wake.notify_one();
    }

    /// Idempotent.
    pub fn unregister(&self, id: Uuid) {
        let removed = self
            .inner
            .state
            .write()
            .map(|mut state| state.remove(id))
            .unwrap_or(false);
        if removed {
            debug!(schedule_id = %id, "schedule unregistered");
            self.inner.wake.notify_one();
        }
    }

    pub fn entry_for(&self, id: Uuid) -> Option<WheelEntry> {
        let state = self.inner.state.read().ok()?;
        state.jobs.get(&id).map(|job| WheelEntry {
            schedule_id: id,
            next_fire: job.next,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.state.read().map(|s| s.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the driver and the next-fire writer. Writes queued by earlier
    /// registrations are applied first.
    pub fn start(&self) {
        let Ok(mut driver) = self.driver.lock() else {
            return;
        };
        if driver.is_some() {
            return;
        }
        if let Some((pending, store)) = self.writer.lock().ok().and_then(|mut w| w.take()) {
            tokio::spawn(write_next_fires(pending, store));
        }
        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        *driver = Some(tokio::spawn(async move { inner.run(cancel).await }));
        info!(jobs = self.len(), "time wheel started");
    }

    /// Stop emitting firings. A firing already handed to the sink completes.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.driver.lock().ok().and_then(|mut d| d.take());
        if let Some(handle) = handle {
            let _ = handle.await;
            info!("time wheel stopped");
        }
    }
}

/// Applies next-fire writes one at a time, in send order. Ends once every
/// wheel handle is gone.
async fn write_next_fires(mut pending: mpsc::UnboundedReceiver<NextWrite>, store: Arc<dyn Store>) {
    while let Some((id, next)) = pending.recv().await {
        if let Err(e) = store.set_next_execution(id, next).await {
            warn!(schedule_id = %id, error = %e, "failed to persist next execution time");
        }
    }
}

enum Step {
    Fire {
        id: Uuid,
        generation: u64,
        schedule: Arc<Schedule>,
        at: DateTime<Utc>,
    },
    Sleep(StdDuration),
}

impl WheelInner {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.next_step(Utc::now()) {
                Step::Fire {
                    id,
                    generation,
                    schedule,
                    at,
                } => {
                    let now = Utc::now();
                    let late = now - at > Duration::seconds(MAX_LATENESS_SECS);
                    if late && !schedule.catch_up_missed {
                        warn!(schedule_id = %id, scheduled_time = %at, "firing too late, skipping ahead");
                    } else {
                        self.sink.fire(schedule, at, late).await;
                    }
                    self.advance(id, generation, if late { Utc::now() } else { at });
                }
                Step::Sleep(wait) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    fn next_step(&self, now: DateTime<Utc>) -> Step {
        let Ok(mut state) = self.state.write() else {
            return Step::Sleep(MAX_SLEEP);
        };
        let Some(&(at, generation, id)) = state.due.first() else {
            return Step::Sleep(MAX_SLEEP);
        };
        if at > now {
            let wait = (at - now).to_std().unwrap_or(StdDuration::ZERO);
            return Step::Sleep(wait.min(MAX_SLEEP));
        }
        state.due.remove(&(at, generation, id));
        match state.jobs.get(&id) {
            Some(job) if job.generation == generation => Step::Fire {
                id,
                generation,
                schedule: job.schedule.clone(),
                at,
            },
            _ => Step::Sleep(StdDuration::ZERO),
        }
    }

    /// Compute the job's following firing after `after`, unless the job was
    /// replaced or removed while the sink had it.
    fn advance(&self, id: Uuid, generation: u64, after: DateTime<Utc>) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        let Some(job) = state.jobs.get_mut(&id) else {
            return;
        };
        if job.generation != generation {
            return;
        }
        let next = match job.next_after(after) {
            Some(next) => {
                job.next = next;
                state.due.insert((next, generation, id));
                Some(next)
            }
            None => {
                state.jobs.remove(&id);
                None
            }
        };
        let _ = self.persist.send((id, next));
    }
}
