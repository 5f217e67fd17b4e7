//! The cooperative send loop.
//!
//! One task per outbox.  Each wake performs a single tick: sweep, ack
//! reclaim, claim, dispatch.  The scheduler itself knows nothing about
//! transports; it drives an abstract [`SendDriver`], which the routing
//! layer implements.  (The driver split mirrors the manager/factory
//! separation used elsewhere in this workspace.)

use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::task::SpawnExt;
use futures::{select_biased, FutureExt, StreamExt};
use tor_error::RetryTime;
use tor_rtcompat::{Runtime, SleepProviderExt};
use tracing::{debug, info, warn};

use crate::record::OutboxRecord;
use crate::store::{OutboxStore, StoreError};

/// A failed send attempt, as reported by the driver.
#[derive(Debug, Clone, thiserror::Error)]
#[error("send failed: {code}")]
#[non_exhaustive]
pub struct SendAttemptError {
    /// The surfaced error code (e.g. `PROXY_UNREACHABLE`,
    /// `FORWARD_FAILED:no_route`).
    pub code: String,
    /// Whether this failure is worth retrying on the same route.
    pub retry: RetryTime,
}

impl SendAttemptError {
    /// A transient failure with the given code.
    pub fn transient(code: impl Into<String>) -> Self {
        SendAttemptError {
            code: code.into(),
            retry: RetryTime::AfterWaiting,
        }
    }

    /// A terminal failure: this route will not work for this record.
    pub fn terminal(code: impl Into<String>) -> Self {
        SendAttemptError {
            code: code.into(),
            retry: RetryTime::Never,
        }
    }

    /// Construct from a code and an explicit retry time.
    pub fn with_retry(code: impl Into<String>, retry: RetryTime) -> Self {
        SendAttemptError {
            code: code.into(),
            retry,
        }
    }
}

/// What the scheduler drives: route planning plus per-route sends.
///
/// `Route` is opaque here; the routing layer uses its transport-kind
/// enum.  `routes_for` returns the primary first, fallbacks after.
#[async_trait]
pub trait SendDriver: Send + Sync + 'static {
    /// A handle naming one way to send (a transport kind, typically).
    type Route: Clone + Debug + Send + Sync;

    /// Routes to try for this record, best first.  Empty means "no route
    /// right now": the record waits with backoff.
    fn routes_for(&self, record: &OutboxRecord) -> Vec<Self::Route>;

    /// Send `record` via `route`.  The scheduler has already applied its
    /// per-call deadline around this.
    async fn send_via(
        &self,
        route: &Self::Route,
        record: &OutboxRecord,
    ) -> Result<(), SendAttemptError>;

    /// Health feedback after an attempt.
    fn note_outcome(&self, route: &Self::Route, ok: bool);
}

/// Tunables for the scheduler.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SchedulerConfig {
    /// Maximum records claimed per tick.
    pub claim_limit: usize,
    /// Per-send deadline.
    pub send_timeout: Duration,
    /// How long to wait for an ack before re-queuing.
    pub ack_deadline: Duration,
    /// Attempt budget before a record expires.
    pub max_attempts: u32,
    /// Idle wake interval when nothing is due.
    pub idle_wake: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            claim_limit: 16,
            send_timeout: Duration::from_secs(10),
            ack_deadline: Duration::from_secs(30),
            max_attempts: 8,
            idle_wake: Duration::from_secs(60),
        }
    }
}

/// Handle for waking and stopping a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    /// Wake channel into the loop.
    wake_tx: mpsc::Sender<()>,
    /// Dropping all clones of this stops the loop; an explicit stop is a
    /// send on the wake channel after setting the flag.
    stop: Arc<Mutex<bool>>,
}

impl SchedulerHandle {
    /// Ask the scheduler to run a tick soon (e.g. after a new `put`).
    pub fn wake(&self) {
        let mut tx = self.wake_tx.clone();
        let _ = tx.try_send(());
    }

    /// Ask the scheduler to exit after its current tick.
    pub fn stop(&self) {
        *self.stop.lock().expect("poisoned scheduler stop flag") = true;
        self.wake();
    }
}

/// The outbox send loop.
pub struct Scheduler<R: Runtime, D: SendDriver> {
    /// Runtime for sleeps, deadlines, and spawning.
    runtime: R,
    /// The outbox this scheduler drains.
    store: Arc<OutboxStore>,
    /// Route planner and sender.
    driver: Arc<D>,
    /// Tunables.
    config: SchedulerConfig,
}

impl<R: Runtime, D: SendDriver> Scheduler<R, D> {
    /// Construct a scheduler over `store` and `driver`.
    pub fn new(runtime: R, store: Arc<OutboxStore>, driver: Arc<D>, config: SchedulerConfig) -> Self {
        Scheduler {
            runtime,
            store,
            driver,
            config,
        }
    }

    /// Spawn the scheduler loop; returns its control handle.
    pub fn launch(self) -> Result<SchedulerHandle, futures::task::SpawnError> {
        let (wake_tx, wake_rx) = mpsc::channel(8);
        let stop = Arc::new(Mutex::new(false));
        let handle = SchedulerHandle {
            wake_tx,
            stop: Arc::clone(&stop),
        };
        let runtime = self.runtime.clone();
        runtime.spawn(self.run(wake_rx, stop))?;
        Ok(handle)
    }

    /// The loop: tick, then sleep until due or woken.
    async fn run(self, mut wake_rx: mpsc::Receiver<()>, stop: Arc<Mutex<bool>>) {
        info!("outbox scheduler running");
        loop {
            if *stop.lock().expect("poisoned scheduler stop flag") {
                break;
            }
            if let Err(e) = self.tick().await {
                warn!("outbox tick failed: {}", e);
            }

            let now_ms = now_ms(&self.runtime);
            let delay = match self.store.next_due_at() {
                Some(due) if due <= now_ms => Duration::from_millis(10),
                Some(due) => Duration::from_millis(due - now_ms),
                None => self.config.idle_wake,
            };
            let delay = delay.min(self.config.idle_wake);
            select_biased! {
                _ = wake_rx.next() => {}
                _ = self.runtime.sleep(delay).fuse() => {}
            }
        }
        info!("outbox scheduler stopped");
    }

    /// One pass over the outbox.  Public so tests (and the router, on
    /// demand) can drive the scheduler deterministically.
    pub async fn tick(&self) -> Result<(), StoreError> {
        let now = now_ms(&self.runtime);

        {
            // The rng must not live across the dispatch awaits below.
            let mut rng = rand::rng();
            self.store.sweep_expired(now, self.config.max_attempts)?;
            self.store.reclaim_overdue(now, &mut rng)?;
        }

        let ack_deadline = self.config.ack_deadline.as_millis() as u64;
        let claimed = self
            .store
            .claim_due(now, self.config.claim_limit, ack_deadline)?;
        for record in claimed {
            self.dispatch(record).await?;
        }
        Ok(())
    }

    /// Send one claimed record: primary first, fallbacks only on
    /// terminal failures.  Transient failures re-queue with backoff; a
    /// successful send leaves the record in flight awaiting its ack.
    async fn dispatch(&self, record: OutboxRecord) -> Result<(), StoreError> {
        let routes = self.driver.routes_for(&record);
        if routes.is_empty() {
            debug!(
                "no route for outbox record {}; backing off",
                record.message_id
            );
            let mut rng = rand::rng();
            self.store
                .release_for_retry(&record.message_id, now_ms(&self.runtime), &mut rng)?;
            return Ok(());
        }

        for (i, route) in routes.iter().enumerate() {
            let outcome = self
                .runtime
                .timeout(
                    self.config.send_timeout,
                    self.driver.send_via(route, &record),
                )
                .await;
            let outcome = match outcome {
                Ok(r) => r,
                Err(_timeout) => Err(SendAttemptError::transient("ABORTED_TIMEOUT")),
            };
            match outcome {
                Ok(()) => {
                    debug!(
                        "outbox record {} sent via {:?}; awaiting ack",
                        record.message_id, route
                    );
                    self.driver.note_outcome(route, true);
                    return Ok(());
                }
                Err(e) => {
                    self.driver.note_outcome(route, false);
                    let terminal = matches!(e.retry, RetryTime::Never);
                    debug!(
                        "outbox record {} failed via {:?}: {} ({})",
                        record.message_id,
                        route,
                        e.code,
                        if terminal { "terminal" } else { "transient" },
                    );
                    if terminal && i + 1 < routes.len() {
                        // Terminal on this route: escalate to the next
                        // fallback immediately.
                        continue;
                    }
                    let mut rng = rand::rng();
                    self.store.release_for_retry(
                        &record.message_id,
                        now_ms(&self.runtime),
                        &mut rng,
                    )?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// Current wall-clock time, in ms since the epoch, per the runtime.
fn now_ms<R: Runtime>(runtime: &R) -> u64 {
    runtime
        .wallclock()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use crate::record::{Priority, RecordStatus};
    use fs_mistrust::Mistrust;
    use nightjar_envelope::{ConvId, DeviceId, MessageId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tor_rtcompat::SleepProvider;

    /// A driver that records calls and answers from a script.
    struct ScriptDriver {
        /// Routes handed to every record.
        routes: Vec<&'static str>,
        /// How each (route) send should end.
        verdict: Box<dyn Fn(&str) -> Result<(), SendAttemptError> + Send + Sync>,
        /// Calls observed, as (route, message id) pairs.
        calls: Mutex<Vec<(String, String)>>,
        /// How long each send takes.
        delay: Duration,
        /// Concurrent sends per message id, for the at-most-once check.
        concurrent: AtomicUsize,
        /// Highest concurrency observed.
        max_concurrent: AtomicUsize,
    }

    impl ScriptDriver {
        fn ok(routes: Vec<&'static str>) -> Arc<Self> {
            Self::scripted(routes, |_| Ok(()))
        }

        fn scripted<F>(routes: Vec<&'static str>, verdict: F) -> Arc<Self>
        where
            F: Fn(&str) -> Result<(), SendAttemptError> + Send + Sync + 'static,
        {
            Arc::new(ScriptDriver {
                routes,
                verdict: Box::new(verdict),
                calls: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SendDriver for ScriptDriver {
        type Route = &'static str;

        fn routes_for(&self, _record: &OutboxRecord) -> Vec<&'static str> {
            self.routes.clone()
        }

        async fn send_via(
            &self,
            route: &&'static str,
            record: &OutboxRecord,
        ) -> Result<(), SendAttemptError> {
            let n = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(n, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap()
                .push((route.to_string(), record.message_id.as_str().to_owned()));
            if !self.delay.is_zero() {
                futures::pending!(); // yield at least once
            }
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            (self.verdict)(route)
        }

        fn note_outcome(&self, _route: &&'static str, _ok: bool) {}
    }

    fn record(id: &str, now: u64) -> OutboxRecord {
        OutboxRecord::new(
            MessageId::from(id),
            ConvId::from("c"),
            DeviceId::from("d"),
            "ct",
            Priority::Normal,
            now,
        )
    }

    fn fresh_store(tmp: &tempfile::TempDir) -> Arc<OutboxStore> {
        Arc::new(
            OutboxStore::open(tmp.path(), &Mistrust::new_dangerously_trust_everyone()).unwrap(),
        )
    }

    #[test]
    fn sends_and_leaves_in_flight() {
        tor_rtcompat::test_with_one_runtime!(|rt| async move {
            let tmp = tempfile::TempDir::new().unwrap();
            let store = fresh_store(&tmp);
            let driver = ScriptDriver::ok(vec!["direct"]);
            let sched = Scheduler::new(
                rt.clone(),
                Arc::clone(&store),
                Arc::clone(&driver),
                SchedulerConfig::default(),
            );

            store.put(record("m1", 0)).unwrap();
            sched.tick().await.unwrap();

            assert_eq!(driver.calls(), vec![("direct".to_owned(), "m1".to_owned())]);
            let r = store.get(&MessageId::from("m1")).unwrap();
            assert_eq!(r.status, RecordStatus::InFlight);

            // Ack destroys the record.
            store.note_ack(&MessageId::from("m1")).unwrap();
            assert!(store.is_empty());
        });
    }

    #[test]
    fn at_most_one_send_per_message() {
        tor_rtcompat::test_with_one_runtime!(|rt| async move {
            let tmp = tempfile::TempDir::new().unwrap();
            let store = fresh_store(&tmp);
            let driver = ScriptDriver::ok(vec!["direct"]);
            let sched = Arc::new(Scheduler::new(
                rt.clone(),
                Arc::clone(&store),
                Arc::clone(&driver),
                SchedulerConfig::default(),
            ));

            store.put(record("m1", 0)).unwrap();

            // Two ticks racing: the claim is atomic, so exactly one send
            // happens.
            let s1 = Arc::clone(&sched);
            let s2 = Arc::clone(&sched);
            futures::join!(
                async move { s1.tick().await.unwrap() },
                async move { s2.tick().await.unwrap() },
            );

            assert_eq!(driver.calls().len(), 1);
            assert_eq!(driver.max_concurrent.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn transient_failure_backs_off() {
        tor_rtcompat::test_with_one_runtime!(|rt| async move {
            let tmp = tempfile::TempDir::new().unwrap();
            let store = fresh_store(&tmp);
            let driver = ScriptDriver::scripted(vec!["onion"], |_| {
                Err(SendAttemptError::transient("PROXY_UNREACHABLE"))
            });
            let sched = Scheduler::new(
                rt.clone(),
                Arc::clone(&store),
                Arc::clone(&driver),
                SchedulerConfig::default(),
            );

            store.put(record("m1", 0)).unwrap();
            sched.tick().await.unwrap();

            // One attempt, then pending again with backoff applied.
            assert_eq!(driver.calls().len(), 1);
            let r = store.get(&MessageId::from("m1")).unwrap();
            assert_eq!(r.status, RecordStatus::Pending);
            assert_eq!(r.attempts, 1);
            assert!(r.next_attempt_at_ms > 0);

            // A second tick right away claims nothing: not due yet.
            sched.tick().await.unwrap();
            assert_eq!(driver.calls().len(), 1);
        });
    }

    #[test]
    fn terminal_failure_escalates_to_fallback() {
        tor_rtcompat::test_with_one_runtime!(|rt| async move {
            let tmp = tempfile::TempDir::new().unwrap();
            let store = fresh_store(&tmp);
            let driver = ScriptDriver::scripted(vec!["direct", "onion"], |route| {
                if route == "direct" {
                    Err(SendAttemptError::terminal("CHANNEL_NOT_OPEN"))
                } else {
                    Ok(())
                }
            });
            let sched = Scheduler::new(
                rt.clone(),
                Arc::clone(&store),
                Arc::clone(&driver),
                SchedulerConfig::default(),
            );

            store.put(record("m1", 0)).unwrap();
            sched.tick().await.unwrap();

            // Both routes tried within the same tick, in order.
            let routes: Vec<String> = driver.calls().into_iter().map(|(r, _)| r).collect();
            assert_eq!(routes, vec!["direct", "onion"]);
            let r = store.get(&MessageId::from("m1")).unwrap();
            assert_eq!(r.status, RecordStatus::InFlight);
        });
    }

    #[test]
    fn no_route_backs_off() {
        tor_rtcompat::test_with_one_runtime!(|rt| async move {
            let tmp = tempfile::TempDir::new().unwrap();
            let store = fresh_store(&tmp);
            let driver = ScriptDriver::ok(vec![]);
            let sched = Scheduler::new(
                rt.clone(),
                Arc::clone(&store),
                Arc::clone(&driver),
                SchedulerConfig::default(),
            );

            store.put(record("m1", 0)).unwrap();
            sched.tick().await.unwrap();
            assert!(driver.calls().is_empty());
            let r = store.get(&MessageId::from("m1")).unwrap();
            assert_eq!(r.status, RecordStatus::Pending);
            assert_eq!(r.attempts, 1);
        });
    }

    #[test]
    fn launch_and_wake_drains_the_outbox() {
        tor_rtcompat::test_with_one_runtime!(|rt| async move {
            let tmp = tempfile::TempDir::new().unwrap();
            let store = fresh_store(&tmp);
            let driver = ScriptDriver::ok(vec!["direct"]);
            let sched = Scheduler::new(
                rt.clone(),
                Arc::clone(&store),
                Arc::clone(&driver),
                SchedulerConfig::default(),
            );
            let handle = sched.launch().unwrap();

            store.put(record("m1", 0)).unwrap();
            handle.wake();

            // Give the loop a moment to pick the record up.
            for _ in 0..50 {
                if !driver.calls().is_empty() {
                    break;
                }
                rt.sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(driver.calls().len(), 1);
            handle.stop();
        });
    }
}
