//! Match-event delivery worker.
//!
//! Delivery runs on its own thread behind a bounded channel, so neither the
//! matcher nor ingestion ever blocks on subscriber I/O. The wire mechanics
//! live behind the injected [`Transport`]; this module owns attempt
//! accounting, per-QoS retry scheduling, and cancellation.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, never, select, Receiver, Sender, TrySendError};

use crate::error::DeliveryError;
use crate::matcher::{MatchDispatch, MatchEvent};
use crate::registry::{Reliability, Subscription, SubscriptionId, SubscriptionRegistry, TargetDescriptor};

/// Pushes one match event to one target. Implementations own the wire
/// mechanics (HTTP callback, queue, in-process channel); failures are
/// reported per attempt and retried according to the subscription's QoS.
pub trait Transport: Send + Sync {
    /// Attempts one delivery.
    ///
    /// # Errors
    /// `DeliveryError::Failed` when the attempt did not reach the target.
    fn deliver(&self, target: &TargetDescriptor, event: &MatchEvent) -> Result<(), DeliveryError>;
}

/// Exponential-backoff parameters for at-least-once retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct DeliveryEngineConfig {
    /// Max queued match dispatches before backpressure applies.
    pub dispatch_queue_capacity: usize,
    /// Retry schedule for at-least-once subscriptions.
    pub retry: RetryPolicy,
}

impl Default for DeliveryEngineConfig {
    fn default() -> Self {
        Self {
            dispatch_queue_capacity: 4096,
            retry: RetryPolicy::default(),
        }
    }
}

enum ControlMsg {
    Cancel { subscription_id: SubscriptionId },
}

/// One delivery attempt waiting for its due time.
struct RetryJob {
    subscription: Arc<Subscription>,
    target: TargetDescriptor,
    event: MatchEvent,
    /// Attempt about to be made (1 = first delivery).
    attempt: u32,
}

struct Pending {
    due: Instant,
    // Tie-break so the heap never compares jobs.
    ticket: u64,
    job: RetryJob,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.ticket == other.ticket
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the BinaryHeap pops the earliest due time first.
        (other.due, other.ticket).cmp(&(self.due, self.ticket))
    }
}

/// Delivery engine: owns the delivery worker thread.
pub struct DeliveryEngine {
    dispatch_tx: Sender<MatchDispatch>,
    control_tx: Sender<ControlMsg>,
    delivered: Arc<AtomicU64>,
    failed_attempts: Arc<AtomicU64>,
    abandoned: Arc<AtomicU64>,
    dropped_dispatches: AtomicU64,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryEngine {
    #[must_use]
    pub fn new(
        cfg: DeliveryEngineConfig,
        transport: Arc<dyn Transport>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        let (dispatch_tx, dispatch_rx) =
            bounded::<MatchDispatch>(cfg.dispatch_queue_capacity.max(1));
        let (control_tx, control_rx) = bounded::<ControlMsg>(256);

        let delivered = Arc::new(AtomicU64::new(0));
        let failed_attempts = Arc::new(AtomicU64::new(0));
        let abandoned = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            retry: cfg.retry,
            transport,
            registry,
            delivered: Arc::clone(&delivered),
            failed_attempts: Arc::clone(&failed_attempts),
            abandoned: Arc::clone(&abandoned),
            pending: BinaryHeap::new(),
            next_ticket: 0,
        };
        let join = thread::Builder::new()
            .name("triplecast-delivery".to_string())
            .spawn(move || worker.run(&dispatch_rx, &control_rx))
            .expect("failed to spawn triplecast delivery worker");

        Self {
            dispatch_tx,
            control_tx,
            delivered,
            failed_attempts,
            abandoned,
            dropped_dispatches: AtomicU64::new(0),
            join: Mutex::new(Some(join)),
        }
    }

    /// Sender the matcher feeds dispatches into.
    #[must_use]
    pub fn dispatch_sender(&self) -> Sender<MatchDispatch> {
        self.dispatch_tx.clone()
    }

    /// Non-blocking enqueue of one dispatch.
    pub fn enqueue(&self, dispatch: MatchDispatch) {
        match self.dispatch_tx.try_send(dispatch) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped_dispatches.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drops every pending retry for the subscription. Observed by the
    /// worker within one loop iteration.
    pub fn cancel(&self, subscription_id: SubscriptionId) {
        let _ = self.control_tx.try_send(ControlMsg::Cancel { subscription_id });
    }

    /// Successful deliveries.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Failed attempts (including ones that will be retried).
    #[must_use]
    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts.load(Ordering::Relaxed)
    }

    /// Events given up on: best-effort failures plus cancelled retries.
    #[must_use]
    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// Dispatches dropped because the queue was full.
    #[must_use]
    pub fn dropped_dispatches(&self) -> u64 {
        self.dropped_dispatches.load(Ordering::Relaxed)
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        let (dummy_dispatch, _) = bounded::<MatchDispatch>(1);
        drop(std::mem::replace(&mut self.dispatch_tx, dummy_dispatch));
        let (dummy_control, _) = bounded::<ControlMsg>(1);
        drop(std::mem::replace(&mut self.control_tx, dummy_control));
        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                drop(handle);
            }
        }
    }
}

struct Worker {
    retry: RetryPolicy,
    transport: Arc<dyn Transport>,
    registry: Arc<SubscriptionRegistry>,
    delivered: Arc<AtomicU64>,
    failed_attempts: Arc<AtomicU64>,
    abandoned: Arc<AtomicU64>,
    pending: BinaryHeap<Pending>,
    next_ticket: u64,
}

/// One outcome of the worker's select, moved out of the select expression
/// so a disconnected receiver can be swapped without fighting its borrow.
enum Step {
    Dispatch(Option<MatchDispatch>),
    Control(Option<ControlMsg>),
    Tick,
}

impl Worker {
    fn run(mut self, dispatch_rx: &Receiver<MatchDispatch>, control_rx: &Receiver<ControlMsg>) {
        // A disconnected receiver is replaced with a never-ready one so the
        // select stops waking on its closed arm while the other channel is
        // still open.
        let mut dispatch_rx = dispatch_rx.clone();
        let mut control_rx = control_rx.clone();
        let mut dispatch_closed = false;
        let mut control_closed = false;

        loop {
            let step = select! {
                recv(dispatch_rx) -> msg => Step::Dispatch(msg.ok()),
                recv(control_rx) -> msg => Step::Control(msg.ok()),
                default(Duration::from_millis(20)) => Step::Tick,
            };
            match step {
                Step::Dispatch(Some(dispatch)) => self.first_attempts(dispatch),
                Step::Dispatch(None) => {
                    dispatch_closed = true;
                    dispatch_rx = never();
                }
                Step::Control(Some(ControlMsg::Cancel { subscription_id })) => {
                    self.purge(subscription_id);
                }
                Step::Control(None) => {
                    control_closed = true;
                    control_rx = never();
                }
                Step::Tick => {}
            }

            self.run_due_retries();

            if dispatch_closed && control_closed {
                break;
            }
        }
    }

    fn first_attempts(&mut self, dispatch: MatchDispatch) {
        for target in dispatch.subscription.targets.clone() {
            self.attempt(RetryJob {
                subscription: Arc::clone(&dispatch.subscription),
                target,
                event: dispatch.event.clone(),
                attempt: 1,
            });
        }
    }

    fn attempt(&mut self, job: RetryJob) {
        // Cancellation wins over any queued or retried delivery.
        if !self.registry.is_active(job.subscription.id).unwrap_or(false) {
            self.abandoned.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.transport.deliver(&job.target, &job.event) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.failed_attempts.fetch_add(1, Ordering::Relaxed);
                match job.subscription.qos.reliability {
                    Reliability::BestEffort => {
                        self.abandoned.fetch_add(1, Ordering::Relaxed);
                    }
                    Reliability::AtLeastOnce => {
                        let due = Instant::now() + self.retry.delay_for(job.attempt);
                        let ticket = self.next_ticket;
                        self.next_ticket += 1;
                        self.pending.push(Pending {
                            due,
                            ticket,
                            job: RetryJob {
                                attempt: job.attempt + 1,
                                ..job
                            },
                        });
                    }
                }
            }
        }
    }

    fn run_due_retries(&mut self) {
        let now = Instant::now();
        while self.pending.peek().is_some_and(|p| p.due <= now) {
            if let Some(pending) = self.pending.pop() {
                self.attempt(pending.job);
            }
        }
    }

    fn purge(&mut self, subscription_id: SubscriptionId) {
        let kept: Vec<Pending> = self
            .pending
            .drain()
            .filter(|p| {
                if p.job.subscription.id == subscription_id {
                    self.abandoned.fetch_add(1, Ordering::Relaxed);
                    false
                } else {
                    true
                }
            })
            .collect();
        self.pending = kept.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;

    use crate::pattern::{Binding, ConjunctivePattern, Template, TermPattern};
    use crate::registry::Qos;
    use crate::term::{Iri, Term};

    const WAIT: Duration = Duration::from_secs(3);

    /// Fails the first `fail_first` attempts, then delivers.
    struct ScriptedTransport {
        fail_first: u64,
        attempts: AtomicU64,
        delivered: Mutex<Vec<(String, u64)>>,
    }

    impl ScriptedTransport {
        fn new(fail_first: u64) -> Self {
            Self {
                fail_first,
                attempts: AtomicU64::new(0),
                delivered: Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> u64 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Transport for ScriptedTransport {
        fn deliver(
            &self,
            target: &TargetDescriptor,
            event: &MatchEvent,
        ) -> Result<(), DeliveryError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(DeliveryError::Failed {
                    target: target.to_string(),
                    reason: "scripted failure".to_string(),
                });
            }
            self.delivered
                .lock()
                .unwrap()
                .push((target.to_string(), event.seq));
            Ok(())
        }
    }

    struct Fixture {
        registry: Arc<SubscriptionRegistry>,
        transport: Arc<ScriptedTransport>,
        engine: DeliveryEngine,
    }

    fn fixture(fail_first: u64, qos: Qos) -> (Fixture, Arc<Subscription>) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let pattern = ConjunctivePattern::new(vec![Template::new(
            TermPattern::var("e"),
            TermPattern::value(Iri::new("asc:severity")),
            TermPattern::var("s"),
        )]);
        registry
            .register(pattern, vec!["cb:1".into()], qos)
            .unwrap();
        let subscription = registry.list_active().unwrap().remove(0);

        let transport = Arc::new(ScriptedTransport::new(fail_first));
        let cfg = DeliveryEngineConfig {
            retry: RetryPolicy {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                multiplier: 2.0,
            },
            ..DeliveryEngineConfig::default()
        };
        let engine = DeliveryEngine::new(
            cfg,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&registry),
        );
        (
            Fixture {
                registry,
                transport,
                engine,
            },
            subscription,
        )
    }

    fn dispatch_for(subscription: &Arc<Subscription>, seq: u64) -> MatchDispatch {
        let mut binding = Binding::new();
        binding.bind("e", Term::iri("ex:A"));
        binding.bind("s", Term::literal("high"));
        MatchDispatch {
            subscription: Arc::clone(subscription),
            event: MatchEvent {
                subscription_id: subscription.id,
                binding,
                seq,
                timestamp: Utc::now(),
            },
        }
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    #[test]
    fn successful_delivery_counts_once_per_target() {
        let (fx, subscription) = fixture(0, Qos::best_effort());
        fx.engine.enqueue(dispatch_for(&subscription, 1));

        assert!(wait_until(WAIT, || fx.engine.delivered() == 1));
        assert_eq!(fx.engine.failed_attempts(), 0);
        let delivered = fx.transport.delivered.lock().unwrap();
        assert_eq!(*delivered, vec![("cb:1".to_string(), 1)]);
    }

    #[test]
    fn best_effort_failure_makes_exactly_one_attempt() {
        let (fx, subscription) = fixture(u64::MAX, Qos::best_effort());
        fx.engine.enqueue(dispatch_for(&subscription, 1));

        assert!(wait_until(WAIT, || fx.engine.abandoned() == 1));
        // Give any stray retry a chance to show itself.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fx.transport.attempts(), 1);
        assert_eq!(fx.engine.delivered(), 0);
    }

    #[test]
    fn at_least_once_retries_until_success() {
        let (fx, subscription) = fixture(2, Qos::at_least_once());
        fx.engine.enqueue(dispatch_for(&subscription, 1));

        assert!(wait_until(WAIT, || fx.engine.delivered() == 1));
        assert_eq!(fx.transport.attempts(), 3);
        assert_eq!(fx.engine.failed_attempts(), 2);
        assert_eq!(fx.engine.abandoned(), 0);
    }

    #[test]
    fn cancel_purges_pending_retries() {
        let (fx, subscription) = fixture(u64::MAX, Qos::at_least_once());
        fx.engine.enqueue(dispatch_for(&subscription, 1));

        assert!(wait_until(WAIT, || fx.engine.failed_attempts() >= 1));
        fx.registry.unregister(subscription.id).unwrap();
        fx.engine.cancel(subscription.id);

        assert!(wait_until(WAIT, || fx.engine.abandoned() >= 1));
        let attempts_after_cancel = fx.transport.attempts();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fx.transport.attempts(), attempts_after_cancel);
        assert_eq!(fx.engine.delivered(), 0);
    }

    #[test]
    fn worker_finishes_retries_after_dispatch_channel_closes() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let pattern = ConjunctivePattern::new(vec![Template::new(
            TermPattern::var("e"),
            TermPattern::value(Iri::new("asc:severity")),
            TermPattern::var("s"),
        )]);
        registry
            .register(pattern, vec!["cb:1".into()], Qos::at_least_once())
            .unwrap();
        let subscription = registry.list_active().unwrap().remove(0);

        let transport = Arc::new(ScriptedTransport::new(1));
        let delivered = Arc::new(AtomicU64::new(0));
        let worker = Worker {
            retry: RetryPolicy {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                multiplier: 2.0,
            },
            transport: Arc::clone(&transport) as Arc<dyn Transport>,
            registry: Arc::clone(&registry),
            delivered: Arc::clone(&delivered),
            failed_attempts: Arc::new(AtomicU64::new(0)),
            abandoned: Arc::new(AtomicU64::new(0)),
            pending: BinaryHeap::new(),
            next_ticket: 0,
        };
        let (dispatch_tx, dispatch_rx) = bounded::<MatchDispatch>(4);
        let (control_tx, control_rx) = bounded::<ControlMsg>(4);
        let handle = thread::spawn(move || worker.run(&dispatch_rx, &control_rx));

        // First attempt fails and schedules a retry; closing the dispatch
        // side must not stop the worker from completing it.
        dispatch_tx.send(dispatch_for(&subscription, 1)).unwrap();
        drop(dispatch_tx);

        assert!(wait_until(WAIT, || delivered.load(Ordering::Relaxed) == 1));
        assert_eq!(transport.attempts(), 2);

        // Control traffic still flows, and the worker exits once both
        // channels are gone.
        control_tx
            .send(ControlMsg::Cancel {
                subscription_id: SubscriptionId::new(),
            })
            .unwrap();
        drop(control_tx);
        handle.join().unwrap();
    }

    #[test]
    fn retry_policy_backs_off_exponentially_to_the_cap() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(4), Duration::from_secs(4));
        assert_eq!(policy.delay_for(30), Duration::from_secs(60));
    }
}
