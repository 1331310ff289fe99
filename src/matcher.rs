//! Incremental match worker.
//!
//! This module owns the standing-query evaluation that runs on every fact
//! insertion. Commits enqueue the batch on a bounded channel and never block
//! the caller; a dedicated worker walks each fact's candidate subscriptions
//! (via the registry's shape index), re-evaluates each candidate pattern
//! seeded with the new fact, and emits one `MatchEvent` per first-time
//! binding.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::eval::PatternEvaluator;
use crate::pattern::Binding;
use crate::registry::{Subscription, SubscriptionId, SubscriptionRegistry};
use crate::store::{FactStore, StoredFact};

/// One notification: a subscription gained a new satisfying binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEvent {
    /// Which subscription matched.
    pub subscription_id: SubscriptionId,
    /// The new satisfying binding.
    pub binding: Binding,
    /// Per-subscription monotonic sequence number, starting at 1. Receivers
    /// can dedup retried deliveries on (subscription_id, seq).
    pub seq: u64,
    /// When the match was detected.
    pub timestamp: DateTime<Utc>,
}

/// A match event paired with the subscription it belongs to, as handed to
/// the delivery engine.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct MatchDispatch {
    pub subscription: Arc<Subscription>,
    pub event: MatchEvent,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct MatchSystemConfig {
    /// Max queued fact batches before backpressure applies.
    pub observation_queue_capacity: usize,
}

impl Default for MatchSystemConfig {
    fn default() -> Self {
        Self {
            observation_queue_capacity: 4096,
        }
    }
}

struct ObserveMsg {
    batch: Vec<Arc<StoredFact>>,
}

/// Dedup window plus sequence counter for one subscription.
struct SubscriptionState {
    seen: HashSet<[u8; 32]>,
    order: VecDeque<[u8; 32]>,
    next_seq: u64,
}

impl SubscriptionState {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            next_seq: 1,
        }
    }

    /// True when the fingerprint is still in the dedup window. A zero depth
    /// keeps no memory, so everything counts as first-time.
    fn seen_recently(&self, fingerprint: &[u8; 32], depth: usize) -> bool {
        depth > 0 && self.seen.contains(fingerprint)
    }

    /// Records an emitted fingerprint, evicting the oldest past the window.
    /// Callers record only after the event is handed off, so a failed
    /// hand-off leaves the binding eligible to fire later.
    fn record(&mut self, fingerprint: [u8; 32], depth: usize) {
        if depth == 0 || !self.seen.insert(fingerprint) {
            return;
        }
        self.order.push_back(fingerprint);
        while self.order.len() > depth {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

/// Incremental matcher: owns the match worker thread.
///
/// Observations are enqueued with non-blocking `try_send`; a full queue
/// increments the drop counter instead of stalling ingestion.
pub struct MatchSystem {
    observe_tx: Sender<ObserveMsg>,
    dropped_observations: AtomicU64,
    dropped_events: Arc<AtomicU64>,
    matched_events: Arc<AtomicU64>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl MatchSystem {
    #[must_use]
    pub fn new(
        cfg: &MatchSystemConfig,
        store: Arc<dyn FactStore>,
        registry: Arc<SubscriptionRegistry>,
        dispatch_tx: Sender<MatchDispatch>,
    ) -> Self {
        let (observe_tx, observe_rx) =
            bounded::<ObserveMsg>(cfg.observation_queue_capacity.max(1));

        let dropped_events = Arc::new(AtomicU64::new(0));
        let matched_events = Arc::new(AtomicU64::new(0));

        let evaluator = PatternEvaluator::new(store);
        let thread_dropped = Arc::clone(&dropped_events);
        let thread_matched = Arc::clone(&matched_events);
        let join = thread::Builder::new()
            .name("triplecast-matcher".to_string())
            .spawn(move || {
                worker_loop(
                    &evaluator,
                    &registry,
                    &dispatch_tx,
                    &thread_dropped,
                    &thread_matched,
                    &observe_rx,
                );
            })
            .expect("failed to spawn triplecast match worker");

        Self {
            observe_tx,
            dropped_observations: AtomicU64::new(0),
            dropped_events,
            matched_events,
            join: Mutex::new(Some(join)),
        }
    }

    /// Non-blocking enqueue of a committed fact batch.
    ///
    /// Callers must only pass facts that are already visible in the store;
    /// the worker sees the batch as a unit, so a pattern joining across two
    /// facts of the same batch fires exactly once.
    pub fn observe(&self, batch: Vec<Arc<StoredFact>>) {
        if batch.is_empty() {
            return;
        }
        match self.observe_tx.try_send(ObserveMsg { batch }) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped_observations.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Fact batches dropped because the observation queue was full.
    #[must_use]
    pub fn dropped_observations(&self) -> u64 {
        self.dropped_observations.load(Ordering::Relaxed)
    }

    /// Match events dropped because the delivery channel shut down.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Match events emitted to the delivery engine.
    #[must_use]
    pub fn matched_events(&self) -> u64 {
        self.matched_events.load(Ordering::Relaxed)
    }
}

impl Drop for MatchSystem {
    fn drop(&mut self) {
        // Close the channel so the worker terminates, then detach; the
        // worker exits once the last sender is dropped.
        let (dummy_tx, _) = bounded::<ObserveMsg>(1);
        drop(std::mem::replace(&mut self.observe_tx, dummy_tx));
        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                drop(handle);
            }
        }
    }
}

fn worker_loop(
    evaluator: &PatternEvaluator,
    registry: &SubscriptionRegistry,
    dispatch_tx: &Sender<MatchDispatch>,
    dropped_events: &AtomicU64,
    matched_events: &AtomicU64,
    observe_rx: &Receiver<ObserveMsg>,
) {
    let mut states: HashMap<SubscriptionId, SubscriptionState> = HashMap::new();

    loop {
        select! {
            recv(observe_rx) -> msg => {
                match msg {
                    Ok(ObserveMsg { batch }) => {
                        process_batch(
                            evaluator,
                            registry,
                            dispatch_tx,
                            dropped_events,
                            matched_events,
                            &mut states,
                            &batch,
                        );
                    }
                    Err(_) => break,
                }
            }
            default(Duration::from_millis(50)) => {
                // Periodic cleanup: forget dedup state for dead subscriptions.
                states.retain(|id, _| registry.is_active(*id).unwrap_or(false));
            }
        }
    }
}

fn process_batch(
    evaluator: &PatternEvaluator,
    registry: &SubscriptionRegistry,
    dispatch_tx: &Sender<MatchDispatch>,
    dropped_events: &AtomicU64,
    matched_events: &AtomicU64,
    states: &mut HashMap<SubscriptionId, SubscriptionState>,
    batch: &[Arc<StoredFact>],
) {
    for stored in batch {
        let Ok(candidates) = registry.candidates_for_fact(stored.fact()) else {
            // Registry errors fail closed: no event.
            continue;
        };

        for (subscription, template_index) in candidates {
            let template = &subscription.pattern.templates[template_index];
            let Some(seed) = template.match_fact(stored.fact(), &Binding::new()) else {
                // Shape index over-approximates; concrete positions decide here.
                continue;
            };

            let Ok(bindings) = evaluator.evaluate_seeded(
                &subscription.pattern,
                template_index,
                seed,
                stored.ordinal(),
            ) else {
                continue;
            };
            if bindings.is_empty() {
                continue;
            }

            let state = states
                .entry(subscription.id)
                .or_insert_with(SubscriptionState::new);
            for binding in bindings {
                let fingerprint = binding.fingerprint();
                if state.seen_recently(&fingerprint, subscription.qos.history_depth) {
                    continue;
                }
                // Cancellation must win over an in-flight match.
                if !registry.is_active(subscription.id).unwrap_or(false) {
                    break;
                }

                let event = MatchEvent {
                    subscription_id: subscription.id,
                    binding,
                    seq: state.next_seq,
                    timestamp: Utc::now(),
                };
                let dispatch = MatchDispatch {
                    subscription: Arc::clone(&subscription),
                    event,
                };
                // Block until delivery takes the event; the fingerprint and
                // sequence advance only on a confirmed hand-off, so a full
                // queue delays a match instead of losing it. Ingestion stays
                // non-blocking behind the observation queue.
                match dispatch_tx.send(dispatch) {
                    Ok(()) => {
                        state.record(fingerprint, subscription.qos.history_depth);
                        state.next_seq += 1;
                        matched_events.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        dropped_events.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }
}
