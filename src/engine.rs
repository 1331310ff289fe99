//! Engine façade.
//!
//! Wires the store, registry, matcher, delivery engine, and topic hub into
//! one object. Ingestion commits a batch to the store, then hands the whole
//! batch to the matcher, so a pattern joining across two facts of one batch
//! fires once rather than per fact.

use std::sync::Arc;

use crate::delivery::{DeliveryEngine, DeliveryEngineConfig, Transport};
use crate::error::CastResult;
use crate::eval::PatternEvaluator;
use crate::hub::TopicHub;
use crate::matcher::{MatchSystem, MatchSystemConfig};
use crate::pattern::{Binding, ConjunctivePattern};
use crate::registry::{Qos, SubscriptionId, SubscriptionRegistry, TargetDescriptor};
use crate::store::{FactStore, FactStoreConfig, InMemoryFactStore};
use crate::term::Fact;

#[allow(missing_docs)]
#[derive(Debug, Clone, Default)]
pub struct CastEngineConfig {
    pub store: FactStoreConfig,
    pub matcher: MatchSystemConfig,
    pub delivery: DeliveryEngineConfig,
}

/// Counter snapshot across the engine's workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Facts currently committed.
    pub facts: usize,
    /// Match events handed to delivery.
    pub matched_events: u64,
    /// Fact batches dropped at the matcher queue.
    pub dropped_observations: u64,
    /// Match events dropped because delivery shut down.
    pub dropped_events: u64,
    /// Successful deliveries.
    pub delivered: u64,
    /// Failed delivery attempts (including retried ones).
    pub failed_attempts: u64,
    /// Deliveries given up on.
    pub abandoned: u64,
}

/// The continuous-query engine: ingest facts, run one-shot queries, hold
/// standing subscriptions, push matches.
pub struct CastEngine {
    store: Arc<dyn FactStore>,
    registry: Arc<SubscriptionRegistry>,
    evaluator: PatternEvaluator,
    matcher: MatchSystem,
    delivery: Arc<DeliveryEngine>,
    hub: TopicHub,
}

impl CastEngine {
    /// Builds an engine over the in-memory store.
    #[must_use]
    pub fn new(cfg: CastEngineConfig, transport: Arc<dyn Transport>) -> Self {
        let store: Arc<dyn FactStore> = Arc::new(InMemoryFactStore::new(cfg.store));
        Self::with_store(store, &cfg.matcher, cfg.delivery, transport)
    }

    /// Builds an engine over a caller-provided store backend.
    #[must_use]
    pub fn with_store(
        store: Arc<dyn FactStore>,
        matcher_cfg: &MatchSystemConfig,
        delivery_cfg: DeliveryEngineConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let delivery = Arc::new(DeliveryEngine::new(
            delivery_cfg,
            transport,
            Arc::clone(&registry),
        ));
        let matcher = MatchSystem::new(
            matcher_cfg,
            Arc::clone(&store),
            Arc::clone(&registry),
            delivery.dispatch_sender(),
        );
        let hub = TopicHub::new(Arc::clone(&registry), Arc::clone(&delivery));
        let evaluator = PatternEvaluator::new(Arc::clone(&store));
        Self {
            store,
            registry,
            evaluator,
            matcher,
            delivery,
            hub,
        }
    }

    /// Commits a batch of facts and triggers incremental matching for the
    /// genuinely new ones. Duplicates are no-ops; an empty batch does
    /// nothing. Returns how many facts were new.
    ///
    /// # Errors
    /// `ResourceExhausted` when the batch's new facts would exceed the
    /// store's fact limit. The batch is rejected whole: nothing from it
    /// becomes visible and no matching runs for it.
    pub fn insert(&self, batch: Vec<Fact>) -> CastResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        match self.store.insert(batch) {
            Ok(stored) => {
                let inserted = stored.len();
                self.matcher.observe(stored);
                Ok(inserted)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// One-shot pattern evaluation against the current store.
    ///
    /// # Errors
    /// `InvalidPattern` for malformed patterns; store errors propagate.
    pub fn query(&self, pattern: &ConjunctivePattern) -> CastResult<Vec<Binding>> {
        self.evaluator.evaluate(pattern)
    }

    /// Registers a standing subscription.
    ///
    /// # Errors
    /// `InvalidPattern` when the pattern fails validation.
    pub fn register(
        &self,
        pattern: ConjunctivePattern,
        targets: Vec<TargetDescriptor>,
        qos: Qos,
    ) -> CastResult<SubscriptionId> {
        self.registry.register(pattern, targets, qos)
    }

    /// Removes a subscription and purges its pending deliveries. Unknown
    /// ids are a no-op; returns whether anything was removed.
    ///
    /// # Errors
    /// Only on lock poisoning.
    pub fn unregister(&self, id: SubscriptionId) -> CastResult<bool> {
        let removed = self.registry.unregister(id)?;
        self.delivery.cancel(id);
        Ok(removed)
    }

    /// The topic hub bound to this engine.
    #[must_use]
    pub fn hub(&self) -> &TopicHub {
        &self.hub
    }

    /// The subscription registry.
    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            facts: self.store.len(),
            matched_events: self.matcher.matched_events(),
            dropped_observations: self.matcher.dropped_observations(),
            dropped_events: self.matcher.dropped_events(),
            delivered: self.delivery.delivered(),
            failed_attempts: self.delivery.failed_attempts(),
            abandoned: self.delivery.abandoned(),
        }
    }
}
