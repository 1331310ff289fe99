//! Standing-subscription registry.
//!
//! Holds active subscriptions and a reverse index from template shapes to
//! subscription ids, so the matcher can go from a freshly inserted fact to
//! the handful of subscriptions whose patterns could possibly gain a new
//! binding, without scanning every registration.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CastResult, StoreError};
use crate::pattern::{ConjunctivePattern, TemplateShape};
use crate::term::Fact;

/// Identifier of one standing subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Generates a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque delivery-target descriptor, interpreted only by transports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetDescriptor(String);

impl TargetDescriptor {
    #[must_use]
    pub fn new(descriptor: impl Into<String>) -> Self {
        Self(descriptor.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetDescriptor {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Delivery reliability a subscriber asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    /// One delivery attempt; failures are counted and dropped.
    BestEffort,
    /// Retried with exponential backoff until delivered or cancelled.
    AtLeastOnce,
}

/// Per-subscription quality-of-service parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qos {
    /// Delivery reliability.
    pub reliability: Reliability,

    /// How many distinct delivered bindings the matcher remembers for dedup.
    ///
    /// When the window overflows, the oldest fingerprint is forgotten and a
    /// re-derivation of that binding fires again. Depth 0 disables dedup
    /// entirely.
    pub history_depth: usize,

    /// Absolute expiry; expired subscriptions stop matching and delivering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Qos {
    /// Default dedup window depth.
    pub const DEFAULT_HISTORY_DEPTH: usize = 1024;

    /// Best-effort delivery with default history depth, no expiry.
    #[must_use]
    pub fn best_effort() -> Self {
        Self {
            reliability: Reliability::BestEffort,
            history_depth: Self::DEFAULT_HISTORY_DEPTH,
            expires_at: None,
        }
    }

    /// At-least-once delivery with default history depth, no expiry.
    #[must_use]
    pub fn at_least_once() -> Self {
        Self {
            reliability: Reliability::AtLeastOnce,
            history_depth: Self::DEFAULT_HISTORY_DEPTH,
            expires_at: None,
        }
    }

    /// Sets the dedup window depth.
    #[must_use]
    pub fn with_history_depth(mut self, depth: usize) -> Self {
        self.history_depth = depth;
        self
    }

    /// Sets an absolute expiry instant.
    #[must_use]
    pub fn with_expiry(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

impl Default for Qos {
    fn default() -> Self {
        Self::best_effort()
    }
}

/// One registered standing query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Registry-assigned id.
    pub id: SubscriptionId,
    /// The standing pattern.
    pub pattern: ConjunctivePattern,
    /// Where matches go.
    pub targets: Vec<TargetDescriptor>,
    /// Reliability, dedup window, expiry.
    pub qos: Qos,
    /// Registration instant.
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// True when the subscription has passed its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.qos.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct RegistryState {
    subscriptions: HashMap<SubscriptionId, Arc<Subscription>>,
    // Shape -> (subscription, index of the template with that shape).
    by_shape: HashMap<TemplateShape, Vec<(SubscriptionId, usize)>>,
}

impl RegistryState {
    fn remove(&mut self, id: SubscriptionId) -> bool {
        let Some(subscription) = self.subscriptions.remove(&id) else {
            return false;
        };
        for template in &subscription.pattern.templates {
            if let Some(entries) = self.by_shape.get_mut(&template.shape()) {
                entries.retain(|(sid, _)| *sid != id);
                if entries.is_empty() {
                    self.by_shape.remove(&template.shape());
                }
            }
        }
        true
    }
}

/// Thread-safe registry of standing subscriptions.
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Registers a standing query against the given targets.
    ///
    /// # Errors
    /// `InvalidPattern` when the pattern fails validation; nothing is
    /// registered in that case.
    pub fn register(
        &self,
        pattern: ConjunctivePattern,
        targets: Vec<TargetDescriptor>,
        qos: Qos,
    ) -> CastResult<SubscriptionId> {
        pattern.validate()?;

        let id = SubscriptionId::new();
        let subscription = Arc::new(Subscription {
            id,
            pattern,
            targets,
            qos,
            created_at: Utc::now(),
        });

        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::Poisoned { context: "subscription registry" })?;
        for (index, template) in subscription.pattern.templates.iter().enumerate() {
            state
                .by_shape
                .entry(template.shape())
                .or_default()
                .push((id, index));
        }
        state.subscriptions.insert(id, subscription);
        Ok(id)
    }

    /// Removes a subscription. Unknown ids are a no-op; returns whether
    /// anything was removed.
    ///
    /// # Errors
    /// Only on lock poisoning.
    pub fn unregister(&self, id: SubscriptionId) -> CastResult<bool> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::Poisoned { context: "subscription registry" })?;
        Ok(state.remove(id))
    }

    /// True when the id refers to a live, unexpired subscription.
    ///
    /// # Errors
    /// Only on lock poisoning.
    pub fn is_active(&self, id: SubscriptionId) -> CastResult<bool> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::Poisoned { context: "subscription registry" })?;
        Ok(state
            .subscriptions
            .get(&id)
            .is_some_and(|s| !s.is_expired(Utc::now())))
    }

    /// Snapshot of live subscriptions, lazily dropping expired ones.
    ///
    /// # Errors
    /// Only on lock poisoning.
    pub fn list_active(&self) -> CastResult<Vec<Arc<Subscription>>> {
        self.sweep_expired()?;
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::Poisoned { context: "subscription registry" })?;
        let mut active: Vec<Arc<Subscription>> = state.subscriptions.values().cloned().collect();
        active.sort_by_key(|s| (s.created_at, s.id));
        Ok(active)
    }

    /// Subscriptions whose pattern contains a template that could unify with
    /// the fact, each paired with the matching template's index.
    ///
    /// The shape index over-approximates on concrete subject/object values
    /// (the shape records only that a position is concrete, not which term);
    /// the matcher's seeded unification rejects those. Expired entries are
    /// filtered here and swept opportunistically.
    ///
    /// # Errors
    /// Only on lock poisoning.
    pub fn candidates_for_fact(
        &self,
        fact: &Fact,
    ) -> CastResult<Vec<(Arc<Subscription>, usize)>> {
        let now = Utc::now();
        let mut expired = Vec::new();
        let mut candidates = Vec::new();
        {
            let state = self
                .state
                .read()
                .map_err(|_| StoreError::Poisoned { context: "subscription registry" })?;
            for predicate in [Some(fact.predicate.clone()), None] {
                for subject_bound in [false, true] {
                    for object_bound in [false, true] {
                        let shape = TemplateShape {
                            predicate: predicate.clone(),
                            subject_bound,
                            object_bound,
                        };
                        let Some(entries) = state.by_shape.get(&shape) else {
                            continue;
                        };
                        for &(id, template_index) in entries {
                            let Some(subscription) = state.subscriptions.get(&id) else {
                                continue;
                            };
                            if subscription.is_expired(now) {
                                expired.push(id);
                                continue;
                            }
                            candidates.push((Arc::clone(subscription), template_index));
                        }
                    }
                }
            }
        }

        if !expired.is_empty() {
            let mut state = self
                .state
                .write()
                .map_err(|_| StoreError::Poisoned { context: "subscription registry" })?;
            for id in expired {
                state.remove(id);
            }
        }
        Ok(candidates)
    }

    fn sweep_expired(&self) -> CastResult<()> {
        let now = Utc::now();
        let expired: Vec<SubscriptionId> = {
            let state = self
                .state
                .read()
                .map_err(|_| StoreError::Poisoned { context: "subscription registry" })?;
            state
                .subscriptions
                .values()
                .filter(|s| s.is_expired(now))
                .map(|s| s.id)
                .collect()
        };
        if !expired.is_empty() {
            let mut state = self
                .state
                .write()
                .map_err(|_| StoreError::Poisoned { context: "subscription registry" })?;
            for id in expired {
                state.remove(id);
            }
        }
        Ok(())
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
