//! Topic hub: named alert categories over the advisory vocabulary.
//!
//! Subscribers pick a topic from the catalog instead of writing a pattern;
//! the hub maps each topic onto one standing subscription plus one delivery
//! target, with a lease that expires the subscription. Callback
//! verification handshakes happen outside this crate; the hub only records
//! the outcome via [`TopicHub::mark_verified`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use crate::delivery::DeliveryEngine;
use crate::error::{CastError, CastResult, StoreError};
use crate::pattern::{ConjunctivePattern, FilterExpr, Template, TermPattern};
use crate::registry::{Qos, Reliability, SubscriptionId, SubscriptionRegistry, TargetDescriptor};
use crate::term::{Iri, Term};
use crate::vocab;

/// Default lease length: one day.
pub const DEFAULT_LEASE_SECONDS: i64 = 86_400;

/// One catalog entry.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: &'static str,
    pub description: &'static str,
}

const CATALOG: &[TopicSpec] = &[
    TopicSpec { name: "alerts.all", description: "All security alerts" },
    TopicSpec { name: "alerts.critical", description: "Critical severity alerts" },
    TopicSpec { name: "alerts.high", description: "High severity alerts" },
    TopicSpec { name: "alerts.cms", description: "CMS vulnerabilities" },
    TopicSpec { name: "alerts.framework", description: "Framework vulnerabilities" },
    TopicSpec { name: "alerts.plugin", description: "Plugin/Module vulnerabilities" },
    TopicSpec { name: "alerts.shopping_cart", description: "Shopping cart vulnerabilities" },
    TopicSpec { name: "alerts.forum", description: "Forum software vulnerabilities" },
    TopicSpec { name: "alerts.sqli", description: "SQL Injection vulnerabilities" },
    TopicSpec { name: "alerts.xss", description: "Cross-Site Scripting vulnerabilities" },
    TopicSpec { name: "alerts.rce", description: "Remote Code Execution vulnerabilities" },
];

/// Lease state for one topic subscription.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct Lease {
    pub topic: String,
    pub callback: TargetDescriptor,
    pub expires_at: DateTime<Utc>,
    pub verified: bool,
}

/// Maps topic names onto registry subscriptions.
pub struct TopicHub {
    registry: Arc<SubscriptionRegistry>,
    delivery: Arc<DeliveryEngine>,
    leases: RwLock<HashMap<SubscriptionId, Lease>>,
}

impl TopicHub {
    #[must_use]
    pub fn new(registry: Arc<SubscriptionRegistry>, delivery: Arc<DeliveryEngine>) -> Self {
        Self {
            registry,
            delivery,
            leases: RwLock::new(HashMap::new()),
        }
    }

    /// The topic catalog.
    #[must_use]
    pub fn topics() -> &'static [TopicSpec] {
        CATALOG
    }

    /// Subscribes a callback to a topic for `lease_seconds` (default one
    /// day). Returns the id of the backing subscription.
    ///
    /// # Errors
    /// `UnknownTopic` for names outside the catalog.
    pub fn subscribe(
        &self,
        topic: &str,
        callback: TargetDescriptor,
        lease_seconds: Option<i64>,
        reliability: Reliability,
    ) -> CastResult<SubscriptionId> {
        let pattern = pattern_for(topic).ok_or_else(|| CastError::UnknownTopic {
            topic: topic.to_string(),
        })?;

        let expires_at = Utc::now()
            + Duration::seconds(lease_seconds.unwrap_or(DEFAULT_LEASE_SECONDS).max(1));
        let qos = Qos {
            reliability,
            history_depth: Qos::DEFAULT_HISTORY_DEPTH,
            expires_at: Some(expires_at),
        };

        let id = self
            .registry
            .register(pattern, vec![callback.clone()], qos)?;

        let mut leases = self
            .leases
            .write()
            .map_err(|_| StoreError::Poisoned { context: "topic hub leases" })?;
        leases.insert(
            id,
            Lease {
                topic: topic.to_string(),
                callback,
                expires_at,
                verified: false,
            },
        );
        Ok(id)
    }

    /// Tears down a topic subscription: registry entry, pending deliveries,
    /// lease. Unknown ids are a no-op; returns whether anything was removed.
    ///
    /// # Errors
    /// Only on lock poisoning.
    pub fn unsubscribe(&self, id: SubscriptionId) -> CastResult<bool> {
        let removed = self.registry.unregister(id)?;
        self.delivery.cancel(id);
        let mut leases = self
            .leases
            .write()
            .map_err(|_| StoreError::Poisoned { context: "topic hub leases" })?;
        Ok(leases.remove(&id).is_some() || removed)
    }

    /// Records that the callback passed its verification handshake.
    /// Returns false for unknown ids.
    ///
    /// # Errors
    /// Only on lock poisoning.
    pub fn mark_verified(&self, id: SubscriptionId) -> CastResult<bool> {
        let mut leases = self
            .leases
            .write()
            .map_err(|_| StoreError::Poisoned { context: "topic hub leases" })?;
        match leases.get_mut(&id) {
            Some(lease) => {
                lease.verified = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Current lease state for a subscription.
    ///
    /// # Errors
    /// Only on lock poisoning.
    pub fn lease(&self, id: SubscriptionId) -> CastResult<Option<Lease>> {
        let leases = self
            .leases
            .read()
            .map_err(|_| StoreError::Poisoned { context: "topic hub leases" })?;
        Ok(leases.get(&id).cloned())
    }
}

/// The standing pattern behind a topic name.
fn pattern_for(topic: &str) -> Option<ConjunctivePattern> {
    let severity = |value: &str| {
        ConjunctivePattern::new(vec![Template::new(
            TermPattern::var("advisory"),
            TermPattern::value(Iri::new(vocab::SEVERITY)),
            TermPattern::var("severity"),
        )])
        .with_filter(FilterExpr::CaseFoldEquals {
            var: "severity".to_string(),
            value: value.to_string(),
        })
    };
    let software_type = |value: &str| {
        ConjunctivePattern::new(vec![Template::new(
            TermPattern::var("advisory"),
            TermPattern::value(Iri::new(vocab::SOFTWARE_TYPE)),
            TermPattern::var("software_type"),
        )])
        .with_filter(FilterExpr::CaseFoldEquals {
            var: "software_type".to_string(),
            value: value.to_string(),
        })
    };
    let exploit_type = |value: &str| {
        ConjunctivePattern::new(vec![Template::new(
            TermPattern::var("advisory"),
            TermPattern::value(Iri::new(vocab::EXPLOIT_TYPE)),
            TermPattern::var("exploit_type"),
        )])
        .with_filter(FilterExpr::CaseFoldEquals {
            var: "exploit_type".to_string(),
            value: value.to_string(),
        })
    };

    match topic {
        "alerts.all" => Some(ConjunctivePattern::new(vec![Template::new(
            TermPattern::var("advisory"),
            TermPattern::value(Iri::new(vocab::TYPE)),
            TermPattern::value(Term::iri(vocab::WEB_EXPLOIT)),
        )])),
        "alerts.critical" => Some(severity("critical")),
        "alerts.high" => Some(severity("high")),
        "alerts.cms" => Some(software_type("cms")),
        "alerts.framework" => Some(software_type("framework")),
        "alerts.plugin" => Some(software_type("plugin")),
        "alerts.shopping_cart" => Some(software_type("shopping_cart")),
        "alerts.forum" => Some(software_type("forum")),
        "alerts.sqli" => Some(exploit_type("sqli")),
        "alerts.xss" => Some(exploit_type("xss")),
        "alerts.rce" => Some(exploit_type("rce")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::delivery::{DeliveryEngineConfig, Transport};
    use crate::error::DeliveryError;
    use crate::matcher::MatchEvent;
    use crate::term::Fact;

    struct NullTransport;

    impl Transport for NullTransport {
        fn deliver(&self, _: &TargetDescriptor, _: &MatchEvent) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn hub() -> (Arc<SubscriptionRegistry>, TopicHub) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let delivery = Arc::new(DeliveryEngine::new(
            DeliveryEngineConfig::default(),
            Arc::new(NullTransport),
            Arc::clone(&registry),
        ));
        let hub = TopicHub::new(Arc::clone(&registry), delivery);
        (registry, hub)
    }

    #[test]
    fn catalog_lists_every_topic_once() {
        let names: Vec<&str> = TopicHub::topics().iter().map(|t| t.name).collect();
        assert_eq!(names.len(), 11);
        assert!(names.contains(&"alerts.all"));
        assert!(names.contains(&"alerts.shopping_cart"));
        let mut dedup = names.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), names.len());
    }

    #[test]
    fn every_catalog_topic_has_a_valid_pattern() {
        for spec in TopicHub::topics() {
            let pattern = pattern_for(spec.name).unwrap();
            pattern.validate().unwrap();
        }
    }

    #[test]
    fn subscribe_unknown_topic_is_rejected() {
        let (_, hub) = hub();
        let err = hub
            .subscribe("alerts.nope", "cb:1".into(), None, Reliability::BestEffort)
            .unwrap_err();
        assert!(matches!(err, CastError::UnknownTopic { .. }));
    }

    #[test]
    fn subscribe_creates_leased_registry_entry() {
        let (registry, hub) = hub();
        let before = Utc::now();
        let id = hub
            .subscribe("alerts.critical", "cb:1".into(), Some(600), Reliability::AtLeastOnce)
            .unwrap();

        assert!(registry.is_active(id).unwrap());
        let lease = hub.lease(id).unwrap().unwrap();
        assert_eq!(lease.topic, "alerts.critical");
        assert!(!lease.verified);
        let lease_len = lease.expires_at - before;
        assert!(lease_len >= Duration::seconds(599) && lease_len <= Duration::seconds(601));

        // The backing pattern keys on the severity predicate.
        let fact = Fact::new("ex:E1", vocab::SEVERITY, Term::literal("critical"));
        assert_eq!(registry.candidates_for_fact(&fact).unwrap().len(), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let (registry, hub) = hub();
        let id = hub
            .subscribe("alerts.xss", "cb:1".into(), None, Reliability::BestEffort)
            .unwrap();

        assert!(hub.unsubscribe(id).unwrap());
        assert!(!hub.unsubscribe(id).unwrap());
        assert!(!registry.is_active(id).unwrap());
        assert!(hub.lease(id).unwrap().is_none());
    }

    #[test]
    fn mark_verified_flips_lease_state() {
        let (_, hub) = hub();
        let id = hub
            .subscribe("alerts.rce", "cb:1".into(), None, Reliability::BestEffort)
            .unwrap();

        assert!(hub.mark_verified(id).unwrap());
        assert!(hub.lease(id).unwrap().unwrap().verified);
        assert!(!hub.mark_verified(SubscriptionId::new()).unwrap());
    }
}
