//! # triplecast - Continuous queries over security-advisory facts
//!
//! triplecast ingests security-advisory facts as subject-predicate-object
//! triples, answers one-shot conjunctive queries over them, and keeps
//! standing subscriptions that fire push notifications the moment a new fact
//! completes a match.
//!
//! ## Core Concepts
//!
//! - **Fact**: an immutable triple with set semantics
//! - **ConjunctivePattern**: templates + filters + ordering, evaluated to bindings
//! - **Subscription**: a standing pattern with delivery targets and QoS
//! - **MatchEvent**: one first-time binding for one subscription
//! - **TopicHub**: named alert categories mapped onto subscriptions
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use triplecast::{CastEngine, CastEngineConfig, Fact, Term, vocab};
//!
//! let engine = CastEngine::new(CastEngineConfig::default(), transport);
//!
//! let id = engine.hub().subscribe(
//!     "alerts.critical",
//!     "https://consumer.example/hook".into(),
//!     None,
//!     triplecast::Reliability::AtLeastOnce,
//! )?;
//!
//! engine.insert(vec![
//!     Fact::new("data:exploit/7", vocab::SEVERITY, Term::literal("critical")),
//! ])?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod pattern;
pub mod term;
pub mod vocab;

// Storage and evaluation
pub mod eval;
pub mod store;

// Standing queries and push delivery
pub mod delivery;
pub mod hub;
pub mod matcher;
pub mod registry;

// Façade
pub mod engine;

// Re-export primary types at crate root for convenience
pub use delivery::{DeliveryEngine, DeliveryEngineConfig, RetryPolicy, Transport};
pub use engine::{CastEngine, CastEngineConfig, EngineStats};
pub use error::{CastError, CastResult, DeliveryError, PatternError, StoreError};
pub use eval::PatternEvaluator;
pub use hub::{Lease, TopicHub, TopicSpec, DEFAULT_LEASE_SECONDS};
pub use matcher::{MatchDispatch, MatchEvent, MatchSystem, MatchSystemConfig};
pub use pattern::{
    Binding, CompareOp, ConjunctivePattern, FilterExpr, OrderBy, SortDirection, Template,
    TemplateShape, TermPattern,
};
pub use registry::{
    Qos, Reliability, Subscription, SubscriptionId, SubscriptionRegistry, TargetDescriptor,
};
pub use store::{FactStore, FactStoreConfig, InMemoryFactStore, StoredFact};
pub use term::{Fact, Iri, Literal, Term};
