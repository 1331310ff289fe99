//! Abstract fact-store contract.
//!
//! Backends must be safe for concurrent use: inserts of disjoint facts may
//! proceed in parallel, and readers must never observe a fact in one index
//! but not another.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::StoreError;
use crate::pattern::{Binding, Template};
use crate::term::Fact;

/// A fact as committed to a store: the triple plus its insertion ordinal.
///
/// The ordinal is assigned once, increases monotonically with insertion
/// order, and is used only for deterministic sort tie-breaking. The
/// visibility flag is published after every index holds the fact, which is
/// what makes single-fact reads untearable.
#[derive(Debug)]
pub struct StoredFact {
    fact: Fact,
    ordinal: u64,
    visible: AtomicBool,
}

impl StoredFact {
    pub(crate) fn new(fact: Fact, ordinal: u64) -> Self {
        Self {
            fact,
            ordinal,
            visible: AtomicBool::new(false),
        }
    }

    /// The underlying triple.
    #[must_use]
    pub fn fact(&self) -> &Fact {
        &self.fact
    }

    /// Insertion ordinal.
    #[must_use]
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub(crate) fn publish(&self) {
        self.visible.store(true, Ordering::Release);
    }

    pub(crate) fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }
}

/// Storage contract for facts.
pub trait FactStore: Send + Sync {
    /// Inserts a batch of facts, returning the subset that was genuinely new.
    ///
    /// Duplicate facts (within the batch or against the store) are no-ops.
    /// An empty batch returns an empty vec and has no other effect.
    ///
    /// # Errors
    /// `ResourceExhausted` when the batch's new facts would exceed the
    /// backend's fact limit. The batch must be rejected whole: nothing from
    /// it becomes visible, and the store stays in its prior state.
    fn insert(&self, batch: Vec<Fact>) -> Result<Vec<Arc<StoredFact>>, StoreError>;

    /// Extends a partial binding by every visible fact matching the
    /// template, returning each extended binding with the ordinal of the
    /// fact that produced it.
    ///
    /// Must resolve through the index covering the template's bound
    /// positions with the fewest matching facts; a fully unbound template
    /// iterates the least selective index rather than any unindexed path.
    fn lookup(&self, template: &Template, seed: &Binding)
        -> Result<Vec<(Binding, u64)>, StoreError>;

    /// Number of committed facts.
    fn len(&self) -> usize;

    /// True when no facts are committed.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the exact fact is committed and visible.
    fn contains(&self, fact: &Fact) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure the trait is object-safe.
    fn _assert_fact_store_object_safe(_: &dyn FactStore) {}

    #[test]
    fn stored_fact_visibility_flag() {
        let stored = StoredFact::new(
            Fact::new("ex:A", "asc:severity", crate::term::Term::literal("high")),
            7,
        );
        assert!(!stored.is_visible());
        stored.publish();
        assert!(stored.is_visible());
        assert_eq!(stored.ordinal(), 7);
    }
}
