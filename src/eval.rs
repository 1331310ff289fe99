//! Conjunctive pattern evaluation.
//!
//! The evaluator performs a left-deep join over the fact store: templates
//! are visited most-bound-first (declaration order breaks ties, which keeps
//! runs reproducible), each step extends every surviving partial binding by
//! the store's matches, and filters apply as soon as their variable is
//! bound. Final bindings are deduplicated, sorted stably with fact
//! insertion order as the tie-break, and truncated to the limit.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CastError, CastResult};
use crate::pattern::{Binding, ConjunctivePattern, SortDirection, Template};
use crate::store::FactStore;
use crate::term::Term;

/// Executes conjunctive patterns against a fact store.
pub struct PatternEvaluator {
    store: Arc<dyn FactStore>,
}

impl PatternEvaluator {
    /// Creates an evaluator over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn FactStore>) -> Self {
        Self { store }
    }

    /// Evaluates a pattern from scratch.
    ///
    /// # Errors
    /// `InvalidPattern` for empty patterns or filters/sort keys over
    /// variables no template binds; store errors propagate.
    pub fn evaluate(&self, pattern: &ConjunctivePattern) -> CastResult<Vec<Binding>> {
        pattern.validate()?;
        let order = join_order(&pattern.templates, None);
        let rows = self.join(pattern, &order, vec![(Binding::new(), 0)])?;
        Ok(finalize(pattern, rows))
    }

    /// Evaluates a pattern with one template pre-satisfied by a known fact.
    ///
    /// `seed` must be the binding produced by unifying the new fact against
    /// `pattern.templates[seed_index]`, and `seed_ordinal` that fact's store
    /// ordinal. This bounds the join's first step to the new fact, which is
    /// what keeps incremental matching proportional to pattern complexity
    /// rather than store size.
    pub fn evaluate_seeded(
        &self,
        pattern: &ConjunctivePattern,
        seed_index: usize,
        seed: Binding,
        seed_ordinal: u64,
    ) -> CastResult<Vec<Binding>> {
        pattern.validate()?;
        if seed_index >= pattern.templates.len() {
            return Err(CastError::Pattern(
                crate::error::PatternError::InvalidPattern {
                    reason: format!("seed template index {seed_index} out of range"),
                },
            ));
        }
        let order = join_order(&pattern.templates, Some(seed_index));
        let rows = self.join(pattern, &order, vec![(seed, seed_ordinal)])?;
        Ok(finalize(pattern, rows))
    }

    fn join(
        &self,
        pattern: &ConjunctivePattern,
        order: &[usize],
        mut rows: Vec<(Binding, u64)>,
    ) -> CastResult<Vec<(Binding, u64)>> {
        rows = apply_ready_filters(pattern, rows);
        for &idx in order {
            if rows.is_empty() {
                break;
            }
            let template = &pattern.templates[idx];
            let mut next = Vec::new();
            for (binding, ordinal) in rows {
                for (extended, fact_ordinal) in self.store.lookup(template, &binding)? {
                    next.push((extended, ordinal.max(fact_ordinal)));
                }
            }
            rows = apply_ready_filters(pattern, next);
        }
        Ok(rows)
    }
}

/// Visit order for templates: most bound positions first, declaration order
/// on ties. The seeded template (if any) is excluded.
fn join_order(templates: &[Template], skip: Option<usize>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..templates.len())
        .filter(|i| Some(*i) != skip)
        .collect();
    order.sort_by_key(|&i| std::cmp::Reverse(templates[i].bound_positions()));
    // sort_by_key is stable, so equal bound counts keep declaration order.
    order
}

/// Drops rows failing any filter whose variable is already bound; filters
/// over still-unbound variables are deferred.
fn apply_ready_filters(
    pattern: &ConjunctivePattern,
    rows: Vec<(Binding, u64)>,
) -> Vec<(Binding, u64)> {
    if pattern.filters.is_empty() {
        return rows;
    }
    rows.into_iter()
        .filter(|(binding, _)| {
            pattern
                .filters
                .iter()
                .all(|f| f.evaluate(binding) != Some(false))
        })
        .collect()
}

/// Deduplicates, applies remaining filters, sorts, and truncates.
fn finalize(pattern: &ConjunctivePattern, rows: Vec<(Binding, u64)>) -> Vec<Binding> {
    // Validation guarantees every filter variable is declared, so after the
    // full join each filter must evaluate to Some(true).
    let mut distinct: HashMap<[u8; 32], (Binding, u64)> = HashMap::new();
    for (binding, ordinal) in rows {
        if !pattern
            .filters
            .iter()
            .all(|f| f.evaluate(&binding) == Some(true))
        {
            continue;
        }
        distinct
            .entry(binding.fingerprint())
            .and_modify(|entry| {
                if ordinal < entry.1 {
                    entry.1 = ordinal;
                }
            })
            .or_insert((binding, ordinal));
    }

    let mut out: Vec<(Binding, u64)> = distinct.into_values().collect();
    match &pattern.order_by {
        Some(order) => {
            out.sort_by(|(a, oa), (b, ob)| {
                let key = compare_terms(a.get(&order.var), b.get(&order.var));
                let key = match order.direction {
                    SortDirection::Asc => key,
                    SortDirection::Desc => key.reverse(),
                };
                key.then(oa.cmp(ob))
            });
        }
        None => out.sort_by_key(|&(_, ordinal)| ordinal),
    }

    if let Some(limit) = pattern.limit {
        out.truncate(limit);
    }
    out.into_iter().map(|(binding, _)| binding).collect()
}

/// Orders sort-key terms by class, then within class: numbers first
/// (compared numerically), then dates (chronologically), then everything
/// else (lexically by text). Missing values sort last. Partitioning by
/// class keeps the comparator transitive over mixed keys, which `sort_by`
/// requires.
fn compare_terms(a: Option<&Term>, b: Option<&Term>) -> Ordering {
    let (Some(a), Some(b)) = (a, b) else {
        return match (a, b) {
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            _ => Ordering::Equal,
        };
    };
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => match (a.as_datetime(), b.as_datetime()) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.as_text().cmp(b.as_text()),
        },
    }
}
