//! In-memory sharded fact store.
//!
//! Indexes are split across shards keyed by subject, predicate, and object
//! hashes. An insert takes write locks only on the three buckets the fact
//! touches, one at a time in a fixed order, so inserts of facts with
//! disjoint subjects and predicates proceed in parallel. Visibility is
//! published per fact after all three buckets hold it; readers skip
//! unpublished entries, so a concurrent reader sees a fact everywhere or
//! nowhere.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::StoreError;
use crate::pattern::{Binding, Template, TermPattern};
use crate::store::traits::{FactStore, StoredFact};
use crate::term::{Fact, Iri, Term};

fn lock_err(context: &'static str) -> StoreError {
    StoreError::Poisoned { context }
}

fn shard_of<T: Hash>(key: &T, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % shards
}

/// Configuration for [`InMemoryFactStore`].
#[derive(Debug, Clone)]
pub struct FactStoreConfig {
    /// Shard count per index family. More shards, less insert contention.
    pub shards: usize,
    /// Maximum number of committed facts. A batch whose new facts would
    /// exceed the limit fails whole with `ResourceExhausted`; nothing from
    /// it is committed.
    pub max_facts: usize,
}

impl Default for FactStoreConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            max_facts: usize::MAX,
        }
    }
}

#[derive(Debug, Default)]
struct SubjectShard {
    /// Canonical set; owns dedup and fully-bound lookups.
    spo: HashMap<Fact, Arc<StoredFact>>,
    by_s: HashMap<Iri, Vec<Arc<StoredFact>>>,
    by_sp: HashMap<(Iri, Iri), Vec<Arc<StoredFact>>>,
}

#[derive(Debug, Default)]
struct PredicateShard {
    by_p: HashMap<Iri, Vec<Arc<StoredFact>>>,
    by_po: HashMap<(Iri, Term), Vec<Arc<StoredFact>>>,
}

#[derive(Debug, Default)]
struct ObjectShard {
    by_o: HashMap<Term, Vec<Arc<StoredFact>>>,
}

/// Thread-safe in-memory fact store with per-bucket locking.
#[derive(Debug)]
pub struct InMemoryFactStore {
    cfg: FactStoreConfig,
    subjects: Vec<RwLock<SubjectShard>>,
    predicates: Vec<RwLock<PredicateShard>>,
    objects: Vec<RwLock<ObjectShard>>,
    next_ordinal: AtomicU64,
    committed: AtomicUsize,
    /// Capacity reservations taken before a batch commits anything.
    admitted: AtomicUsize,
}

impl Default for InMemoryFactStore {
    fn default() -> Self {
        Self::new(FactStoreConfig::default())
    }
}

impl InMemoryFactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(cfg: FactStoreConfig) -> Self {
        let shards = cfg.shards.max(1);
        Self {
            cfg: FactStoreConfig { shards, ..cfg },
            subjects: (0..shards).map(|_| RwLock::default()).collect(),
            predicates: (0..shards).map(|_| RwLock::default()).collect(),
            objects: (0..shards).map(|_| RwLock::default()).collect(),
            next_ordinal: AtomicU64::new(0),
            committed: AtomicUsize::new(0),
            admitted: AtomicUsize::new(0),
        }
    }

    fn subject_shard(&self, subject: &Iri) -> &RwLock<SubjectShard> {
        &self.subjects[shard_of(subject, self.cfg.shards)]
    }

    fn predicate_shard(&self, predicate: &Iri) -> &RwLock<PredicateShard> {
        &self.predicates[shard_of(predicate, self.cfg.shards)]
    }

    fn object_shard(&self, object: &Term) -> &RwLock<ObjectShard> {
        &self.objects[shard_of(object, self.cfg.shards)]
    }

    /// Reserves capacity for `count` new facts, or fails without touching
    /// any index. Admission happens before a batch commits anything, so a
    /// batch that cannot fit is rejected whole.
    fn admit(&self, count: usize) -> Result<(), StoreError> {
        if count == 0 {
            return Ok(());
        }
        self.admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                match taken.checked_add(count) {
                    Some(total) if total <= self.cfg.max_facts => Some(total),
                    _ => None,
                }
            })
            .map(|_| ())
            .map_err(|_| StoreError::ResourceExhausted {
                limit: self.cfg.max_facts,
            })
    }

    /// Commits one admitted fact. Returns `None` when the fact was already
    /// present.
    fn commit(&self, fact: Fact) -> Result<Option<Arc<StoredFact>>, StoreError> {
        // Bucket order is fixed (subject, predicate, object) and locks are
        // never held across buckets, so disjoint inserts cannot deadlock.
        let stored = {
            let mut shard = self
                .subject_shard(&fact.subject)
                .write()
                .map_err(|_| lock_err("store.insert.subject"))?;
            if shard.spo.contains_key(&fact) {
                return Ok(None);
            }
            let ordinal = self.next_ordinal.fetch_add(1, Ordering::Relaxed);
            let stored = Arc::new(StoredFact::new(fact.clone(), ordinal));
            shard.spo.insert(fact.clone(), Arc::clone(&stored));
            shard
                .by_s
                .entry(fact.subject.clone())
                .or_default()
                .push(Arc::clone(&stored));
            shard
                .by_sp
                .entry((fact.subject.clone(), fact.predicate.clone()))
                .or_default()
                .push(Arc::clone(&stored));
            stored
        };

        {
            let mut shard = self
                .predicate_shard(&fact.predicate)
                .write()
                .map_err(|_| lock_err("store.insert.predicate"))?;
            shard
                .by_p
                .entry(fact.predicate.clone())
                .or_default()
                .push(Arc::clone(&stored));
            shard
                .by_po
                .entry((fact.predicate.clone(), fact.object.clone()))
                .or_default()
                .push(Arc::clone(&stored));
        }

        {
            let mut shard = self
                .object_shard(&fact.object)
                .write()
                .map_err(|_| lock_err("store.insert.object"))?;
            shard
                .by_o
                .entry(fact.object.clone())
                .or_default()
                .push(Arc::clone(&stored));
        }

        stored.publish();
        self.committed.fetch_add(1, Ordering::Release);
        Ok(Some(stored))
    }

    fn resolved(pattern: &TermPattern, seed: &Binding) -> Option<Term> {
        match pattern {
            TermPattern::Value { term } => Some(term.clone()),
            TermPattern::Var { name } => seed.get(name).cloned(),
        }
    }

    fn as_iri(term: Option<Term>) -> Result<Option<Iri>, ()> {
        match term {
            None => Ok(None),
            Some(Term::Iri(iri)) => Ok(Some(iri)),
            // A literal can never occupy a subject or predicate position.
            Some(Term::Literal(_)) => Err(()),
        }
    }

    fn candidates_by_s(&self, s: &Iri) -> Result<Vec<Arc<StoredFact>>, StoreError> {
        let shard = self
            .subject_shard(s)
            .read()
            .map_err(|_| lock_err("store.lookup.by_s"))?;
        Ok(shard.by_s.get(s).cloned().unwrap_or_default())
    }

    fn candidates_by_o(&self, o: &Term) -> Result<Vec<Arc<StoredFact>>, StoreError> {
        let shard = self
            .object_shard(o)
            .read()
            .map_err(|_| lock_err("store.lookup.by_o"))?;
        Ok(shard.by_o.get(o).cloned().unwrap_or_default())
    }

    /// Gathers candidate facts through the cheapest covering index.
    fn candidates(
        &self,
        s: Option<&Iri>,
        p: Option<&Iri>,
        o: Option<&Term>,
    ) -> Result<Vec<Arc<StoredFact>>, StoreError> {
        match (s, p, o) {
            (Some(s), Some(p), Some(o)) => {
                let fact = Fact::new(s.clone(), p.clone(), o.clone());
                let shard = self
                    .subject_shard(s)
                    .read()
                    .map_err(|_| lock_err("store.lookup.spo"))?;
                Ok(shard.spo.get(&fact).cloned().into_iter().collect())
            }
            (Some(s), Some(p), None) => {
                let shard = self
                    .subject_shard(s)
                    .read()
                    .map_err(|_| lock_err("store.lookup.by_sp"))?;
                Ok(shard
                    .by_sp
                    .get(&(s.clone(), p.clone()))
                    .cloned()
                    .unwrap_or_default())
            }
            (Some(s), None, Some(o)) => {
                // No composite subject+object index: estimate both covering
                // single-position indexes by cardinality and scan the
                // smaller; unification post-filters the other position.
                let s_count = self
                    .subject_shard(s)
                    .read()
                    .map_err(|_| lock_err("store.lookup.so"))?
                    .by_s
                    .get(s)
                    .map_or(0, Vec::len);
                let o_count = self
                    .object_shard(o)
                    .read()
                    .map_err(|_| lock_err("store.lookup.so"))?
                    .by_o
                    .get(o)
                    .map_or(0, Vec::len);
                if s_count <= o_count {
                    self.candidates_by_s(s)
                } else {
                    self.candidates_by_o(o)
                }
            }
            (Some(s), None, None) => self.candidates_by_s(s),
            (None, Some(p), Some(o)) => {
                let shard = self
                    .predicate_shard(p)
                    .read()
                    .map_err(|_| lock_err("store.lookup.by_po"))?;
                Ok(shard
                    .by_po
                    .get(&(p.clone(), o.clone()))
                    .cloned()
                    .unwrap_or_default())
            }
            (None, Some(p), None) => {
                let shard = self
                    .predicate_shard(p)
                    .read()
                    .map_err(|_| lock_err("store.lookup.by_p"))?;
                Ok(shard.by_p.get(p).cloned().unwrap_or_default())
            }
            (None, None, Some(o)) => self.candidates_by_o(o),
            (None, None, None) => {
                // Degenerate full scan: walk the canonical sets shard by
                // shard. Still an index walk, never an unindexed side list.
                let mut out = Vec::new();
                for shard in &self.subjects {
                    let shard = shard.read().map_err(|_| lock_err("store.lookup.scan"))?;
                    out.extend(shard.spo.values().cloned());
                }
                Ok(out)
            }
        }
    }
}

impl FactStore for InMemoryFactStore {
    fn insert(&self, batch: Vec<Fact>) -> Result<Vec<Arc<StoredFact>>, StoreError> {
        let mut seen: HashSet<Fact> = HashSet::with_capacity(batch.len());
        let mut new_facts = Vec::new();
        for fact in batch {
            if !seen.insert(fact.clone()) {
                continue;
            }
            if !self.contains(&fact)? {
                new_facts.push(fact);
            }
        }

        self.admit(new_facts.len())?;

        let mut fresh = Vec::with_capacity(new_facts.len());
        for fact in new_facts {
            match self.commit(fact)? {
                Some(stored) => fresh.push(stored),
                // A concurrent insert committed the same fact first; hand
                // back the reservation it no longer needs.
                None => {
                    self.admitted.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
        Ok(fresh)
    }

    fn lookup(
        &self,
        template: &Template,
        seed: &Binding,
    ) -> Result<Vec<(Binding, u64)>, StoreError> {
        let Ok(s) = Self::as_iri(Self::resolved(&template.subject, seed)) else {
            return Ok(Vec::new());
        };
        let Ok(p) = Self::as_iri(Self::resolved(&template.predicate, seed)) else {
            return Ok(Vec::new());
        };
        let o = Self::resolved(&template.object, seed);

        let candidates = self.candidates(s.as_ref(), p.as_ref(), o.as_ref())?;

        let mut out = Vec::with_capacity(candidates.len());
        for stored in candidates {
            if !stored.is_visible() {
                continue;
            }
            if let Some(extended) = template.match_fact(stored.fact(), seed) {
                out.push((extended, stored.ordinal()));
            }
        }
        Ok(out)
    }

    fn len(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    fn contains(&self, fact: &Fact) -> Result<bool, StoreError> {
        let shard = self
            .subject_shard(&fact.subject)
            .read()
            .map_err(|_| lock_err("store.contains"))?;
        Ok(shard.spo.get(fact).is_some_and(|f| f.is_visible()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_store() -> InMemoryFactStore {
        InMemoryFactStore::new(FactStoreConfig {
            shards: 4,
            max_facts: usize::MAX,
        })
    }

    fn advisory_facts() -> Vec<Fact> {
        vec![
            Fact::new("ex:E7", "asc:platform", Term::literal("PHP")),
            Fact::new("ex:E7", "schema:datePublished", Term::literal("2024-01-01")),
            Fact::new("ex:E8", "asc:platform", Term::literal("Java")),
            Fact::new("ex:E8", "asc:severity", Term::literal("critical")),
        ]
    }

    #[test]
    fn insert_returns_only_new_facts() {
        let store = small_store();
        let first = store.insert(advisory_facts()).unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(store.len(), 4);

        // Re-inserting the same batch is a no-op.
        let second = store.insert(advisory_facts()).unwrap();
        assert!(second.is_empty());
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn duplicate_within_batch_commits_once() {
        let store = small_store();
        let fact = Fact::new("ex:E7", "asc:platform", Term::literal("PHP"));
        let fresh = store.insert(vec![fact.clone(), fact.clone()]).unwrap();
        assert_eq!(fresh.len(), 1);
        assert!(store.contains(&fact).unwrap());
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let store = small_store();
        assert!(store.insert(Vec::new()).unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn lookup_by_each_bound_combination() {
        let store = small_store();
        store.insert(advisory_facts()).unwrap();

        let var = |n: &str| TermPattern::var(n);
        let iri = |v: &str| TermPattern::value(Iri::new(v));
        let lit = |v: &str| TermPattern::value(Term::literal(v));

        // predicate only
        let t = Template::new(var("e"), iri("asc:platform"), var("p"));
        assert_eq!(store.lookup(&t, &Binding::new()).unwrap().len(), 2);

        // subject only
        let t = Template::new(iri("ex:E7"), var("pred"), var("v"));
        assert_eq!(store.lookup(&t, &Binding::new()).unwrap().len(), 2);

        // object only
        let t = Template::new(var("e"), var("pred"), lit("critical"));
        assert_eq!(store.lookup(&t, &Binding::new()).unwrap().len(), 1);

        // subject + predicate
        let t = Template::new(iri("ex:E7"), iri("asc:platform"), var("p"));
        let rows = store.lookup(&t, &Binding::new()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.get("p").unwrap().as_text(), "PHP");

        // predicate + object
        let t = Template::new(var("e"), iri("asc:platform"), lit("Java"));
        let rows = store.lookup(&t, &Binding::new()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.get("e").unwrap().as_text(), "ex:E8");

        // subject + object (cost-picked index, post-filtered)
        let t = Template::new(iri("ex:E8"), var("pred"), lit("critical"));
        let rows = store.lookup(&t, &Binding::new()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.get("pred").unwrap().as_text(), "asc:severity");

        // fully bound
        let t = Template::new(iri("ex:E7"), iri("asc:platform"), lit("PHP"));
        assert_eq!(store.lookup(&t, &Binding::new()).unwrap().len(), 1);

        // fully unbound degenerate scan
        let t = Template::new(var("s"), var("pred"), var("obj"));
        assert_eq!(store.lookup(&t, &Binding::new()).unwrap().len(), 4);
    }

    #[test]
    fn lookup_honors_seed_binding() {
        let store = small_store();
        store.insert(advisory_facts()).unwrap();

        let t = Template::new(
            TermPattern::var("e"),
            TermPattern::value(Iri::new("asc:platform")),
            TermPattern::var("p"),
        );
        let mut seed = Binding::new();
        seed.bind("e", Term::iri("ex:E8"));

        let rows = store.lookup(&t, &seed).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.get("p").unwrap().as_text(), "Java");
    }

    #[test]
    fn literal_in_subject_position_matches_nothing() {
        let store = small_store();
        store.insert(advisory_facts()).unwrap();
        let t = Template::new(
            TermPattern::value(Term::literal("PHP")),
            TermPattern::var("pred"),
            TermPattern::var("o"),
        );
        assert!(store.lookup(&t, &Binding::new()).unwrap().is_empty());
    }

    #[test]
    fn ordinals_increase_with_insertion_order() {
        let store = small_store();
        let fresh = store.insert(advisory_facts()).unwrap();
        for pair in fresh.windows(2) {
            assert!(pair[0].ordinal() < pair[1].ordinal());
        }
    }

    #[test]
    fn fact_limit_rejects_oversized_batch_whole() {
        let store = InMemoryFactStore::new(FactStoreConfig {
            shards: 4,
            max_facts: 2,
        });
        let err = store.insert(advisory_facts()).unwrap_err();
        assert!(matches!(err, StoreError::ResourceExhausted { limit: 2 }));
        // Nothing from the rejected batch is committed or visible.
        assert_eq!(store.len(), 0);
        for fact in advisory_facts() {
            assert!(!store.contains(&fact).unwrap());
        }

        // A batch that fits still goes through afterwards.
        let two = advisory_facts().into_iter().take(2).collect::<Vec<_>>();
        assert_eq!(store.insert(two.clone()).unwrap().len(), 2);
        assert_eq!(store.len(), 2);

        // Re-inserting committed facts at the limit stays a no-op.
        assert!(store.insert(two).unwrap().is_empty());
        assert_eq!(store.len(), 2);

        // One more new fact is over the limit again.
        let extra = vec![Fact::new("ex:E9", "asc:severity", Term::literal("low"))];
        let err = store.insert(extra).unwrap_err();
        assert!(matches!(err, StoreError::ResourceExhausted { limit: 2 }));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn concurrent_disjoint_inserts_commit_everything() {
        let store = Arc::new(small_store());
        let mut handles = Vec::new();
        for t in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    store
                        .insert(vec![Fact::new(
                            format!("ex:T{t}-{i}"),
                            "asc:severity",
                            Term::literal("high"),
                        )])
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 200);

        let t = Template::new(
            TermPattern::var("e"),
            TermPattern::value(Iri::new("asc:severity")),
            TermPattern::value(Term::literal("high")),
        );
        assert_eq!(store.lookup(&t, &Binding::new()).unwrap().len(), 200);
    }
}
