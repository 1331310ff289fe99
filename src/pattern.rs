//! Conjunctive patterns: fact templates, value filters, and bindings.
//!
//! A pattern is an ordered list of templates (fact shapes with variables)
//! plus zero or more filters over the variables. Evaluating one yields
//! bindings: assignments of variables to terms. Patterns serve both one-shot
//! queries and standing subscriptions.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PatternError;
use crate::term::{Fact, Iri, Term};

/// One position of a template: a concrete term or a named variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TermPattern {
    /// A named variable (without any leading `?`).
    Var { name: String },
    /// A concrete value that the fact position must equal.
    Value { term: Term },
}

impl TermPattern {
    /// Creates a variable position.
    #[must_use]
    pub fn var(name: impl Into<String>) -> Self {
        Self::Var { name: name.into() }
    }

    /// Creates a concrete position.
    #[must_use]
    pub fn value(term: impl Into<Term>) -> Self {
        Self::Value { term: term.into() }
    }

    /// Returns true when this position is a concrete value.
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        matches!(self, Self::Value { .. })
    }

    /// The variable name, if this position is a variable.
    #[must_use]
    pub fn var_name(&self) -> Option<&str> {
        match self {
            Self::Var { name } => Some(name),
            Self::Value { .. } => None,
        }
    }

    /// Attempts to unify this position against a concrete term, extending
    /// `binding` in place. Returns false on mismatch, leaving any partial
    /// extension to the caller to discard.
    fn unify(&self, actual: &Term, binding: &mut Binding) -> bool {
        match self {
            Self::Value { term } => term == actual,
            Self::Var { name } => match binding.get(name) {
                Some(existing) => existing == actual,
                None => {
                    binding.bind(name.clone(), actual.clone());
                    true
                }
            },
        }
    }
}

/// A fact template: one pattern per position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Template {
    /// Subject position.
    pub subject: TermPattern,
    /// Predicate position.
    pub predicate: TermPattern,
    /// Object position.
    pub object: TermPattern,
}

impl Template {
    /// Creates a template.
    #[must_use]
    pub fn new(subject: TermPattern, predicate: TermPattern, object: TermPattern) -> Self {
        Self {
            subject,
            predicate,
            object,
        }
    }

    /// Number of positions bound to concrete values (0..=3).
    ///
    /// Used by the evaluator's ordering heuristic; intentionally static so
    /// that template order stays deterministic across runs.
    #[must_use]
    pub fn bound_positions(&self) -> usize {
        [&self.subject, &self.predicate, &self.object]
            .into_iter()
            .filter(|p| p.is_bound())
            .count()
    }

    /// Iterates the variable names this template introduces.
    pub fn vars(&self) -> impl Iterator<Item = &str> {
        [&self.subject, &self.predicate, &self.object]
            .into_iter()
            .filter_map(TermPattern::var_name)
    }

    /// The shape used by the registry's reverse index: the literal predicate
    /// (if any) plus which of subject/object are bound.
    #[must_use]
    pub fn shape(&self) -> TemplateShape {
        let predicate = match &self.predicate {
            TermPattern::Value {
                term: Term::Iri(iri),
            } => Some(iri.clone()),
            _ => None,
        };
        TemplateShape {
            predicate,
            subject_bound: self.subject.is_bound(),
            object_bound: self.object.is_bound(),
        }
    }

    /// Unifies this template against a fact under an existing partial
    /// binding. Returns the extended binding on success.
    #[must_use]
    pub fn match_fact(&self, fact: &Fact, binding: &Binding) -> Option<Binding> {
        let mut extended = binding.clone();
        let subject_term = Term::Iri(fact.subject.clone());
        let predicate_term = Term::Iri(fact.predicate.clone());
        if !self.subject.unify(&subject_term, &mut extended) {
            return None;
        }
        if !self.predicate.unify(&predicate_term, &mut extended) {
            return None;
        }
        if !self.object.unify(&fact.object, &mut extended) {
            return None;
        }
        Some(extended)
    }
}

/// The shape of a template for reverse-index lookup: which predicate it pins
/// (if any) and which of the other positions are concrete.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateShape {
    /// Literal predicate, or `None` for a variable predicate.
    pub predicate: Option<Iri>,
    /// Whether the subject position is concrete.
    pub subject_bound: bool,
    /// Whether the object position is concrete.
    pub object_bound: bool,
}

/// Comparison operators shared by numeric and date filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl CompareOp {
    fn holds<T: PartialOrd>(self, left: &T, right: &T) -> bool {
        match self {
            Self::Lt => left < right,
            Self::Le => left <= right,
            Self::Eq => left == right,
            Self::Ge => left >= right,
            Self::Gt => left > right,
        }
    }
}

/// A value filter over one pattern variable.
///
/// The operation set is closed: collaborators that parse a query language map
/// filter-function names onto these variants via [`FilterExpr::parse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum FilterExpr {
    /// Case-insensitive substring containment.
    Contains {
        /// Variable to test.
        var: String,
        /// Needle, matched case-insensitively.
        needle: String,
    },

    /// Numeric comparison against a constant.
    NumericCompare {
        var: String,
        op: CompareOp,
        value: f64,
    },

    /// Date comparison against a constant instant.
    DateCompare {
        var: String,
        op: CompareOp,
        value: DateTime<Utc>,
    },

    /// Case-insensitive equality with a constant string.
    CaseFoldEquals { var: String, value: String },
}

impl FilterExpr {
    /// The variable this filter references.
    #[must_use]
    pub fn var(&self) -> &str {
        match self {
            Self::Contains { var, .. }
            | Self::NumericCompare { var, .. }
            | Self::DateCompare { var, .. }
            | Self::CaseFoldEquals { var, .. } => var,
        }
    }

    /// Evaluates the filter under a binding.
    ///
    /// Returns `None` when the variable is not yet bound (the evaluator
    /// defers such filters). A bound term that cannot be coerced to the
    /// filter's domain (e.g. a non-numeric string under a numeric compare)
    /// fails the filter rather than erroring.
    #[must_use]
    pub fn evaluate(&self, binding: &Binding) -> Option<bool> {
        let term = binding.get(self.var())?;
        let verdict = match self {
            Self::Contains { needle, .. } => term
                .as_text()
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            Self::NumericCompare { op, value, .. } => match term.as_f64() {
                Some(actual) => op.holds(&actual, value),
                None => false,
            },
            Self::DateCompare { op, value, .. } => match term.as_datetime() {
                Some(actual) => op.holds(&actual, value),
                None => false,
            },
            Self::CaseFoldEquals { value, .. } => term.as_text().eq_ignore_ascii_case(value),
        };
        Some(verdict)
    }

    /// Builds a filter from a function name and string argument, for use by
    /// the query-parsing collaborator at the one-shot boundary.
    ///
    /// # Errors
    /// `UnknownFunction` for names outside the closed set; `InvalidPattern`
    /// when the argument cannot be parsed for the named function.
    pub fn parse(name: &str, var: impl Into<String>, arg: &str) -> Result<Self, PatternError> {
        let var = var.into();
        let num = |op: CompareOp| -> Result<Self, PatternError> {
            let value = arg
                .trim()
                .parse::<f64>()
                .map_err(|_| PatternError::InvalidPattern {
                    reason: format!("filter {name} expects a numeric argument, got {arg:?}"),
                })?;
            Ok(Self::NumericCompare {
                var: var.clone(),
                op,
                value,
            })
        };
        let date = |op: CompareOp| -> Result<Self, PatternError> {
            let value =
                Term::literal(arg)
                    .as_datetime()
                    .ok_or_else(|| PatternError::InvalidPattern {
                        reason: format!("filter {name} expects a date argument, got {arg:?}"),
                    })?;
            Ok(Self::DateCompare {
                var: var.clone(),
                op,
                value,
            })
        };

        match name {
            "contains" => Ok(Self::Contains {
                var,
                needle: arg.to_string(),
            }),
            "equals_ci" => Ok(Self::CaseFoldEquals {
                var,
                value: arg.to_string(),
            }),
            "num_lt" => num(CompareOp::Lt),
            "num_le" => num(CompareOp::Le),
            "num_eq" => num(CompareOp::Eq),
            "num_ge" => num(CompareOp::Ge),
            "num_gt" => num(CompareOp::Gt),
            "date_before" => date(CompareOp::Lt),
            "date_after" => date(CompareOp::Gt),
            other => Err(PatternError::UnknownFunction {
                name: other.to_string(),
            }),
        }
    }
}

/// Sort direction for result ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Result ordering: sort final bindings by one variable's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Variable whose value is the sort key.
    pub var: String,
    /// Direction.
    pub direction: SortDirection,
}

/// An ordered sequence of templates plus filters, ordering, and limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConjunctivePattern {
    /// Templates in declaration order.
    pub templates: Vec<Template>,

    /// Value filters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterExpr>,

    /// Optional result ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OrderBy>,

    /// Optional result limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl ConjunctivePattern {
    /// Creates a pattern over the given templates.
    #[must_use]
    pub fn new(templates: Vec<Template>) -> Self {
        Self {
            templates,
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    /// Adds a filter.
    #[must_use]
    pub fn with_filter(mut self, filter: FilterExpr) -> Self {
        self.filters.push(filter);
        self
    }

    /// Sets result ordering.
    #[must_use]
    pub fn with_order_by(mut self, var: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some(OrderBy {
            var: var.into(),
            direction,
        });
        self
    }

    /// Sets a result limit.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Validates the pattern: at least one template, and every filter and
    /// sort key must reference a variable some template binds.
    ///
    /// # Errors
    /// `InvalidPattern` with a reason naming the offending part.
    pub fn validate(&self) -> Result<(), PatternError> {
        if self.templates.is_empty() {
            return Err(PatternError::InvalidPattern {
                reason: "pattern has no templates".to_string(),
            });
        }

        let declared: std::collections::HashSet<&str> =
            self.templates.iter().flat_map(Template::vars).collect();

        for filter in &self.filters {
            if !declared.contains(filter.var()) {
                return Err(PatternError::InvalidPattern {
                    reason: format!(
                        "filter references variable ?{} that no template binds",
                        filter.var()
                    ),
                });
            }
        }

        if let Some(order) = &self.order_by {
            if !declared.contains(order.var.as_str()) {
                return Err(PatternError::InvalidPattern {
                    reason: format!(
                        "order by references variable ?{} that no template binds",
                        order.var
                    ),
                });
            }
        }

        Ok(())
    }
}

/// One satisfying assignment of pattern variables to terms.
///
/// Backed by an ordered map so that the fingerprint encoding is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Binding(BTreeMap<String, Term>);

impl Binding {
    /// Creates an empty binding.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a variable's value.
    #[must_use]
    pub fn get(&self, var: &str) -> Option<&Term> {
        self.0.get(var)
    }

    /// Binds a variable to a term, replacing any previous value.
    pub fn bind(&mut self, var: impl Into<String>, term: Term) {
        self.0.insert(var.into(), term);
    }

    /// Number of bound variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no variables are bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates (variable, term) pairs in variable order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Term)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// A stable fingerprint of the binding's contents.
    ///
    /// Two bindings fingerprint equal iff they bind the same variables to
    /// the same terms. Used for delivered-match dedup.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for (var, term) in &self.0 {
            hasher.update(var.as_bytes());
            hasher.update(&[0x1f]);
            match term {
                Term::Iri(iri) => {
                    hasher.update(b"i");
                    hasher.update(iri.as_str().as_bytes());
                }
                Term::Literal(lit) => {
                    hasher.update(b"l");
                    hasher.update(lit.value.as_bytes());
                    hasher.update(&[0x1f]);
                    if let Some(dt) = &lit.datatype {
                        hasher.update(dt.as_str().as_bytes());
                    }
                    hasher.update(&[0x1f]);
                    if let Some(lang) = &lit.lang {
                        hasher.update(lang.as_bytes());
                    }
                }
            }
            hasher.update(&[0x1e]);
        }
        *hasher.finalize().as_bytes()
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (var, term)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "?{var}={term}")?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, Term)> for Binding {
    fn from_iter<T: IntoIterator<Item = (String, Term)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
