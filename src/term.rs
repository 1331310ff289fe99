//! Term and fact types.
//!
//! A fact is an immutable (subject, predicate, object) statement about a
//! security advisory. Subjects and predicates are IRIs; objects are either
//! IRIs or typed literals.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// An opaque identifier (IRI) for a subject, predicate, or object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Iri(String);

impl Iri {
    /// Creates an IRI from any string-like value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The IRI as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Iri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Iri {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Iri {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A typed literal value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Literal {
    /// Lexical form.
    pub value: String,

    /// Optional datatype IRI (e.g. `xsd:dateTime`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<Iri>,

    /// Optional language tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

impl Literal {
    /// Creates a plain string literal.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            datatype: None,
            lang: None,
        }
    }

    /// Creates a literal with a datatype tag.
    #[must_use]
    pub fn typed(value: impl Into<String>, datatype: impl Into<Iri>) -> Self {
        Self {
            value: value.into(),
            datatype: Some(datatype.into()),
            lang: None,
        }
    }

    /// Creates a language-tagged literal.
    #[must_use]
    pub fn lang_tagged(value: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            datatype: None,
            lang: Some(lang.into()),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.value)
    }
}

/// The object position of a fact: an IRI or a literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Term {
    /// An identifier.
    Iri(Iri),
    /// A typed literal.
    Literal(Literal),
}

impl Term {
    /// Creates an IRI term.
    #[must_use]
    pub fn iri(value: impl Into<Iri>) -> Self {
        Self::Iri(value.into())
    }

    /// Creates a plain string literal term.
    #[must_use]
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(Literal::string(value))
    }

    /// The textual content: the IRI string or the literal's lexical form.
    #[must_use]
    pub fn as_text(&self) -> &str {
        match self {
            Self::Iri(iri) => iri.as_str(),
            Self::Literal(lit) => &lit.value,
        }
    }

    /// Parses the term's text as a number, if possible.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        self.as_text().trim().parse::<f64>().ok()
    }

    /// Parses the term's text as a UTC timestamp.
    ///
    /// Accepts RFC 3339 timestamps and bare `YYYY-MM-DD` dates (midnight UTC),
    /// which is how advisory publication dates arrive in practice.
    #[must_use]
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        let text = self.as_text().trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(dt.with_timezone(&Utc));
        }
        let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?;
        Some(DateTime::from_naive_utc_and_offset(
            date.and_hms_opt(0, 0, 0)?,
            Utc,
        ))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iri(iri) => write!(f, "{iri}"),
            Self::Literal(lit) => write!(f, "{lit}"),
        }
    }
}

impl From<Iri> for Term {
    fn from(value: Iri) -> Self {
        Self::Iri(value)
    }
}

impl From<Literal> for Term {
    fn from(value: Literal) -> Self {
        Self::Literal(value)
    }
}

/// An immutable (subject, predicate, object) statement.
///
/// Facts are set elements: two facts are the same fact iff all three
/// positions are equal. The store assigns insertion ordinals separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fact {
    /// Subject identifier.
    pub subject: Iri,
    /// Predicate identifier.
    pub predicate: Iri,
    /// Object term.
    pub object: Term,
}

impl Fact {
    /// Creates a fact.
    #[must_use]
    pub fn new(subject: impl Into<Iri>, predicate: impl Into<Iri>, object: impl Into<Term>) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.subject, self.predicate, self.object)
    }
}
