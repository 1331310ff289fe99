//! Predicate vocabulary for security-advisory facts.
//!
//! Prefixed IRIs: `asc:` is the advisory ontology, `schema:` is schema.org,
//! `rdf:` the usual RDF namespace. Producers are free to use other
//! predicates; these are the ones the topic hub builds its patterns from.

use crate::term::Iri;

/// `rdf:type`.
pub const TYPE: &str = "rdf:type";

/// Advisory ontology class: a web-application exploit record.
pub const WEB_EXPLOIT: &str = "asc:WebExploit";

/// Target platform, e.g. "PHP" (`asc:platform`).
pub const PLATFORM: &str = "asc:platform";
/// Severity level: critical, high, medium, low (`asc:severity`).
pub const SEVERITY: &str = "asc:severity";
/// Exploit type: SQLi, XSS, RCE, etc. (`asc:exploitType`).
pub const EXPLOIT_TYPE: &str = "asc:exploitType";
/// Software type: CMS, framework, plugin, etc. (`asc:softwareType`).
pub const SOFTWARE_TYPE: &str = "asc:softwareType";
/// Name of the affected software (`asc:affectedSoftware`).
pub const AFFECTED_SOFTWARE: &str = "asc:affectedSoftware";
/// Affected version (`asc:affectedVersion`).
pub const AFFECTED_VERSION: &str = "asc:affectedVersion";
/// CVE identifier (`asc:cveId`).
pub const CVE_ID: &str = "asc:cveId";
/// CWE identifier (`asc:cweId`).
pub const CWE_ID: &str = "asc:cweId";
/// CVSS score (`asc:cvssScore`).
pub const CVSS_SCORE: &str = "asc:cvssScore";
/// Recommended solution (`asc:solution`).
pub const SOLUTION: &str = "asc:solution";
/// Mitigation measures (`asc:mitigation`).
pub const MITIGATION: &str = "asc:mitigation";
/// Proof-of-concept reference (`asc:proofOfConcept`).
pub const PROOF_OF_CONCEPT: &str = "asc:proofOfConcept";

/// Title (`schema:name`).
pub const NAME: &str = "schema:name";
/// Description (`schema:description`).
pub const DESCRIPTION: &str = "schema:description";
/// Publication date (`schema:datePublished`).
pub const DATE_PUBLISHED: &str = "schema:datePublished";
/// Source URL (`schema:url`).
pub const URL: &str = "schema:url";

/// Convenience constructor for a vocabulary predicate.
#[must_use]
pub fn iri(predicate: &str) -> Iri {
    Iri::new(predicate)
}
