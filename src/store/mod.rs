//! Fact storage.
//!
//! The [`FactStore`] trait is the seam between the matching engine and a
//! storage backend; [`InMemoryFactStore`] is the sharded in-memory backend.

mod memory;
mod traits;

pub use memory::{FactStoreConfig, InMemoryFactStore};
pub use traits::{FactStore, StoredFact};
