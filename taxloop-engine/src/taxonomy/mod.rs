//! Versioned taxonomy: category definitions, match rules, attribute policies
//!
//! The taxonomy is a single mutable document persisted one JSON row per
//! version. Versions chain monotonically; the head pointer is advanced with a
//! compare-and-set so concurrent applies against a stale parent always fail.

mod doc;
mod store;

pub use doc::{AttributePolicy, CategoryDef, CategoryRule, TaxonomyDoc};
pub use store::{chain_version, TaxonomyStore, GENESIS_VERSION};
