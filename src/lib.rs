//! Proxy Triage - two-phase endpoint checker
//!
//! Takes a large, untrusted list of proxy endpoint descriptors and narrows
//! it down to the unique endpoints that are reachable and fast through a
//! real tunnel, annotated with their country.

pub mod proxy;

pub use proxy::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
