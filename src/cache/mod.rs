//! In-memory request cache for dashboard reads.
//!
//! This module provides a resource-agnostic caching mechanism that:
//! - Memoizes keyed async fetches for a tiered time-to-live
//! - Shares one pending request between concurrent callers of the same key
//! - Supports invalidation by exact key or by key prefix

mod layer;
mod traits;

pub use layer::TtlCache;
pub use traits::{CacheResult, CacheSource, CacheStats, QueryKey, TtlPolicy, TtlTier};
