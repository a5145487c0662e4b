//! Core traits and types for the caching system.

use std::time::Duration;
use tokio::time::Instant;

/// Named time-to-live tiers, chosen per resource volatility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TtlTier {
  /// Frequently edited data (task lists, user lists)
  Short,
  /// Slowly changing aggregates (attendance, performance)
  Medium,
  /// Rarely changing data (leaderboards)
  Long,
}

/// Concrete durations for each [`TtlTier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
  pub short: Duration,
  pub medium: Duration,
  pub long: Duration,
}

impl TtlPolicy {
  pub fn ttl(&self, tier: TtlTier) -> Duration {
    match tier {
      TtlTier::Short => self.short,
      TtlTier::Medium => self.medium,
      TtlTier::Long => self.long,
    }
  }
}

impl Default for TtlPolicy {
  fn default() -> Self {
    Self {
      short: Duration::from_secs(30),
      medium: Duration::from_secs(5 * 60),
      long: Duration::from_secs(30 * 60),
    }
  }
}

/// A logical resource that can be looked up in the cache.
///
/// Keys must be a deterministic function of the resource and its scope
/// (never of time), and resources of the same kind must share a common
/// prefix so they can be invalidated together.
pub trait QueryKey {
  /// Cache key, e.g. `user-tasks:alice`
  fn cache_key(&self) -> String;

  /// Human-readable description for logs
  fn description(&self) -> String;

  /// How volatile the resource is
  fn tier(&self) -> TtlTier;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<Instant>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: Instant) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  pub fn from_in_flight(data: T) -> Self {
    Self {
      data,
      source: CacheSource::InFlight,
      cached_at: None,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// This call performed the network request
  Network,
  /// Served from a fresh cache entry
  Cache,
  /// Attached to a request another caller had already issued
  InFlight,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  /// Calls that attached to an already pending request
  pub joined: u64,
  pub invalidations: u64,
}
