//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge observed state to desired state. Key concepts:
//!
//! - **Desired state**: What the fleet should look like (from the node
//!   repository).
//! - **Observed state**: What the host actually runs (from the container
//!   engine).
//! - **Convergence**: The process of making observed match desired.
//!
//! # Invariants
//!
//! - Joins are deterministic given the same inputs (iteration order is by
//!   key).
//! - The GC ledger never ages a resource faster than wall clock: an entry
//!   keeps its original first-unused stamp for as long as the resource
//!   stays continuously unused.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Default interval between reconciliation passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Default grace period before an unused resource may be collected.
pub const DEFAULT_GC_GRACE: Duration = Duration::from_secs(15 * 60);

// =============================================================================
// Full outer join
// =============================================================================

/// One hostname's slot in a desired/observed join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinEntry<D, O> {
    /// Present on both sides.
    Both(D, O),
    /// Desired but not observed.
    DesiredOnly(D),
    /// Observed but not desired.
    ObservedOnly(O),
}

impl<D, O> JoinEntry<D, O> {
    /// The desired half, if present.
    pub fn desired(&self) -> Option<&D> {
        match self {
            Self::Both(d, _) | Self::DesiredOnly(d) => Some(d),
            Self::ObservedOnly(_) => None,
        }
    }

    /// The observed half, if present.
    pub fn observed(&self) -> Option<&O> {
        match self {
            Self::Both(_, o) | Self::ObservedOnly(o) => Some(o),
            Self::DesiredOnly(_) => None,
        }
    }
}

/// Full outer join of a desired map against an observed map.
///
/// Every key present on either side appears exactly once in the result,
/// tagged with which sides it was found on. Returned as a `BTreeMap` so
/// callers iterate in a stable order.
pub fn full_outer_join<K, D, O>(
    desired: HashMap<K, D>,
    mut observed: HashMap<K, O>,
) -> BTreeMap<K, JoinEntry<D, O>>
where
    K: Eq + Hash + Ord + Clone,
{
    let mut joined = BTreeMap::new();

    for (key, d) in desired {
        let entry = match observed.remove(&key) {
            Some(o) => JoinEntry::Both(d, o),
            None => JoinEntry::DesiredOnly(d),
        };
        joined.insert(key, entry);
    }

    for (key, o) in observed {
        joined.insert(key, JoinEntry::ObservedOnly(o));
    }

    joined
}

// =============================================================================
// GC ledger
// =============================================================================

/// Time-windowed garbage-collection ledger.
///
/// Tracks when each resource was first observed as unused. A resource is
/// eligible for collection only after it has been *continuously* unused for
/// the full grace period; becoming referenced again drops it from the
/// ledger, so a later unused stretch restarts the clock from zero.
///
/// Time is passed in by the caller rather than read internally, so sweep
/// decisions are deterministic and testable.
#[derive(Debug)]
pub struct GcLedger<K> {
    first_unused: HashMap<K, Instant>,
    grace: Duration,
}

impl<K: Eq + Hash + Clone> GcLedger<K> {
    /// Create a ledger with the given grace period.
    pub fn new(grace: Duration) -> Self {
        Self {
            first_unused: HashMap::new(),
            grace,
        }
    }

    /// Sync the ledger against the currently-unused set and return the
    /// resources whose unused age has reached the grace period.
    ///
    /// Resources no longer in `unused` are dropped from the ledger;
    /// resources already tracked keep their original stamp; new ones are
    /// stamped `now`. Expired entries stay in the ledger until [`remove`]d,
    /// so a failed deletion is retried on the next sweep without resetting
    /// the resource's age.
    ///
    /// [`remove`]: GcLedger::remove
    pub fn update(&mut self, unused: &HashSet<K>, now: Instant) -> Vec<K> {
        self.first_unused.retain(|key, _| unused.contains(key));

        for key in unused {
            self.first_unused.entry(key.clone()).or_insert(now);
        }

        self.first_unused
            .iter()
            .filter(|(_, first)| now.duration_since(**first) >= self.grace)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drop a resource from the ledger (after it has been deleted).
    pub fn remove(&mut self, key: &K) {
        self.first_unused.remove(key);
    }

    /// Number of resources currently tracked as unused.
    pub fn tracked(&self) -> usize {
        self.first_unused.len()
    }

    /// How long a resource has been continuously unused, if tracked.
    pub fn unused_age(&self, key: &K, now: Instant) -> Option<Duration> {
        self.first_unused
            .get(key)
            .map(|first| now.duration_since(*first))
    }
}

// =============================================================================
// Backoff policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate the delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(20) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter;
        let jitter = rand_jitter(jitter_range);
        let final_delay = (delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

/// Simple jitter using a basic LCG (for no external deps).
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = (seed.wrapping_mul(6364136223846793005).wrapping_add(1)) as f64;
    let normalized = (random / u64::MAX as f64) * 2.0 - 1.0; // -1.0 to 1.0
    normalized * range
}

// =============================================================================
// Tests
// =============================================================================
