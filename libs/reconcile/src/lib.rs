//! Claim bookkeeping for cross-system reconciliation.
//!
//! Two registries report on the same logical node independently: the node
//! registry says a node is unreachable, the compute provider says its
//! instance is terminated. Either observation can arrive many times and in
//! any order. This library records, per correlation key and target system,
//! whether a termination action has already been issued so that the action
//! is attempted at most once.
//!
//! # Invariants
//!
//! - `try_claim` is linearizable: for one `(key, target)` pair exactly one
//!   concurrent caller wins
//! - A record, once created, is never removed for the life of the process
//! - A confirmed claim is never handed out again
//! - Claims on different targets for the same key are independent
//!
//! # Claim lifecycle
//!
//! ```text
//!            try_claim            confirm
//!   (none) ───────────▶ Claimed ───────────▶ Confirmed
//!                          │
//!                          │ fail
//!                          ▼
//!                 Failed { attempts } ──try_claim (Bounded policy,
//!                                       backoff elapsed)──▶ Claimed
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use nodereap_id::CorrelationKey;

/// System a termination action is issued against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TargetSystem {
    /// The cluster node registry (action: delete the node record).
    Registry,

    /// The compute provider (action: terminate the instance).
    Compute,
}

impl TargetSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::Compute => "compute",
        }
    }
}

impl fmt::Display for TargetSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    /// An attempt has been handed out and has not reported back.
    Claimed,

    /// The action succeeded.
    Confirmed,

    /// The last attempt failed.
    Failed {
        /// Number of failed attempts so far.
        attempts: u32,
    },
}

/// What happens to a claim whose action failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// A failed attempt counts as the one attempt. The key is never handed
    /// out again for that target.
    #[default]
    Never,

    /// A failed claim may be re-claimed once its backoff has elapsed, up to
    /// `max_attempts` attempts in total.
    Bounded {
        max_attempts: u32,
        base_backoff: Duration,
        max_backoff: Duration,
    },
}

impl RetryPolicy {
    /// Bounded policy with the default backoff cap.
    pub fn bounded(max_attempts: u32, base_backoff: Duration) -> Self {
        Self::Bounded {
            max_attempts,
            base_backoff,
            max_backoff: DEFAULT_MAX_BACKOFF.max(base_backoff),
        }
    }

    /// Backoff to wait after the `attempts`-th failure, or `None` if no
    /// further attempt is allowed.
    pub fn backoff_after(&self, attempts: u32) -> Option<Duration> {
        match *self {
            Self::Never => None,
            Self::Bounded {
                max_attempts,
                base_backoff,
                max_backoff,
            } => {
                if attempts >= max_attempts {
                    return None;
                }
                let exp = attempts.saturating_sub(1).min(16);
                let backoff = base_backoff.saturating_mul(1u32 << exp);
                Some(backoff.min(max_backoff))
            }
        }
    }
}

/// Counts of records by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimStats {
    pub claimed: usize,
    pub confirmed: usize,
    pub failed: usize,
}

impl ClaimStats {
    pub fn total(&self) -> usize {
        self.claimed + self.confirmed + self.failed
    }
}

/// Process-wide record of issued termination actions.
///
/// Implementations must make `try_claim` linearizable across all callers.
pub trait DedupStore: Send + Sync {
    /// Claim `(key, target)` for an attempt.
    ///
    /// Returns `true` if the caller must perform the action, `false` if it
    /// must skip it. Skipping is the expected path for duplicate or delayed
    /// observations, not an error.
    fn try_claim(&self, key: &CorrelationKey, target: TargetSystem) -> bool;

    /// Record that the claimed action succeeded.
    fn confirm(&self, key: &CorrelationKey, target: TargetSystem);

    /// Record that the claimed action failed.
    fn fail(&self, key: &CorrelationKey, target: TargetSystem);

    /// Current state of `(key, target)`, if it was ever claimed.
    fn state(&self, key: &CorrelationKey, target: TargetSystem) -> Option<ClaimState>;

    /// Record counts by state.
    fn stats(&self) -> ClaimStats;
}

#[derive(Debug, Clone, Copy)]
struct ClaimRecord {
    state: ClaimState,
    /// Attempts that have failed so far, kept across re-claims.
    failed_attempts: u32,
    retry_at: Option<Instant>,
}

/// [`DedupStore`] backed by a single mutex-guarded hash map.
#[derive(Debug, Default)]
pub struct InMemoryDedupStore {
    policy: RetryPolicy,
    records: Mutex<HashMap<(TargetSystem, CorrelationKey), ClaimRecord>>,
}

impl InMemoryDedupStore {
    /// Create a store that never re-claims a failed action.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with the given retry policy.
    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            policy,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// [`DedupStore::try_claim`] evaluated at `now`.
    pub fn try_claim_at(&self, key: &CorrelationKey, target: TargetSystem, now: Instant) -> bool {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        match records.get_mut(&(target, key.clone())) {
            None => {
                records.insert(
                    (target, key.clone()),
                    ClaimRecord {
                        state: ClaimState::Claimed,
                        failed_attempts: 0,
                        retry_at: None,
                    },
                );
                true
            }
            Some(record) => match (record.state, record.retry_at) {
                (ClaimState::Failed { .. }, Some(retry_at)) if now >= retry_at => {
                    record.state = ClaimState::Claimed;
                    record.retry_at = None;
                    true
                }
                _ => false,
            },
        }
    }

    /// [`DedupStore::fail`] evaluated at `now`.
    pub fn fail_at(&self, key: &CorrelationKey, target: TargetSystem, now: Instant) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(record) = records.get_mut(&(target, key.clone())) else {
            return;
        };

        // Only an outstanding attempt can fail.
        if record.state != ClaimState::Claimed {
            return;
        }

        record.failed_attempts += 1;
        record.state = ClaimState::Failed {
            attempts: record.failed_attempts,
        };
        record.retry_at = self
            .policy
            .backoff_after(record.failed_attempts)
            .map(|backoff| now + backoff);
    }
}

impl DedupStore for InMemoryDedupStore {
    fn try_claim(&self, key: &CorrelationKey, target: TargetSystem) -> bool {
        self.try_claim_at(key, target, Instant::now())
    }

    fn confirm(&self, key: &CorrelationKey, target: TargetSystem) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = records.get_mut(&(target, key.clone())) {
            record.state = ClaimState::Confirmed;
            record.retry_at = None;
        }
    }

    fn fail(&self, key: &CorrelationKey, target: TargetSystem) {
        self.fail_at(key, target, Instant::now())
    }

    fn state(&self, key: &CorrelationKey, target: TargetSystem) -> Option<ClaimState> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.get(&(target, key.clone())).map(|r| r.state)
    }

    fn stats(&self) -> ClaimStats {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .values()
            .fold(ClaimStats::default(), |mut stats, record| {
                match record.state {
                    ClaimState::Claimed => stats.claimed += 1,
                    ClaimState::Confirmed => stats.confirmed += 1,
                    ClaimState::Failed { .. } => stats.failed += 1,
                }
                stats
            })
    }
}

/// Default poll interval for both pollers.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default base backoff for [`RetryPolicy::Bounded`].
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Default backoff cap for [`RetryPolicy::Bounded`].
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30 * 60); // 30 minutes
