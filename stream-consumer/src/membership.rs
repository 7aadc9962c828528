//! Sets of already-admitted dedup keys.
//!
//! `try_insert` is the single check-and-set operation normalizers rely on: it reports
//! whether the key was newly inserted and must be atomic with respect to every other
//! normalizer sharing the store.
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::MembershipError;
use crate::key::DedupKey;
use crate::metrics_consts::{MEMBERSHIP_EVICTED, MEMBERSHIP_SIZE};
use crate::redis::Client;

#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Insert `key` if absent. Returns true when it was not a member before.
    async fn try_insert(&self, key: &DedupKey) -> Result<bool, MembershipError>;

    /// Undo an admission whose record never reached the output. Returns true when
    /// `key` was a member.
    async fn remove(&self, key: &DedupKey) -> Result<bool, MembershipError>;

    /// Drop the oldest-inserted `fraction` of members. Returns how many were dropped.
    async fn evict_oldest(&self, fraction: f64) -> Result<usize, MembershipError>;

    /// Live members, or an estimate when the store is shared.
    async fn len(&self) -> usize;
}

#[derive(Default)]
struct Members {
    keys: HashSet<DedupKey>,
    /// Insertion order, oldest first.
    order: VecDeque<DedupKey>,
}

impl Members {
    fn evict(&mut self, count: usize) -> usize {
        let count = count.min(self.order.len());
        for key in self.order.drain(..count) {
            self.keys.remove(&key);
        }
        count
    }
}

/// A process-local store bounded by a high-water mark.
///
/// Crossing the mark evicts the oldest `evict_fraction` of the mark in one batch, so
/// membership never exceeds `high_water` after an insert returns. Order is insertion
/// order, not recency of lookups.
pub struct InMemoryMembership {
    members: Mutex<Members>,
    high_water: usize,
    evict_fraction: f64,
}

impl InMemoryMembership {
    pub fn new(high_water: usize, evict_fraction: f64) -> Self {
        Self {
            members: Mutex::new(Members::default()),
            high_water: high_water.max(1),
            evict_fraction: evict_fraction.clamp(f64::EPSILON, 1.0),
        }
    }

    fn batch(&self, of: usize) -> usize {
        ((of as f64 * self.evict_fraction).ceil() as usize).max(1)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Members>, MembershipError> {
        self.members
            .lock()
            .map_err(|_| MembershipError::Unavailable("poisoned membership lock".to_owned()))
    }
}

#[async_trait]
impl MembershipStore for InMemoryMembership {
    async fn try_insert(&self, key: &DedupKey) -> Result<bool, MembershipError> {
        let mut members = self.lock()?;

        if !members.keys.insert(key.clone()) {
            return Ok(false);
        }
        members.order.push_back(key.clone());

        if members.keys.len() > self.high_water {
            let evicted = members.evict(self.batch(self.high_water));
            info!(
                evicted,
                remaining = members.keys.len(),
                high_water = self.high_water,
                "evicted oldest dedup keys"
            );
            metrics::counter!(MEMBERSHIP_EVICTED).increment(evicted as u64);
        }
        metrics::gauge!(MEMBERSHIP_SIZE).set(members.keys.len() as f64);

        Ok(true)
    }

    async fn remove(&self, key: &DedupKey) -> Result<bool, MembershipError> {
        let mut members = self.lock()?;

        if !members.keys.remove(key) {
            return Ok(false);
        }
        // Rollbacks follow the insert closely, so the key sits near the back
        let position = members.order.iter().rposition(|member| member == key);
        if let Some(position) = position {
            members.order.remove(position);
        }
        metrics::gauge!(MEMBERSHIP_SIZE).set(members.keys.len() as f64);

        Ok(true)
    }

    async fn evict_oldest(&self, fraction: f64) -> Result<usize, MembershipError> {
        let mut members = self.lock()?;
        let count = (members.order.len() as f64 * fraction.clamp(0.0, 1.0)).ceil() as usize;
        let evicted = members.evict(count);
        metrics::counter!(MEMBERSHIP_EVICTED).increment(evicted as u64);
        metrics::gauge!(MEMBERSHIP_SIZE).set(members.keys.len() as f64);

        Ok(evicted)
    }

    async fn len(&self) -> usize {
        match self.members.lock() {
            Ok(members) => members.keys.len(),
            Err(_) => {
                warn!("poisoned membership lock");
                0
            }
        }
    }
}

/// A store shared between consumer instances through redis.
///
/// Keys expire after `ttl`; that is the only eviction. `len` counts the keys this
/// instance admitted and ignores expiry.
pub struct RedisMembership<C: Client> {
    client: C,
    prefix: String,
    ttl: Duration,
    admitted: AtomicUsize,
}

impl<C: Client> RedisMembership<C> {
    pub fn new(client: C, prefix: &str, ttl: Duration) -> Self {
        Self {
            client,
            prefix: prefix.to_owned(),
            ttl,
            admitted: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl<C: Client> MembershipStore for RedisMembership<C> {
    async fn try_insert(&self, key: &DedupKey) -> Result<bool, MembershipError> {
        let inserted = self
            .client
            .set_nx_ex(
                format!("{}{}", self.prefix, key),
                "1".to_owned(),
                self.ttl.as_secs().max(1),
            )
            .await
            .map_err(|e| MembershipError::Unavailable(format!("{:#}", e)))?;

        if inserted {
            let size = self.admitted.fetch_add(1, Ordering::Relaxed) + 1;
            metrics::gauge!(MEMBERSHIP_SIZE).set(size as f64);
        }
        Ok(inserted)
    }

    async fn remove(&self, key: &DedupKey) -> Result<bool, MembershipError> {
        let removed = self
            .client
            .del(format!("{}{}", self.prefix, key))
            .await
            .map_err(|e| MembershipError::Unavailable(format!("{:#}", e)))?;

        if removed {
            let size = self
                .admitted
                .fetch_sub(1, Ordering::Relaxed)
                .saturating_sub(1);
            metrics::gauge!(MEMBERSHIP_SIZE).set(size as f64);
        }
        Ok(removed)
    }

    async fn evict_oldest(&self, _fraction: f64) -> Result<usize, MembershipError> {
        Ok(0)
    }

    async fn len(&self) -> usize {
        self.admitted.load(Ordering::Relaxed)
    }
}
