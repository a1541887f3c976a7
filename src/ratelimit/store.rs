//! The authoritative counter store.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::Limiter;
use super::clock::{Clock, SystemClock};
use super::counter::{Decision, WindowCounter};
use super::policy::Policy;
use crate::error::Result;

/// Counters indexed by group, then by identity.
///
/// Each group's table lives in one `DashMap` shard, so a read-modify-write
/// of a counter always runs under that shard's write lock.
#[derive(Debug)]
pub struct CounterStore {
    groups: DashMap<String, HashMap<String, WindowCounter>>,
    clock: Arc<dyn Clock>,
}

impl CounterStore {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            groups: DashMap::new(),
            clock,
        }
    }

    /// Count a call by `identity` against each policy in order.
    ///
    /// Evaluation stops at the first policy that denies; the policies after it
    /// are neither checked nor counted. Invalid policies are rejected before
    /// anything is counted.
    pub async fn limit(&self, identity: &str, policies: &[Policy]) -> Result<Decision> {
        for policy in policies {
            policy.validate()?;
        }
        let now = self.clock.now();

        for policy in policies {
            let decision = self.hit(identity, policy, now);
            if let Decision::Deny { reset_at } = decision {
                debug!(
                    group = %policy.group,
                    identity = %identity,
                    reset_at = %reset_at,
                    "Rate limit exceeded"
                );
                return Ok(decision);
            }
        }

        Ok(Decision::Allow)
    }

    /// One read-modify-write under the group's shard lock.
    ///
    /// The lock is held only for this synchronous update, never across an
    /// await point.
    fn hit(&self, identity: &str, policy: &Policy, now: DateTime<Utc>) -> Decision {
        let mut table = self.groups.entry(policy.group.clone()).or_default();

        match table.get_mut(identity) {
            Some(counter) => counter.hit(policy, now),
            None => {
                trace!(group = %policy.group, identity = %identity, "Opening counter");
                table.insert(identity.to_string(), WindowCounter::first_hit(policy, now));
                Decision::Allow
            }
        }
    }

    /// Zero every count in `group`, keeping the window expirations.
    pub fn reset(&self, group: &str) {
        if let Some(mut table) = self.groups.get_mut(group) {
            for counter in table.values_mut() {
                counter.count = 0;
            }
            debug!(group = %group, counters = table.len(), "Group reset");
        }
    }

    /// Zero every count in every group.
    pub fn reset_all(&self) {
        for mut table in self.groups.iter_mut() {
            for counter in table.values_mut() {
                counter.count = 0;
            }
        }
        debug!(groups = self.groups.len(), "All groups reset");
    }

    /// Drop counters whose window ended more than `horizon` ago.
    ///
    /// Returns the number of counters removed.
    pub fn evict_expired(&self, horizon: Duration) -> usize {
        let horizon = TimeDelta::from_std(horizon).unwrap_or(TimeDelta::MAX);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(horizon)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut evicted = 0;
        self.groups.retain(|_, table| {
            let before = table.len();
            table.retain(|_, counter| counter.expiration >= cutoff);
            evicted += before - table.len();
            !table.is_empty()
        });
        evicted
    }

    /// Current counter for an identity, if one exists.
    pub fn counter(&self, group: &str, identity: &str) -> Option<WindowCounter> {
        self.groups
            .get(group)
            .and_then(|table| table.get(identity).copied())
    }

    /// Number of live counters across all groups.
    pub fn counter_count(&self) -> usize {
        self.groups.iter().map(|table| table.len()).sum()
    }
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Limiter for CounterStore {
    async fn limit(&self, identity: &str, policies: &[Policy]) -> Result<Decision> {
        CounterStore::limit(self, identity, policies).await
    }

    async fn reset(&self, group: &str) -> Result<()> {
        CounterStore::reset(self, group);
        Ok(())
    }

    async fn reset_all(&self) -> Result<()> {
        CounterStore::reset_all(self);
        Ok(())
    }
}
