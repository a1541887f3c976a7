//! Rate limit policies and the policy registry.
//!
//! A policy names a group and the quota (`limit` calls per `interval`
//! seconds) applied to every identity counted against that group.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::error::{FloodgateError, Result};

/// Group used when a policy is registered without a name.
pub const DEFAULT_GROUP: &str = "default";
/// Calls allowed per window when no limit was ever supplied.
pub const DEFAULT_LIMIT: u64 = 50;
/// Window length in seconds when no interval was ever supplied.
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// A named rate limiting rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Policy {
    /// Unique group name
    pub group: String,
    /// Calls allowed per window
    pub limit: u64,
    /// Window length in seconds
    pub interval: u64,
}

impl Policy {
    /// Create a validated policy.
    pub fn new(group: impl Into<String>, limit: u64, interval: u64) -> Result<Self> {
        let policy = Self {
            group: group.into(),
            limit,
            interval,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Check that the policy can be evaluated.
    pub fn validate(&self) -> Result<()> {
        if self.group.is_empty() {
            return Err(FloodgateError::Configuration(
                "policy group must not be empty".to_string(),
            ));
        }
        if self.limit == 0 {
            return Err(FloodgateError::Configuration(format!(
                "policy '{}' must have a limit greater than 0",
                self.group
            )));
        }
        if self.interval == 0 {
            return Err(FloodgateError::Configuration(format!(
                "policy '{}' must have an interval greater than 0",
                self.group
            )));
        }
        Ok(())
    }

    /// Window length as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

/// A partial policy as supplied to [`PolicyRegistry::add`].
///
/// Missing fields are filled from whatever the registry already holds for
/// the group, then from the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySpec {
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub interval: Option<u64>,
}

impl PolicySpec {
    /// Spec for a named group with no fields set.
    pub fn group(group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_interval(mut self, interval: u64) -> Self {
        self.interval = Some(interval);
        self
    }
}

/// The YAML document accepted by [`PolicyRegistry::from_yaml`].
#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policies: Vec<PolicySpec>,
}

/// In-memory catalog of policies keyed by group.
///
/// Entries are only ever added or merged, never removed.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: RwLock<HashMap<String, Policy>>,
}

impl PolicyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update a policy.
    ///
    /// Supplied fields win over the stored policy for the group; the
    /// defaults only fill fields that were never set. Non-positive values are
    /// rejected and leave the registry untouched.
    pub fn add(&self, spec: PolicySpec) -> Result<Policy> {
        let group = spec.group.unwrap_or_else(|| DEFAULT_GROUP.to_string());

        if spec.limit == Some(0) {
            return Err(FloodgateError::Configuration(format!(
                "policy '{}' must have a limit greater than 0",
                group
            )));
        }
        if spec.interval == Some(0) {
            return Err(FloodgateError::Configuration(format!(
                "policy '{}' must have an interval greater than 0",
                group
            )));
        }

        let mut policies = self.policies.write();
        let previous = policies.get(&group);

        let policy = Policy {
            limit: spec
                .limit
                .or(previous.map(|p| p.limit))
                .unwrap_or(DEFAULT_LIMIT),
            interval: spec
                .interval
                .or(previous.map(|p| p.interval))
                .unwrap_or(DEFAULT_INTERVAL_SECS),
            group: group.clone(),
        };
        policy.validate()?;

        debug!(
            group = %policy.group,
            limit = policy.limit,
            interval = policy.interval,
            "Registered policy"
        );
        policies.insert(group, policy.clone());
        Ok(policy)
    }

    /// Register a batch of policies, stopping at the first invalid one.
    pub fn load_specs<I>(&self, specs: I) -> Result<Vec<Policy>>
    where
        I: IntoIterator<Item = PolicySpec>,
    {
        specs.into_iter().map(|spec| self.add(spec)).collect()
    }

    /// Build a registry from a YAML document with a top-level `policies` list.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml).map_err(|e| {
            FloodgateError::Configuration(format!("Failed to parse policy file: {}", e))
        })?;
        let registry = Self::new();
        registry.load_specs(file.policies)?;
        Ok(registry)
    }

    /// Look up a policy by group.
    pub fn get(&self, group: &str) -> Option<Policy> {
        self.policies.read().get(group).cloned()
    }

    /// Look up several groups in order, failing on the first unknown one.
    pub fn resolve<S: AsRef<str>>(&self, groups: &[S]) -> Result<Vec<Policy>> {
        let policies = self.policies.read();
        groups
            .iter()
            .map(|group| {
                let group = group.as_ref();
                policies.get(group).cloned().ok_or_else(|| {
                    FloodgateError::Configuration(format!("unknown policy group '{}'", group))
                })
            })
            .collect()
    }

    /// Snapshot of every registered policy, ordered by group.
    pub fn policies(&self) -> Vec<Policy> {
        let mut all: Vec<Policy> = self.policies.read().values().cloned().collect();
        all.sort_by(|a, b| a.group.cmp(&b.group));
        all
    }

    pub fn len(&self) -> usize {
        self.policies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.read().is_empty()
    }
}
