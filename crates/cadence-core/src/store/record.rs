//! Progress record model and the merge policy between tiers.
//!
//! A record holds two kinds of fields:
//! - registers: scalar values resolved last-write-wins by timestamp
//! - counters: grow-only totals kept per origin (device), summed on read
//!
//! Merging is commutative, associative and idempotent, so records can be
//! pushed to the remote tier any number of times without double counting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A last-write-wins scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub value: Value,
    pub updated_at: DateTime<Utc>,
    /// Bumped when the same origin rewrites the register within one timestamp.
    #[serde(default)]
    pub version: u32,
}

impl Register {
    pub fn new(value: Value, updated_at: DateTime<Utc>) -> Self {
        Self {
            value,
            updated_at,
            version: 0,
        }
    }

    /// Whether `self` wins over `other`.
    ///
    /// Full ties fall back to the serialized value so both tiers converge on
    /// the same winner.
    fn supersedes(&self, other: &Register) -> bool {
        (self.updated_at, self.version)
            .cmp(&(other.updated_at, other.version))
            .then_with(|| self.value.to_string().cmp(&other.value.to_string()))
            .is_gt()
    }
}

/// Stored progress for one `(user, key)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(default)]
    pub registers: BTreeMap<String, Register>,
    /// counter name -> origin -> total contributed by that origin
    #[serde(default)]
    pub counters: BTreeMap<String, BTreeMap<String, u64>>,
}

impl ProgressRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty() && self.counters.is_empty()
    }

    /// Current value of a register.
    pub fn register(&self, name: &str) -> Option<&Value> {
        self.registers.get(name).map(|r| &r.value)
    }

    /// Deserialize a register into a typed value.
    pub fn register_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.register(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Sum of a counter across every origin.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|origins| origins.values().sum())
            .unwrap_or(0)
    }

    /// Latest register timestamp.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.registers.values().map(|r| r.updated_at).max()
    }

    /// Apply a local delta contributed by `origin`.
    ///
    /// Local writes are sequential, so a write stamped at the same instant
    /// as the stored register replaces it.
    pub fn apply(&mut self, delta: &ProgressDelta, origin: &str) {
        for (name, value) in &delta.set {
            let version = match self.registers.get(name) {
                Some(existing) if existing.updated_at > delta.at => continue,
                Some(existing) if existing.updated_at == delta.at => existing.version + 1,
                _ => 0,
            };
            self.registers.insert(
                name.clone(),
                Register {
                    value: value.clone(),
                    updated_at: delta.at,
                    version,
                },
            );
        }
        for (name, by) in &delta.increment {
            *self
                .counters
                .entry(name.clone())
                .or_default()
                .entry(origin.to_string())
                .or_insert(0) += by;
        }
    }

    /// Fold `other` into `self`.
    pub fn merge_from(&mut self, other: &ProgressRecord) {
        for (name, theirs) in &other.registers {
            match self.registers.get(name) {
                Some(ours) if !theirs.supersedes(ours) => {}
                _ => {
                    self.registers.insert(name.clone(), theirs.clone());
                }
            }
        }
        for (name, origins) in &other.counters {
            let ours = self.counters.entry(name.clone()).or_default();
            for (origin, total) in origins {
                let entry = ours.entry(origin.clone()).or_insert(0);
                *entry = (*entry).max(*total);
            }
        }
    }

    /// Merged view of two records.
    pub fn merged(a: Option<&ProgressRecord>, b: Option<&ProgressRecord>) -> Option<ProgressRecord> {
        match (a, b) {
            (None, None) => None,
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (Some(a), Some(b)) => {
                let mut merged = a.clone();
                merged.merge_from(b);
                Some(merged)
            }
        }
    }
}

/// A change to one record: registers to set and counters to bump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressDelta {
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub set: BTreeMap<String, Value>,
    #[serde(default)]
    pub increment: BTreeMap<String, u64>,
}

impl ProgressDelta {
    /// Start an empty delta stamped at `at`.
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at,
            set: BTreeMap::new(),
            increment: BTreeMap::new(),
        }
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(name.into(), value.into());
        self
    }

    pub fn increment(mut self, name: impl Into<String>, by: u64) -> Self {
        if by > 0 {
            *self.increment.entry(name.into()).or_insert(0) += by;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.increment.is_empty()
    }
}
