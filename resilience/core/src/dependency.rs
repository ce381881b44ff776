//! Dependency classes and their retry presets
//!
//! | class        | attempts | base   | cap  |
//! |--------------|----------|--------|------|
//! | cache        | 3        | 100ms  | 2s   |
//! | task-queue   | 4        | 250ms  | 5s   |
//! | storage      | 5        | 500ms  | 10s  |
//! | database     | 5        | 200ms  | 10s  |
//! | llm          | 6        | 1s     | 60s  |
//! | graph-engine | 4        | 1s     | 30s  |
//!
//! Every preset grows exponentially (factor 2) with jitter.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Kind of external dependency
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyClass {
    /// Key-value cache
    Cache,
    /// Background task broker
    TaskQueue,
    /// Object storage
    Storage,
    /// Relational database
    Database,
    /// Language-model API
    Llm,
    /// Knowledge-graph construction engine
    GraphEngine,
}

impl DependencyClass {
    /// Every class
    pub const ALL: [DependencyClass; 6] = [
        Self::Cache,
        Self::TaskQueue,
        Self::Storage,
        Self::Database,
        Self::Llm,
        Self::GraphEngine,
    ];

    /// Kebab-case name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::TaskQueue => "task-queue",
            Self::Storage => "storage",
            Self::Database => "database",
            Self::Llm => "llm",
            Self::GraphEngine => "graph-engine",
        }
    }

    /// Conventional service name used for health probes
    #[must_use]
    pub fn default_service(&self) -> &'static str {
        match self {
            Self::Cache => "cache-service",
            Self::TaskQueue => "task-queue",
            Self::Storage => "object-storage",
            Self::Database => "database",
            Self::Llm => "llm-api",
            Self::GraphEngine => "graph-engine",
        }
    }

    /// Built-in retry policy reflecting typical recovery time
    #[must_use]
    pub fn preset(&self) -> RetryPolicy {
        let (attempts, base_ms, cap_secs) = match self {
            Self::Cache => (3, 100, 2),
            Self::TaskQueue => (4, 250, 5),
            Self::Storage => (5, 500, 10),
            Self::Database => (5, 200, 10),
            Self::Llm => (6, 1_000, 60),
            Self::GraphEngine => (4, 1_000, 30),
        };
        RetryPolicy::exponential(
            attempts,
            Duration::from_millis(base_ms),
            Duration::from_secs(cap_secs),
        )
    }
}

impl fmt::Display for DependencyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown dependency class '{s}'"))
    }
}
