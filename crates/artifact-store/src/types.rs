//! Store types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of purge events kept in [`StoreStats::purge_history`]
pub const PURGE_HISTORY_LEN: usize = 5;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Selects which entries a purge removes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeSelector {
    /// Entries modified longer ago than this are removed. Zero removes
    /// everything regardless of age.
    pub older_than: Duration,
}

impl PurgeSelector {
    pub fn older_than(older_than: Duration) -> Self {
        Self { older_than }
    }

    pub fn older_than_days(days: u64) -> Self {
        Self::older_than(Duration::from_secs(days.saturating_mul(SECS_PER_DAY)))
    }

    /// Selector matching every entry
    pub fn all() -> Self {
        Self::default()
    }

    pub fn removes_everything(&self) -> bool {
        self.older_than.is_zero()
    }
}

/// A completed purge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PurgeEvent {
    pub when: DateTime<Utc>,
    pub removed: u64,
}

/// Hit/miss counters and recent purge history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StoreStats {
    pub hit: u64,
    pub miss: u64,
    /// Most recent purges, oldest first
    pub purge_history: Vec<PurgeEvent>,
}

/// Result of a full walk over the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StoreCount {
    pub items: u64,
    pub total_size: u64,
}
