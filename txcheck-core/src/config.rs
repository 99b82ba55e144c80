use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{pool::PoolOptions, PgPool};

/// Op messages are pulled in batches of this size per `fillOpRemoveMap` call - bounded work,
/// bounded memory, empirically enough to keep pace with typical commit/rollback cadence.
pub const OP_PULL_BATCH_SIZE: usize = 32;
/// Half messages are always pulled one at a time; the scanner only ever needs to know about
/// the message sitting at its current cursor.
pub const HALF_PULL_BATCH_SIZE: usize = 1;
/// Wall-clock budget for a single half queue's scan, before the loop breaks and defers the
/// rest to the next tick.
pub const PER_QUEUE_BUDGET: Duration = Duration::from_secs(60);
/// How many consecutive empty pulls a scan will tolerate before giving up on a queue for
/// this tick.
pub const MAX_RETRY_COUNT_WHEN_HALF_NULL: u32 = 1;

/// The knobs the check engine itself is configured with, as distinct from store connectivity
/// (`PoolConfig`) - these tune *when* a half is checked, not *how* it's fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Minimum age (ms) a half message must reach before it's eligible for a back-check.
    pub transaction_timeout: Duration,
    /// Number of back-checks a half can receive before it's discarded outright.
    pub transaction_check_max: i32,
    /// The store's file retention window, in hours. Halves older than
    /// `3 * file_reserved_time` hours are skipped rather than checked - the underlying log
    /// segments covering them are already gone.
    pub file_reserved_time_hours: i64,
}

impl CheckConfig {
    pub fn file_retention(&self) -> Duration {
        Duration::from_secs((3 * self.file_reserved_time_hours * 3600) as u64)
    }
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            transaction_timeout: Duration::from_secs(6),
            transaction_check_max: 5,
            file_reserved_time_hours: 72,
        }
    }
}

/// A pool config object, designed to be passable across API boundaries.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    pub db_url: String,
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub acquire_timeout_seconds: Option<u64>,
    pub max_lifetime_seconds: Option<u64>,
    pub idle_timeout_seconds: Option<u64>,
}

impl PoolConfig {
    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        PoolOptions::new()
            .max_connections(self.max_connections.unwrap_or(10))
            .min_connections(self.min_connections.unwrap_or(1))
            .max_lifetime(Duration::from_secs(
                self.max_lifetime_seconds.unwrap_or(300),
            ))
            .idle_timeout(Duration::from_secs(self.idle_timeout_seconds.unwrap_or(60)))
            .acquire_timeout(Duration::from_secs(
                self.acquire_timeout_seconds.unwrap_or(30),
            ))
            .connect(&self.db_url)
            .await
    }
}
