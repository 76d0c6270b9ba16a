//! Operation statistics, one counter per category.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Each job increments at most one category when it succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatCategory {
    FileOp,
    S3Op,
    ShellOp,
}

#[derive(Debug, Default)]
pub struct Stats {
    file_ops: AtomicU64,
    s3_ops: AtomicU64,
    shell_ops: AtomicU64,
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, category: StatCategory) -> &AtomicU64 {
        match category {
            StatCategory::FileOp => &self.file_ops,
            StatCategory::S3Op => &self.s3_ops,
            StatCategory::ShellOp => &self.shell_ops,
        }
    }

    pub fn increment(&self, category: StatCategory) {
        self.counter(category).fetch_add(1, Ordering::Relaxed);
    }

    /// Increments `category` only if `result` is a success, then hands the
    /// result back so call sites can stay on their `?` path.
    pub fn record<T, E>(&self, category: StatCategory, result: Result<T, E>) -> Result<T, E> {
        if result.is_ok() {
            self.increment(category);
        }
        result
    }

    pub fn get(&self, category: StatCategory) -> u64 {
        self.counter(category).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            file_ops: self.get(StatCategory::FileOp),
            s3_ops: self.get(StatCategory::S3Op),
            shell_ops: self.get(StatCategory::ShellOp),
            captured_at: std::time::SystemTime::now(),
        }
    }
}

/// A point-in-time capture of the counters, suitable for handing to an
/// external stats sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub file_ops: u64,
    pub s3_ops: u64,
    pub shell_ops: u64,
    pub captured_at: std::time::SystemTime,
}
