use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;

/// Default per-user cap on completed generations within a process lifetime.
pub const DEFAULT_IMAGE_LIMIT: u32 = 3;

/// Minimum gap between two outbound emails for the same user.
pub const EMAIL_COOLDOWN_MINUTES: i64 = 5;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserQuotaRecord {
    pub image_count: u32,
    pub last_email_sent: Option<DateTime<Utc>>,
}

/// Process-wide, per-username usage counters.
///
/// Records are created lazily with a zero count and never removed. The map
/// lives behind one mutex so concurrent sessions for the same username
/// cannot lose increments. Time is always passed in by the caller, which
/// keeps the ledger free of wall-clock reads and lets tests simulate it.
#[derive(Debug, Clone)]
pub struct QuotaLedger {
    inner: Arc<LedgerInner>,
}

#[derive(Debug)]
struct LedgerInner {
    image_limit: u32,
    email_cooldown: Duration,
    privileged: Vec<String>,
    records: Mutex<IndexMap<String, UserQuotaRecord>>,
}

impl QuotaLedger {
    pub fn new(image_limit: u32, privileged: Vec<String>) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                image_limit,
                email_cooldown: Duration::minutes(EMAIL_COOLDOWN_MINUTES),
                privileged,
                records: Mutex::new(IndexMap::new()),
            }),
        }
    }

    pub fn is_privileged(&self, username: &str) -> bool {
        self.inner
            .privileged
            .iter()
            .any(|candidate| candidate == username)
    }

    pub fn can_generate(&self, username: &str) -> bool {
        if self.is_privileged(username) {
            return true;
        }
        self.with_records(|records| {
            records
                .get(username)
                .map(|record| record.image_count)
                .unwrap_or(0)
                < self.inner.image_limit
        })
    }

    /// Adds one completed generation and returns the new count. Callers own
    /// the invariant that this runs exactly once per cycle that produced
    /// candidates.
    pub fn record_generation(&self, username: &str) -> u32 {
        self.with_records(|records| {
            let record = records.entry(username.to_string()).or_default();
            record.image_count += 1;
            record.image_count
        })
    }

    pub fn can_send_email(&self, username: &str, now: DateTime<Utc>) -> bool {
        self.with_records(|records| {
            match records.get(username).and_then(|record| record.last_email_sent) {
                None => true,
                Some(last) => now - last > self.inner.email_cooldown,
            }
        })
    }

    pub fn record_email_sent(&self, username: &str, now: DateTime<Utc>) {
        self.with_records(|records| {
            records.entry(username.to_string()).or_default().last_email_sent = Some(now);
        });
    }

    /// Generations left before the cap, or `None` for privileged users.
    pub fn remaining_generations(&self, username: &str) -> Option<u32> {
        if self.is_privileged(username) {
            return None;
        }
        let used = self.with_records(|records| {
            records
                .get(username)
                .map(|record| record.image_count)
                .unwrap_or(0)
        });
        Some(self.inner.image_limit.saturating_sub(used))
    }

    pub fn snapshot(&self, username: &str) -> UserQuotaRecord {
        self.with_records(|records| records.get(username).cloned().unwrap_or_default())
    }

    /// Usernames in first-seen order.
    pub fn usernames(&self) -> Vec<String> {
        self.with_records(|records| records.keys().cloned().collect())
    }

    fn with_records<T>(&self, apply: impl FnOnce(&mut IndexMap<String, UserQuotaRecord>) -> T) -> T {
        let mut guard = self
            .inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        apply(&mut guard)
    }
}

impl Default for QuotaLedger {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE_LIMIT, Vec::new())
    }
}
