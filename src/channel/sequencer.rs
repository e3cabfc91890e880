use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Strictly increasing message ids, never behind the wall clock so they
/// keep increasing across restarts.
#[derive(Debug)]
pub struct MessageSequencer {
    last: AtomicU64,
}

impl MessageSequencer {
    pub fn new() -> Self {
        Self { last: AtomicU64::new(0) }
    }

    pub fn next(&self) -> u64 {
        let now = now_millis();
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(last.max(now) + 1))
            .unwrap_or_else(|last| last);
        prev.max(now) + 1
    }

    pub fn last(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

impl Default for MessageSequencer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
