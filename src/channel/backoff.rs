use std::time::Duration;

/// Reconnect schedule: `min(base * factor^attempt, cap)`, `max_attempts`
/// reconnects, then `probe_attempts` probes on the same schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub max_attempts: u32,
    pub probe_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(10),
            max_attempts: 5,
            probe_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Wait before the zero-based `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(multiplier)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}
