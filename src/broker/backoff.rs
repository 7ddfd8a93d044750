use std::time::Duration;

/// Delay schedule between connection attempts.
///
/// The delay starts at `base` and doubles every ten attempts, never
/// exceeding `max`: attempts 0 to 9 wait `base`, 10 to 19 wait `2 * base`,
/// and so on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    const STEP: u32 = 10;

    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base) }
    }

    /// Delay to wait after the failed attempt number `attempt` (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let doublings = attempt / Self::STEP;
        let factor = 1u32.checked_shl(doublings).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}
