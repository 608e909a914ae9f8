//! Overall run deadline, propagated to every suspension point as remaining time.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    expires_at: Option<Instant>,
}

impl Deadline {
    /// A deadline that never expires.
    pub fn none() -> Self {
        Self { expires_at: None }
    }

    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Some(Instant::now() + budget),
        }
    }

    pub fn from_budget(budget: Option<Duration>) -> Self {
        budget.map_or_else(Self::none, Self::after)
    }

    /// Time left, or `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Clamp a per-operation timeout to the time left in the run.
    pub fn bound(&self, timeout: Duration) -> Duration {
        match self.remaining() {
            Some(left) => timeout.min(left),
            None => timeout,
        }
    }

    /// True when `wait` would run past the deadline.
    pub fn would_expire_during(&self, wait: Duration) -> bool {
        self.remaining().is_some_and(|left| wait >= left)
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn remaining_shrinks_as_time_passes() {
        let deadline = Deadline::after(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(deadline.remaining(), Some(Duration::from_secs(6)));
        assert!(!deadline.is_expired());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(deadline.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn bound_clamps_to_remaining() {
        let deadline = Deadline::after(Duration::from_secs(5));
        assert_eq!(deadline.bound(Duration::from_secs(60)), Duration::from_secs(5));
        assert_eq!(deadline.bound(Duration::from_secs(1)), Duration::from_secs(1));
        assert!(deadline.would_expire_during(Duration::from_secs(5)));
        assert!(!deadline.would_expire_during(Duration::from_secs(4)));
    }

    #[test]
    fn unbounded_deadline_never_expires() {
        let deadline = Deadline::none();
        assert_eq!(deadline.remaining(), None);
        assert!(!deadline.is_expired());
        assert_eq!(deadline.bound(Duration::from_secs(60)), Duration::from_secs(60));
        assert!(!deadline.would_expire_during(Duration::MAX));
    }
}
