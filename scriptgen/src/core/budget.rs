//! Shared time budget helpers for bounding a whole pipeline run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Why a run can no longer spend time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BudgetError {
    #[error("overall deadline exceeded")]
    Expired,
    #[error("run cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag shared between a run and whoever controls it.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One outer deadline plus a cancellation token, threaded through generator
/// calls and sandbox runs alike.
#[derive(Debug, Clone)]
pub struct RunBudget {
    deadline: Instant,
    cancel: CancelToken,
}

impl RunBudget {
    /// Budget of `total` starting now, with a fresh cancellation token.
    pub fn new(total: Duration) -> Self {
        let now = Instant::now();
        let deadline = now
            .checked_add(total)
            .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365));
        Self::with_deadline(deadline, CancelToken::new())
    }

    pub fn with_deadline(deadline: Instant, cancel: CancelToken) -> Self {
        Self { deadline, cancel }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the deadline. Cancellation wins over expiry.
    pub fn remaining(&self) -> Result<Duration, BudgetError> {
        if self.cancel.is_cancelled() {
            return Err(BudgetError::Cancelled);
        }
        remaining_budget(self.deadline)
    }

    pub fn check(&self) -> Result<(), BudgetError> {
        self.remaining().map(|_| ())
    }

    /// Shrink a per-call timeout so it never outlives the overall deadline.
    pub fn clamp(&self, timeout: Duration) -> Result<Duration, BudgetError> {
        Ok(self.remaining()?.min(timeout))
    }
}

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration, BudgetError> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(BudgetError::Expired);
    }
    Ok(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_budget_errors_after_deadline() {
        let past = Instant::now()
            .checked_sub(Duration::from_millis(10))
            .unwrap_or_else(Instant::now);
        assert_eq!(remaining_budget(past), Err(BudgetError::Expired));
    }

    #[test]
    fn clamp_never_exceeds_remaining() {
        let budget = RunBudget::new(Duration::from_secs(2));
        let clamped = budget.clamp(Duration::from_secs(60)).expect("clamp");
        assert!(clamped <= Duration::from_secs(2));

        let short = budget.clamp(Duration::from_millis(5)).expect("clamp");
        assert_eq!(short, Duration::from_millis(5));
    }

    #[test]
    fn cancellation_wins_over_remaining_time() {
        let budget = RunBudget::new(Duration::from_secs(60));
        let token = budget.cancel_token().clone();
        assert!(budget.check().is_ok());

        token.cancel();
        assert!(budget.is_cancelled());
        assert_eq!(budget.remaining(), Err(BudgetError::Cancelled));
    }

    #[test]
    fn huge_budget_does_not_overflow() {
        let budget = RunBudget::new(Duration::MAX);
        assert!(budget.check().is_ok());
    }
}
