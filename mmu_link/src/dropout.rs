use crate::logic::StepStatus;

/// Suppresses short communication dropouts
///
/// Consecutive link failures (timeouts and malformed input alike) share a single budget. Only once
/// [`DropoutFilter::MAX_OCCURRENCES`] failures have been recorded in a row is the failure
/// escalated, reporting the cause of the first failure in the series.
#[derive(Debug, Clone)]
pub struct DropoutFilter {
    occurrences: u8,
    cause: StepStatus,
}

impl DropoutFilter {
    pub const MAX_OCCURRENCES: u8 = 5;

    pub const fn new() -> Self {
        Self {
            occurrences: 0,
            cause: StepStatus::Processing,
        }
    }

    /// Records one failure, returning `true` when it must be escalated
    ///
    /// After escalating the filter starts counting a new series.
    pub fn record_failure(&mut self, cause: StepStatus) -> bool {
        if self.occurrences == 0 {
            self.cause = cause;
        }
        self.occurrences += 1;
        if self.occurrences >= Self::MAX_OCCURRENCES {
            self.occurrences = 0;
            true
        } else {
            false
        }
    }

    /// Clears the series after a successful exchange
    pub fn record_success(&mut self) {
        self.occurrences = 0;
    }

    /// Failures recorded in the current series
    pub fn occurrences(&self) -> u8 {
        self.occurrences
    }

    /// Cause of the first failure in the current (or just escalated) series
    pub fn initial_cause(&self) -> StepStatus {
        self.cause
    }
}

impl Default for DropoutFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalates_on_threshold() {
        let mut filter = DropoutFilter::new();
        for _ in 0..DropoutFilter::MAX_OCCURRENCES - 1 {
            assert!(!filter.record_failure(StepStatus::CommunicationTimeout));
        }
        assert!(filter.record_failure(StepStatus::CommunicationTimeout));
        assert_eq!(filter.initial_cause(), StepStatus::CommunicationTimeout);
        assert_eq!(filter.occurrences(), 0);
    }

    #[test]
    fn mixed_causes_share_one_budget() {
        let mut filter = DropoutFilter::new();
        assert!(!filter.record_failure(StepStatus::ProtocolError));
        for _ in 1..DropoutFilter::MAX_OCCURRENCES - 1 {
            assert!(!filter.record_failure(StepStatus::CommunicationTimeout));
        }
        assert!(filter.record_failure(StepStatus::CommunicationTimeout));
        assert_eq!(filter.initial_cause(), StepStatus::ProtocolError);
    }

    #[test]
    fn success_restarts_the_series() {
        let mut filter = DropoutFilter::new();
        for _ in 0..DropoutFilter::MAX_OCCURRENCES - 1 {
            filter.record_failure(StepStatus::CommunicationTimeout);
        }
        filter.record_success();
        assert!(!filter.record_failure(StepStatus::ProtocolError));
        assert_eq!(filter.occurrences(), 1);
        assert_eq!(filter.initial_cause(), StepStatus::ProtocolError);
    }

    #[test]
    fn escalation_starts_a_new_series() {
        let mut filter = DropoutFilter::new();
        for _ in 0..DropoutFilter::MAX_OCCURRENCES {
            filter.record_failure(StepStatus::CommunicationTimeout);
        }
        assert!(!filter.record_failure(StepStatus::ProtocolError));
        assert_eq!(filter.initial_cause(), StepStatus::ProtocolError);
    }
}
