//! Cyclic position in a [`BackoffSchedule`]

use std::time::Duration;

use mqlink_types::BackoffSchedule;

/// Retry cursor: advances one step per consecutive failure and wraps
#[derive(Debug, Clone)]
pub struct Backoff {
    schedule: BackoffSchedule,
    index: usize,
}

impl Backoff {
    pub fn new(schedule: BackoffSchedule) -> Self {
        Self { schedule, index: 0 }
    }

    /// Delay for the current failure; moves the cursor forward
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.schedule.delay(self.index);
        self.index = (self.index + 1) % self.schedule.len();
        delay
    }

    /// Back to the first step
    pub fn reset(&mut self) {
        self.index = 0;
    }

    /// Current position in the schedule
    pub fn position(&self) -> usize {
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_cycles() {
        let mut backoff = Backoff::new(BackoffSchedule::default());
        let secs: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![1, 4, 9, 16, 1]);
        assert_eq!(backoff.position(), 1);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(BackoffSchedule::from_secs(&[2, 3]).unwrap());
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.position(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }
}
