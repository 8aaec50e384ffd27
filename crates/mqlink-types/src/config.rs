//! Client configuration for mqlink
//!
//! Every field has a default, so an empty config source yields the
//! behavior of the reference client: a 5-retry publish budget, a one
//! second nack pause and a `[1, 4, 9, 16]` second reconnect schedule.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Fixed cyclic sequence of wait durations used between consecutive retries
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<u64>")]
pub struct BackoffSchedule {
    steps: Vec<Duration>,
}

impl BackoffSchedule {
    /// Create a schedule from explicit durations (must be non-empty)
    pub fn new(steps: Vec<Duration>) -> Result<Self> {
        if steps.is_empty() {
            return Err(Error::Config("backoff schedule must not be empty".to_string()));
        }
        Ok(Self { steps })
    }

    /// Create a schedule from whole seconds (must be non-empty)
    pub fn from_secs(secs: &[u64]) -> Result<Self> {
        Self::new(secs.iter().copied().map(Duration::from_secs).collect())
    }

    /// Single zero-length step, for tests that should not wait
    pub fn immediate() -> Self {
        Self {
            steps: vec![Duration::ZERO],
        }
    }

    /// Delay at the given position, wrapping around the end
    pub fn delay(&self, index: usize) -> Duration {
        self.steps[index % self.steps.len()]
    }

    /// Number of distinct steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always false; an empty schedule cannot be constructed
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The steps in order
    pub fn steps(&self) -> &[Duration] {
        &self.steps
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            steps: [1, 4, 9, 16].into_iter().map(Duration::from_secs).collect(),
        }
    }
}

impl TryFrom<Vec<u64>> for BackoffSchedule {
    type Error = Error;

    fn try_from(secs: Vec<u64>) -> Result<Self> {
        Self::from_secs(&secs)
    }
}

/// What the producer does with a message whose publish budget ran out
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Back off and try the same message again; nothing is lost
    #[default]
    Retry,
    /// Log and discard the message
    Drop,
    /// Publish the message once to the named queue, then move on
    DeadLetter(String),
}

/// Producer/consumer client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Backlog capacity (0 = synchronous hand-off to the delivery loop)
    #[serde(default)]
    pub backlog: usize,

    /// Extra publish attempts per delivery cycle
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,

    /// Pause after a broker nack before the next attempt, in milliseconds
    #[serde(default = "default_nack_pause_ms")]
    pub nack_pause_ms: u64,

    /// Reconnect and redelivery backoff, in seconds
    #[serde(default)]
    pub backoff: BackoffSchedule,

    /// Policy for messages that exhaust their publish budget
    #[serde(default)]
    pub exhaustion: ExhaustionPolicy,

    /// Content type stamped on every published message
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_max_retry() -> u32 {
    5
}

fn default_nack_pause_ms() -> u64 {
    1000
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backlog: 0,
            max_retry: default_max_retry(),
            nack_pause_ms: default_nack_pause_ms(),
            backoff: BackoffSchedule::default(),
            exhaustion: ExhaustionPolicy::default(),
            content_type: default_content_type(),
        }
    }
}

impl ClientConfig {
    /// Set the backlog capacity
    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the per-cycle retry budget
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Set the backoff schedule
    pub fn with_backoff(mut self, backoff: BackoffSchedule) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the exhaustion policy
    pub fn with_exhaustion(mut self, exhaustion: ExhaustionPolicy) -> Self {
        self.exhaustion = exhaustion;
        self
    }

    /// Pause after a nack
    pub fn nack_pause(&self) -> Duration {
        Duration::from_millis(self.nack_pause_ms)
    }

    /// Check invariants that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        if self.backoff.is_empty() {
            return Err(Error::Config("backoff schedule must not be empty".to_string()));
        }
        if let ExhaustionPolicy::DeadLetter(queue) = &self.exhaustion {
            if queue.trim().is_empty() {
                return Err(Error::Config("dead-letter queue name is empty".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule_wraps() {
        let schedule = BackoffSchedule::default();
        let secs: Vec<u64> = (0..6).map(|i| schedule.delay(i).as_secs()).collect();
        assert_eq!(secs, vec![1, 4, 9, 16, 1, 4]);
    }

    #[test]
    fn test_empty_schedule_rejected() {
        assert!(BackoffSchedule::from_secs(&[]).is_err());
        assert!(serde_json::from_str::<BackoffSchedule>("[]").is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config: ClientConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.backlog, 0);
        assert_eq!(config.max_retry, 5);
        assert_eq!(config.nack_pause(), Duration::from_secs(1));
        assert_eq!(config.backoff, BackoffSchedule::default());
        assert_eq!(config.exhaustion, ExhaustionPolicy::Retry);
        assert_eq!(config.content_type, "text/plain");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_overrides() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"backlog": 5, "backoff": [2, 3], "exhaustion": {"dead_letter": "dlq"}}"#,
        )
        .unwrap();
        assert_eq!(config.backlog, 5);
        assert_eq!(config.backoff.steps(), &[Duration::from_secs(2), Duration::from_secs(3)]);
        assert_eq!(config.exhaustion, ExhaustionPolicy::DeadLetter("dlq".to_string()));

        let dropping: ClientConfig = serde_json::from_str(r#"{"exhaustion": "drop"}"#).unwrap();
        assert_eq!(dropping.exhaustion, ExhaustionPolicy::Drop);
    }

    #[test]
    fn test_blank_dead_letter_rejected() {
        let config =
            ClientConfig::default().with_exhaustion(ExhaustionPolicy::DeadLetter(" ".into()));
        assert!(config.validate().is_err());
    }
}
