// Reconnect policy for the primary channel
// Bounded exponential backoff: delay = base_delay * growth_factor^(attempt - 1)

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts scheduled since the last successful open
    attempts: u32,
    max_attempts: u32,
    base_delay: Duration,
    growth_factor: f64,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, growth_factor: f64) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            base_delay,
            growth_factor,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// No further automatic reconnect may be scheduled
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Delay before the given (1-based) attempt, rounded to whole milliseconds
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.growth_factor.powi(exponent);
        Duration::from_millis(millis.round() as u64)
    }

    /// Count a new attempt and return its delay, or None once exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        Some(self.delay_for(self.attempts))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth() {
        let mut policy = ReconnectPolicy::new(5, Duration::from_millis(3000), 1.5);
        let delays: Vec<u128> = (0..4)
            .map(|_| policy.next_delay().unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![3000, 4500, 6750, 10125]);
        assert_eq!(policy.attempts(), 4);
    }

    #[test]
    fn test_exhaustion_and_reset() {
        let mut policy = ReconnectPolicy::new(2, Duration::from_millis(100), 2.0);
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.is_exhausted());
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempts(), 2);

        policy.reset();
        assert!(!policy.is_exhausted());
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_zero_attempts_never_schedules() {
        let mut policy = ReconnectPolicy::new(0, Duration::from_millis(3000), 1.5);
        assert!(policy.is_exhausted());
        assert_eq!(policy.next_delay(), None);
    }
}
