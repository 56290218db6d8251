use std::time::Duration;

pub const BACKOFF_INITIAL_UNITS: u32 = 1;
pub const BACKOFF_MAX_UNITS: u32 = 10;

/// Reconnect delay that doubles per consecutive failure, capped at
/// [`BACKOFF_MAX_UNITS`] units.
#[derive(Debug, Clone)]
pub struct Backoff {
    unit: Duration,
    current: u32,
}

impl Backoff {
    pub fn new(unit: Duration) -> Self {
        Self {
            unit,
            current: BACKOFF_INITIAL_UNITS,
        }
    }

    /// Delay to wait before the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.unit.saturating_mul(self.current);
        self.current = self.current.saturating_mul(2).min(BACKOFF_MAX_UNITS);
        delay
    }

    pub fn reset(&mut self) {
        self.current = BACKOFF_INITIAL_UNITS;
    }

    pub fn current_units(&self) -> u32 {
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap() {
        let mut backoff = Backoff::default();
        let seconds = (0..8)
            .map(|_| backoff.next_delay().as_secs())
            .collect::<Vec<_>>();
        assert_eq!(seconds, vec![1, 2, 4, 8, 10, 10, 10, 10]);
    }

    #[test]
    fn reset_starts_over_at_one_unit() {
        let mut backoff = Backoff::new(Duration::from_millis(100));
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current_units(), 8);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
    }
}
