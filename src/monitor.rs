//! Debounced threshold and tolerance checks over live sensor readings.
//!
//! A single instantaneous low pressure reading is not reliable evidence of a
//! stable vacuum, so threshold crossings are accepted only after a configured
//! number of consecutive qualifying readings ([`ReachCounter`]). Thermal
//! readings are comparatively stable, so the at-setpoint check
//! ([`within_tolerance`]) takes a single qualifying reading.

use tracing::debug;

/// Consecutive-reading confirmation counter for one pressure threshold.
///
/// The counter increments only on consecutive readings strictly below the
/// target; any reading at or above the target, a non-finite reading, or a
/// non-positive reading (sensor unavailable) resets it to zero. "Reached"
/// is declared exactly when the count hits the required number, after which
/// the counter resets.
#[derive(Clone, Debug)]
pub struct ReachCounter {
    current: u32,
    required: u32,
    target: f64,
}

impl ReachCounter {
    /// A fresh counter for the given target pressure and confirmation count.
    pub fn new(target: f64, required: u32) -> Self {
        Self {
            current: 0,
            required: required.max(1),
            target,
        }
    }

    /// Feed one reading; returns `true` exactly once per qualifying streak
    /// of the required length.
    pub fn register(&mut self, reading: f64) -> bool {
        if !reading.is_finite() || reading <= 0.0 || reading >= self.target {
            if self.current != 0 {
                debug!(
                    reading,
                    target = self.target,
                    dropped = self.current,
                    "Threshold streak broken"
                );
            }
            self.current = 0;
            return false;
        }

        self.current += 1;
        if self.current >= self.required {
            debug!(
                reading,
                target = self.target,
                confirmations = self.required,
                "Threshold stably reached"
            );
            self.current = 0;
            return true;
        }
        false
    }

    /// Current streak length and the required count, for progress reporting.
    pub fn progress(&self) -> (u32, u32) {
        (self.current, self.required)
    }

    /// Target this counter confirms against.
    pub fn target(&self) -> f64 {
        self.target
    }
}

/// Symmetric band check for "present value at setpoint".
///
/// No debounce: one qualifying reading is sufficient.
pub fn within_tolerance(present: f64, setpoint: f64, tolerance: f64) -> bool {
    present.is_finite() && (present - setpoint).abs() <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reached_after_consecutive_qualifying_readings() {
        // Target 1e-5 Torr, three confirmations; the first two readings are
        // above target, then three consecutive qualifying ones.
        let mut counter = ReachCounter::new(1e-5, 3);
        let readings = [2e-5, 2e-5, 9e-6, 9e-6, 8e-6];
        let fired: Vec<bool> = readings.iter().map(|r| counter.register(*r)).collect();
        assert_eq!(fired, vec![false, false, false, false, true]);
        // Counter resets after firing
        assert_eq!(counter.progress(), (0, 3));
    }

    #[test]
    fn test_disqualifying_reading_resets_streak() {
        let mut counter = ReachCounter::new(1e-5, 3);
        assert!(!counter.register(9e-6));
        assert!(!counter.register(9e-6));
        assert_eq!(counter.progress(), (2, 3));
        // One excursion discards the whole streak
        assert!(!counter.register(2e-5));
        assert_eq!(counter.progress(), (0, 3));
        assert!(!counter.register(9e-6));
        assert!(!counter.register(9e-6));
        assert!(counter.register(9e-6));
    }

    #[test]
    fn test_count_never_exceeds_required() {
        let mut counter = ReachCounter::new(1e-5, 2);
        for i in 0..10 {
            let fired = counter.register(5e-6);
            let (current, required) = counter.progress();
            assert!(current <= required);
            // Fires on every second qualifying reading, never otherwise
            assert_eq!(fired, i % 2 == 1);
        }
    }

    #[test]
    fn test_invalid_readings_reset() {
        let mut counter = ReachCounter::new(1e-5, 2);
        assert!(!counter.register(9e-6));
        // Sensor unavailable readings are disqualifying
        assert!(!counter.register(-1.0));
        assert_eq!(counter.progress(), (0, 2));
        assert!(!counter.register(9e-6));
        assert!(!counter.register(f64::NAN));
        assert_eq!(counter.progress(), (0, 2));
        assert!(!counter.register(0.0));
        assert_eq!(counter.progress(), (0, 2));
    }

    #[test]
    fn test_single_confirmation_fires_immediately() {
        let mut counter = ReachCounter::new(1e-5, 1);
        assert!(counter.register(9e-6));
        assert!(!counter.register(2e-5));
        assert!(counter.register(9e-6));
    }

    #[test]
    fn test_within_tolerance_band() {
        // Heater at 99 °C against a 100 °C setpoint with ±3 tolerance
        assert!(within_tolerance(99.0, 100.0, 3.0));
        assert!(within_tolerance(103.0, 100.0, 3.0));
        assert!(!within_tolerance(80.0, 100.0, 3.0));
        assert!(!within_tolerance(104.0, 100.0, 3.0));
        assert!(!within_tolerance(f64::NAN, 100.0, 3.0));
    }
}
