//! Periodic trigger predicate
//!
//! Every periodic action in the driver (print, visualize, checkpoint,
//! backup, validate) shares this one cadence rule, each with its own
//! interval evaluated against the same iteration counter.

/// Fires every `every` iterations; an interval of 0 disables the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicTrigger {
    every: u64,
}

impl PeriodicTrigger {
    /// Create a trigger with the given cadence
    pub fn new(every: u64) -> Self {
        Self { every }
    }

    /// A trigger that never fires
    pub fn disabled() -> Self {
        Self { every: 0 }
    }

    /// The configured cadence
    pub fn interval(&self) -> u64 {
        self.every
    }

    /// Whether the trigger fires at this iteration. Pure function of the
    /// interval and the iteration counter; negative iterations (the -1
    /// pre-start sentinel) never fire.
    pub fn fires(&self, it: i64) -> bool {
        self.every > 0 && it >= 0 && it % self.every as i64 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(1 ; "every iteration")]
    #[test_case(3 ; "every third")]
    #[test_case(500 ; "checkpoint default")]
    fn test_fires_on_exact_multiples(every: u64) {
        let trigger = PeriodicTrigger::new(every);
        for it in 0..2_000i64 {
            assert_eq!(trigger.fires(it), it % every as i64 == 0, "it={}", it);
        }
    }

    #[test]
    fn test_zero_interval_never_fires() {
        let trigger = PeriodicTrigger::new(0);
        for it in -1..1_000i64 {
            assert!(!trigger.fires(it));
        }
        assert_eq!(trigger, PeriodicTrigger::disabled());
    }

    #[test]
    fn test_fires_at_iteration_zero() {
        // Iteration 0 is divisible by everything; callers that must not
        // act before the first step (validation) add their own it > 0
        // guard on top.
        assert!(PeriodicTrigger::new(5).fires(0));
    }

    #[test]
    fn test_sentinel_iteration_never_fires() {
        assert!(!PeriodicTrigger::new(1).fires(-1));
        assert!(!PeriodicTrigger::new(5).fires(-5));
    }
}
