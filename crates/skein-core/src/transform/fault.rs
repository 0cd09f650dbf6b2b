//! Fault injection settings for the debug transform.

use std::{
    sync::atomic::{AtomicU8, AtomicU64, Ordering},
    time::Duration,
};

use rand::Rng;

/// Runtime-adjustable lag and drop simulation for inbound frames.
///
/// Shared through an `Arc` so a test or an operator console can change the
/// settings while connections are live. Changes are not synchronised with
/// frames already being decoded.
#[derive(Debug, Default)]
pub struct FaultInjection {
    lag_ms: AtomicU64,
    drop_percent: AtomicU8,
}

impl FaultInjection {
    /// Settings with no lag and no drops.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stall every inbound frame for `lag`, or disable with `None`.
    pub fn set_lag(&self, lag: Option<Duration>) {
        let ms = lag.map_or(0, |d| d.as_millis().min(u128::from(u64::MAX)) as u64);
        self.lag_ms.store(ms, Ordering::Relaxed);
    }

    /// Current lag, if enabled.
    pub fn lag(&self) -> Option<Duration> {
        match self.lag_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Drop this percentage of inbound frames. Values above 100 clamp.
    pub fn set_drop_percent(&self, percent: u8) {
        self.drop_percent.store(percent.min(100), Ordering::Relaxed);
    }

    /// Current drop percentage.
    pub fn drop_percent(&self) -> u8 {
        self.drop_percent.load(Ordering::Relaxed)
    }

    /// Roll for whether the next inbound frame is dropped.
    pub fn should_drop(&self) -> bool {
        match self.drop_percent() {
            0 => false,
            100.. => true,
            percent => rand::thread_rng().gen_range(0..100) < percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_inert() {
        let faults = FaultInjection::new();
        assert_eq!(faults.lag(), None);
        assert_eq!(faults.drop_percent(), 0);
        assert!((0..1000).all(|_| !faults.should_drop()));
    }

    #[test]
    fn full_drop_always_drops() {
        let faults = FaultInjection::new();
        faults.set_drop_percent(100);
        assert!((0..1000).all(|_| faults.should_drop()));
    }

    #[test]
    fn drop_percent_clamps() {
        let faults = FaultInjection::new();
        faults.set_drop_percent(250);
        assert_eq!(faults.drop_percent(), 100);
    }

    #[test]
    fn partial_drop_rate_is_roughly_honoured() {
        let faults = FaultInjection::new();
        faults.set_drop_percent(50);
        let dropped = (0..10_000).filter(|_| faults.should_drop()).count();
        assert!((4_000..6_000).contains(&dropped), "dropped {dropped}");
    }

    #[test]
    fn lag_can_be_toggled() {
        let faults = FaultInjection::new();
        faults.set_lag(Some(Duration::from_millis(120)));
        assert_eq!(faults.lag(), Some(Duration::from_millis(120)));
        faults.set_lag(None);
        assert_eq!(faults.lag(), None);
    }
}
