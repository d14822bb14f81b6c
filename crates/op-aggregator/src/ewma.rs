use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EwmaConfig {
    /// Interval at which pending events are folded into the rate.
    pub tick_interval: Duration,
    /// Averaging window; together with the tick interval fixes the decay.
    pub time_period: Duration,
}

impl EwmaConfig {
    pub fn new(tick_interval: Duration, time_period: Duration) -> Self {
        Self {
            tick_interval,
            time_period,
        }
    }

    fn alpha(&self) -> f64 {
        let tick = self.tick_interval.as_secs_f64();
        let period = self.time_period.as_secs_f64().max(f64::EPSILON);
        1.0 - (-tick / period).exp()
    }
}

impl Default for EwmaConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            time_period: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Ewma
// ---------------------------------------------------------------------------

/// Exponentially decaying event-rate estimator.
///
/// `update` counts an event; every elapsed tick folds the pending count into
/// the rate. Ticks are applied lazily from the monotonic clock whenever the
/// meter is touched, so a meter needs no timer task and nothing to stop when
/// its owner is dropped.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    tick_interval: Duration,
    /// Events per millisecond.
    rate: f64,
    pending: u64,
    initialized: bool,
    last_tick: Instant,
}

impl Ewma {
    pub fn new(config: EwmaConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    pub fn new_at(config: EwmaConfig, now: Instant) -> Self {
        Self {
            alpha: config.alpha(),
            tick_interval: config.tick_interval,
            rate: 0.0,
            pending: 0,
            initialized: false,
            last_tick: now,
        }
    }

    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    pub fn update_at(&mut self, now: Instant) {
        self.catch_up(now);
        self.pending += 1;
    }

    /// Fold the pending count into the rate immediately.
    pub fn tick(&mut self) {
        let tick_ms = self.tick_interval.as_secs_f64() * 1000.0;
        let instant_rate = if tick_ms > 0.0 {
            self.pending as f64 / tick_ms
        } else {
            0.0
        };
        self.pending = 0;
        if self.initialized {
            self.rate += self.alpha * (instant_rate - self.rate);
        } else {
            self.rate = instant_rate;
            self.initialized = true;
        }
    }

    pub fn rate(&mut self, unit: Duration) -> f64 {
        self.rate_at(unit, Instant::now())
    }

    /// Current rate scaled to `unit` (e.g. one second for events/s).
    ///
    /// Before the first tick the rate the first tick would produce is
    /// reported, so a fresh meter with events is never read as idle.
    pub fn rate_at(&mut self, unit: Duration, now: Instant) -> f64 {
        self.catch_up(now);
        let unit_ms = unit.as_secs_f64() * 1000.0;
        if !self.initialized && self.pending > 0 {
            let tick_ms = self.tick_interval.as_secs_f64() * 1000.0;
            return self.pending as f64 / tick_ms * unit_ms;
        }
        self.rate * unit_ms
    }

    fn catch_up(&mut self, now: Instant) {
        let tick_nanos = self.tick_interval.as_nanos();
        if tick_nanos == 0 {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_tick);
        let ticks = elapsed.as_nanos() / tick_nanos;
        if ticks == 0 {
            return;
        }

        // First elapsed tick folds the pending events; the rest saw none.
        self.tick();
        let idle = (ticks - 1).min(i32::MAX as u128) as i32;
        if idle > 0 {
            self.rate *= (1.0 - self.alpha).powi(idle);
        }

        let remainder = Duration::from_nanos((elapsed.as_nanos() % tick_nanos) as u64);
        self.last_tick = now - remainder;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn fresh_meter_reads_zero() {
        let mut m = Ewma::new(EwmaConfig::default());
        assert_eq!(m.rate(SECOND), 0.0);
    }

    #[test]
    fn pending_events_are_visible_before_first_tick() {
        let start = Instant::now();
        let mut m = Ewma::new_at(EwmaConfig::default(), start);
        for _ in 0..10 {
            m.update_at(start);
        }
        // 10 events over a 5s tick = 2 events/s
        assert!((m.rate_at(SECOND, start) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn explicit_tick_initializes_rate() {
        let start = Instant::now();
        let mut m = Ewma::new_at(EwmaConfig::default(), start);
        m.update_at(start);
        m.tick();
        assert!((m.rate_at(SECOND, start) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn idle_ticks_decay_the_rate() {
        let start = Instant::now();
        let config = EwmaConfig::default();
        let mut m = Ewma::new_at(config, start);
        for _ in 0..50 {
            m.update_at(start);
        }
        let first = m.rate_at(SECOND, start + Duration::from_secs(5));
        assert!((first - 10.0).abs() < 1e-9);

        let later = m.rate_at(SECOND, start + Duration::from_secs(65));
        assert!(later < first);
        let expected = first * (1.0 - config.alpha()).powi(12);
        assert!((later - expected).abs() < 1e-9);
    }

    #[test]
    fn steady_stream_converges_to_true_rate() {
        let start = Instant::now();
        let mut m = Ewma::new_at(EwmaConfig::default(), start);
        // 3 events every second for 10 minutes.
        for s in 0..600u64 {
            let t = start + Duration::from_secs(s);
            for _ in 0..3 {
                m.update_at(t);
            }
        }
        let r = m.rate_at(SECOND, start + Duration::from_secs(600));
        assert!((r - 3.0).abs() < 0.05, "rate was {r}");
    }

    #[test]
    fn long_idle_does_not_overflow() {
        let start = Instant::now();
        let mut m = Ewma::new_at(EwmaConfig::default(), start);
        m.update_at(start);
        let r = m.rate_at(SECOND, start + Duration::from_secs(60 * 60 * 24 * 365));
        assert!(r >= 0.0 && r < 1e-6);
    }
}
