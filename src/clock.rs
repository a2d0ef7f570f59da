use std::{
    fmt,
    ops::{Add, Sub},
    time::Duration,
};

/// Monotonic time since the node started, in milliseconds.
///
/// The firmware has no wall clock. Every deadline in this crate is expressed
/// as an `Instant`, so tests and the simulator can drive time explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant {
    millis: u64,
}

impl Instant {
    pub const ZERO: Instant = Instant { millis: 0 };

    pub const fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self {
            millis: secs * 1000,
        }
    }

    pub const fn as_millis(&self) -> u64 {
        self.millis
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        Duration::from_millis(self.millis.saturating_sub(earlier.millis))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        let millis = u64::try_from(rhs.as_millis()).unwrap_or(u64::MAX);
        Instant {
            millis: self.millis.saturating_add(millis),
        }
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        self.saturating_duration_since(rhs)
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}s", self.millis / 1000, self.millis % 1000)
    }
}

/// Time source plus the poll-loop wait primitive.
pub trait Clock {
    fn now(&self) -> Instant;

    /// Block (or pretend to) until `period` has passed.
    fn wait(&mut self, period: Duration);
}

/// Wall-clock backed time for host builds.
pub struct SystemClock {
    started: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        let elapsed = self.started.elapsed().as_millis();
        Instant::from_millis(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }

    fn wait(&mut self, period: Duration) {
        std::thread::sleep(period);
    }
}

/// Virtual time that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Instant,
}

impl ManualClock {
    pub fn new(start: Instant) -> Self {
        Self { now: start }
    }

    pub fn advance(&mut self, by: Duration) -> Instant {
        self.now = self.now + by;
        self.now
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now
    }

    fn wait(&mut self, period: Duration) {
        self.advance(period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_arithmetic_saturates() {
        let t = Instant::from_secs(5);
        assert_eq!(t + Duration::from_millis(250), Instant::from_millis(5250));
        assert_eq!(Instant::from_secs(2) - t, Duration::ZERO);
        assert_eq!(t - Instant::from_secs(2), Duration::from_secs(3));
        assert_eq!(t + Duration::MAX, Instant::from_millis(u64::MAX));
    }

    #[test]
    fn manual_clock_moves_on_wait() {
        let mut clock = ManualClock::new(Instant::from_secs(1));
        clock.wait(Duration::from_millis(100));
        assert_eq!(clock.now(), Instant::from_millis(1100));
        assert_eq!(format!("{}", clock.now()), "1.100s");
    }
}
