#[cfg(test)]
use mockall::automock;
use std::time::{Instant, SystemTime};

/// The two time sources the scheduler runs against, injected so tests can
///  drive them directly.
///
/// `global_time` is the network wide scheduling timebase: all switches are
/// assumed to be disciplined to it externally, and flow offsets are phases
/// within it. `wall_now` is the local high resolution clock that deadlines
/// and the busy wait are measured against. The two advance at the same rate
/// but have unrelated zero points, so code only ever mixes them through
/// durations.
#[cfg_attr(test, automock)]
pub trait TtClock: Send + Sync + 'static {
    /// Globally aligned scheduling time in nanoseconds.
    fn global_time(&self) -> u64;

    /// Local high resolution time in nanoseconds, monotonic.
    fn wall_now(&self) -> u64;
}

/// Clock backed by the operating system: wall time from a monotonic anchor,
///  global time from the (externally synchronized) system clock.
pub struct SystemClock {
    anchor: Instant,
}

impl SystemClock {
    pub fn new() -> SystemClock {
        SystemClock {
            anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TtClock for SystemClock {
    fn global_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or(0)
    }

    fn wall_now(&self) -> u64 {
        self.anchor.elapsed().as_nanos() as u64
    }
}
