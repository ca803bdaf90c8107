use std::time::Instant;

/// Source of the millisecond timestamps that drive `Session::update`. Timestamps are `u32` and
///  wrap around after ~49 days; all comparisons go through [time_diff].
#[cfg_attr(test, mockall::automock)]
pub trait Clock {
    fn now_millis(&self) -> u32;
}

/// Milliseconds elapsed since the clock was created
pub struct MonotonicClock {
    start: Instant,
}
impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            start: Instant::now(),
        }
    }
}
impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
impl Clock for MonotonicClock {
    fn now_millis(&self) -> u32 {
        // truncation is intended: timestamps wrap
        self.start.elapsed().as_millis() as u32
    }
}

/// Signed distance from `earlier` to `later`, treating both as points on a wrapping 32 bit clock
pub fn time_diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}
