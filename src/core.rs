//! Core server functionality
//!
//! This module provides:
//! - The server tick rate driving the timer loop
//! - A monotonic millisecond tick clock

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Server tick rate in nanoseconds (10ms = 10,000,000 ns)
/// This controls how often the timer queue is polled
pub const SERVER_TICK_RATE_NS: u64 = 10_000_000;

/// Server tick rate as a Duration for convenience
pub const SERVER_TICK_RATE: Duration = Duration::from_nanos(SERVER_TICK_RATE_NS);

/// Millisecond tick counter type
pub type Tick = u64;

static START: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed on a monotonic clock since the first call
pub fn gettick() -> Tick {
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as Tick
}

/// Signed difference `a - b` between two ticks
pub fn diff_tick(a: Tick, b: Tick) -> i64 {
    a.wrapping_sub(b) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(SERVER_TICK_RATE_NS, 10_000_000);
        assert_eq!(SERVER_TICK_RATE, Duration::from_millis(10));
    }

    #[test]
    fn test_gettick_is_monotonic() {
        let a = gettick();
        std::thread::sleep(Duration::from_millis(2));
        let b = gettick();
        assert!(b >= a);
    }

    #[test]
    fn test_diff_tick() {
        assert_eq!(diff_tick(150, 100), 50);
        assert_eq!(diff_tick(100, 150), -50);
    }
}
