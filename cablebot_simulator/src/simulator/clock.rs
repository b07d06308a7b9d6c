//! Simulation clock shared between the plant driver and the control core

use cablebot_shared::TimeInterface;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

/// Simulation clock
///
/// Clones share the same elapsed time, so the clock handed to the supervisor moves
/// whenever the harness advances its own copy.
#[derive(Debug, Clone)]
pub struct SimClock {
    origin: Instant,
    wall_origin: SystemTime,
    elapsed: Arc<Mutex<Duration>>,
}

impl SimClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: SystemTime::now(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, dt: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(|e| e.into_inner());
        *elapsed += dt;
    }

    pub fn current_time(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeInterface for SimClock {
    fn now_monotonic(&self) -> Instant {
        self.origin + self.current_time()
    }

    fn now_wallclock(&self) -> SystemTime {
        self.wall_origin + self.current_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_elapsed_time() {
        let clock = SimClock::new();
        let handle = clock.clone();
        let start = handle.now_monotonic();
        clock.advance(Duration::from_millis(600));
        assert_eq!(handle.now_monotonic() - start, Duration::from_millis(600));
        handle.advance(Duration::from_millis(400));
        assert_eq!(clock.current_time(), Duration::from_secs(1));
        assert_eq!(handle.now_wallclock(), clock.now_wallclock());
    }
}
