use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A timestamp gate: `should_output(interval)` returns true at most once per
/// interval. Used to rate-limit progress logging inside long loops.
#[derive(Debug, Default)]
pub struct Throttle {
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_output(&self, interval: Duration) -> bool {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    pub fn reset(&self) {
        *self.last.lock().unwrap() = None;
    }
}
