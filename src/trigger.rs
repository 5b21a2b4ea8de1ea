use std::time::{Duration, Instant};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);
pub const DEFAULT_PREFETCH_MARGIN: usize = 6;

#[derive(Debug, Clone)]
pub struct ProximityGate {
    window: Duration,
    last: Option<Instant>,
}

impl Default for ProximityGate {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl ProximityGate {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn offer(&mut self, now: Instant, busy: bool) -> bool {
        if busy {
            return false;
        }
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.window => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

pub fn near_end(position: usize, len: usize, margin: usize) -> bool {
    if len == 0 {
        return true;
    }
    position.saturating_add(margin).saturating_add(1) >= len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_trigger_per_window() {
        let mut gate = ProximityGate::new(Duration::from_millis(100));
        let start = Instant::now();
        assert!(gate.offer(start, false));
        assert!(!gate.offer(start + Duration::from_millis(10), false));
        assert!(!gate.offer(start + Duration::from_millis(99), false));
        assert!(gate.offer(start + Duration::from_millis(100), false));
    }

    #[test]
    fn busy_signals_are_dropped() {
        let mut gate = ProximityGate::new(Duration::from_millis(100));
        let start = Instant::now();
        assert!(!gate.offer(start, true));
        assert!(gate.offer(start + Duration::from_millis(1), false));
    }

    #[test]
    fn reset_reopens_gate() {
        let mut gate = ProximityGate::default();
        let start = Instant::now();
        assert!(gate.offer(start, false));
        gate.reset();
        assert!(gate.offer(start, false));
    }

    #[test]
    fn near_end_margin() {
        assert!(near_end(0, 0, 6));
        assert!(!near_end(0, 18, 6));
        assert!(!near_end(10, 18, 6));
        assert!(near_end(11, 18, 6));
        assert!(near_end(17, 18, 0));
        assert!(!near_end(16, 18, 0));
    }
}
