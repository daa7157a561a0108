//! Clock-driven state machines
//!
//! These never sleep or spawn anything; callers pass `Instant`s in and arm a
//! timer for the returned deadline. That keeps them trivially testable.

use std::time::{Duration, Instant};

pub const DEFAULT_RENDER_INTERVAL: Duration = Duration::from_millis(150);
pub const DEFAULT_TAIL_DEBOUNCE: Duration = Duration::from_millis(500);

// ============================================================================
// Render throttle
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderDecision {
    /// Draw right away
    Now,
    /// A trailing redraw was scheduled for this instant
    Scheduled(Instant),
    /// A trailing redraw is already pending; nothing to do
    AlreadyScheduled,
}

/// At most one redraw per interval, with exactly one trailing redraw for
/// requests that land inside the interval.
#[derive(Clone, Debug)]
pub struct RenderThrottle {
    interval: Duration,
    last_render: Option<Instant>,
    trailing: Option<Instant>,
}

impl RenderThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_render: None,
            trailing: None,
        }
    }

    pub fn request(&mut self, now: Instant) -> RenderDecision {
        if self.trailing.is_some() {
            return RenderDecision::AlreadyScheduled;
        }
        match self.last_render {
            Some(last) if now.duration_since(last) < self.interval => {
                let at = last + self.interval;
                self.trailing = Some(at);
                RenderDecision::Scheduled(at)
            }
            _ => RenderDecision::Now,
        }
    }

    /// Record a completed redraw; clears any pending trailing redraw
    pub fn rendered(&mut self, now: Instant) {
        self.last_render = Some(now);
        self.trailing = None;
    }

    /// Pending trailing redraw, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.trailing
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.trailing.is_some_and(|at| now >= at)
    }

    pub fn cancel(&mut self) {
        self.trailing = None;
    }
}

impl Default for RenderThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_RENDER_INTERVAL)
    }
}

// ============================================================================
// Debouncer
// ============================================================================

/// Holds the latest value until it has been left alone for `delay`
#[derive(Clone, Debug)]
pub struct Debouncer<T> {
    delay: Duration,
    pending: Option<(T, Instant)>,
}

impl<T> Debouncer<T> {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    /// Replace the pending value and restart the clock
    pub fn schedule(&mut self, value: T, now: Instant) -> Instant {
        let at = now + self.delay;
        self.pending = Some((value, at));
        at
    }

    /// Take the value once its deadline has passed
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        match &self.pending {
            Some((_, at)) if now >= *at => self.pending.take().map(|(value, _)| value),
            _ => None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(_, at)| *at)
    }

    pub fn cancel(&mut self) -> Option<T> {
        self.pending.take().map(|(value, _)| value)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_first_request_renders_now() {
        let mut t = RenderThrottle::default();
        assert_eq!(t.request(Instant::now()), RenderDecision::Now);
    }

    #[test]
    fn test_burst_collapses_into_one_trailing_render() {
        let start = Instant::now();
        let mut t = RenderThrottle::new(ms(150));
        t.rendered(start);

        assert_eq!(
            t.request(start + ms(10)),
            RenderDecision::Scheduled(start + ms(150))
        );
        assert_eq!(t.request(start + ms(20)), RenderDecision::AlreadyScheduled);
        assert_eq!(t.request(start + ms(140)), RenderDecision::AlreadyScheduled);

        assert!(!t.is_due(start + ms(100)));
        assert!(t.is_due(start + ms(150)));
        t.rendered(start + ms(150));
        assert_eq!(t.deadline(), None);

        assert_eq!(t.request(start + ms(400)), RenderDecision::Now);
    }

    #[test]
    fn test_cancel_drops_trailing() {
        let start = Instant::now();
        let mut t = RenderThrottle::new(ms(150));
        t.rendered(start);
        t.request(start + ms(1));
        t.cancel();
        assert_eq!(t.deadline(), None);
    }

    #[test]
    fn test_five_quick_moves_fire_once_for_last() {
        let start = Instant::now();
        let mut d = Debouncer::new(ms(500));
        for row in 0..5u64 {
            let now = start + ms(row * 100);
            d.schedule(row, now);
            assert_eq!(d.poll(now), None);
        }
        // last move at 400ms, so nothing until 900ms
        assert_eq!(d.poll(start + ms(899)), None);
        assert_eq!(d.poll(start + ms(900)), Some(4));
        assert_eq!(d.poll(start + ms(2000)), None);
    }

    #[test]
    fn test_debounce_cancel() {
        let start = Instant::now();
        let mut d = Debouncer::new(ms(500));
        d.schedule("api", start);
        assert!(d.is_pending());
        assert_eq!(d.cancel(), Some("api"));
        assert_eq!(d.deadline(), None);
        assert_eq!(d.poll(start + ms(600)), None);
    }
}
