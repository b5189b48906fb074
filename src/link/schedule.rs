use std::cell::Cell;
use std::time::{Duration, Instant};

/// Coalesces redraw requests: at most one redraw is ever pending, and the
/// host drains it once per animation frame.
#[derive(Debug, Default)]
pub struct FrameScheduler {
    pending: Cell<bool>,
    coalesced: Cell<u64>,
    frames: Cell<u64>,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when this request scheduled a new frame, `false` when
    /// it folded into one already pending.
    pub fn request(&self) -> bool {
        if self.pending.replace(true) {
            self.coalesced.set(self.coalesced.get() + 1);
            false
        } else {
            true
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.get()
    }

    /// Fire the pending frame, if any.
    pub fn take(&self) -> bool {
        let fired = self.pending.replace(false);
        if fired {
            self.frames.set(self.frames.get() + 1);
        }
        fired
    }

    pub fn cancel(&self) {
        self.pending.set(false);
    }

    pub fn frames_fired(&self) -> u64 {
        self.frames.get()
    }

    pub fn requests_coalesced(&self) -> u64 {
        self.coalesced.get()
    }
}

/// Trailing-edge debounce over a value; polled by the owner's frame tick.
///
/// Scheduling again inside the window replaces both the value and the
/// deadline. Dropping the debouncer discards whatever is pending.
#[derive(Debug)]
pub struct Debouncer<T> {
    delay: Duration,
    pending: Option<(Instant, T)>,
}

impl<T> Debouncer<T> {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn schedule(&mut self, now: Instant, value: T) {
        self.pending = Some((now + self.delay, value));
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(deadline, _)| *deadline)
    }

    /// Release the value once its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        match &self.pending {
            Some((deadline, _)) if *deadline <= now => self.pending.take().map(|(_, value)| value),
            _ => None,
        }
    }

    /// Release the value immediately, deadline or not.
    pub fn flush(&mut self) -> Option<T> {
        self.pending.take().map(|(_, value)| value)
    }

    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }
}
