use std::time::Duration;

use tokio::time::Instant;

/// Coalesces a fast stream of snapshots into at most one per `interval`.
///
/// The first value after a quiet period goes out immediately; values arriving
/// inside the window replace each other and the latest one is due when the
/// window closes. `flush` hands back whatever is still held so the final
/// state is never lost. The caller owns the timer: it sleeps until
/// `deadline()` and then calls `take_due()`.
#[derive(Debug)]
pub struct Throttle<T> {
    interval: Duration,
    last_emit: Option<Instant>,
    pending: Option<T>,
}

impl<T> Throttle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            pending: None,
        }
    }

    /// Returns the value when it may be emitted now, else holds it.
    pub fn push(&mut self, value: T) -> Option<T> {
        let now = Instant::now();
        let open = self
            .last_emit
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if open {
            self.last_emit = Some(now);
            self.pending = None;
            Some(value)
        } else {
            self.pending = Some(value);
            None
        }
    }

    /// When the held value becomes due, if one is held.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref()?;
        Some(match self.last_emit {
            Some(last) => last + self.interval,
            None => Instant::now(),
        })
    }

    pub fn take_due(&mut self) -> Option<T> {
        let deadline = self.deadline()?;
        let now = Instant::now();
        if now < deadline {
            return None;
        }
        self.last_emit = Some(now);
        self.pending.take()
    }

    pub fn flush(&mut self) -> Option<T> {
        self.pending.take()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}
