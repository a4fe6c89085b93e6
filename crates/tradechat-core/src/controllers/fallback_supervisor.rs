use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// One-shot fallback timer of a single request.
///
/// The timer either fires once or is cleared; clearing is idempotent, and a
/// fired supervisor never fires again. Both are decided by whoever holds the
/// owning request's lock, so "primary output arrived" and "timer elapsed"
/// cannot both win.
#[derive(Debug, Default)]
pub struct FallbackSupervisor {
    timer: Option<JoinHandle<()>>,
    fired: bool,
}

impl FallbackSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the timer. `on_elapsed` runs after `delay` unless cleared first.
    /// Re-arming replaces a previous timer.
    pub fn arm<F>(&mut self, delay: Duration, on_elapsed: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.clear();
        self.fired = false;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_elapsed.await;
        }));
    }

    /// Cancel the timer. Safe to call any number of times.
    pub fn clear(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Claim the elapsed timer. Returns `true` only for the first claim of
    /// an armed timer; the timer task itself keeps running since it is the
    /// one performing the fallback.
    pub fn fire(&mut self) -> bool {
        if self.fired || self.timer.is_none() {
            return false;
        }
        self.timer = None;
        self.fired = true;
        true
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

impl Drop for FallbackSupervisor {
    fn drop(&mut self) {
        self.clear();
    }
}
