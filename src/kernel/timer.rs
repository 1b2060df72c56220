use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::kernel::task::Task;

/// Counts down by frame time and fires a function once when it reaches zero.
///  Reset to arm it again.
pub struct CountDownTimer {
    name: String,
    timeout: Duration,
    remaining: Mutex<Duration>,
    fired: AtomicBool,
    timeout_fn: Box<dyn Fn() + Send + Sync>,
}

impl CountDownTimer {
    pub fn new(
        timeout: Duration,
        name: impl Into<String>,
        timeout_fn: impl Fn() + Send + Sync + 'static,
    ) -> CountDownTimer {
        CountDownTimer {
            name: name.into(),
            timeout,
            remaining: Mutex::new(timeout),
            fired: AtomicBool::new(false),
            timeout_fn: Box::new(timeout_fn),
        }
    }

    pub fn reset(&self) {
        *self.remaining.lock() = self.timeout;
        self.fired.store(false, Ordering::Relaxed);
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Relaxed)
    }
}

impl Task for CountDownTimer {
    fn name(&self) -> &str {
        &self.name
    }

    fn update(&self, frame_time: Duration) {
        if self.fired.load(Ordering::Relaxed) {
            return;
        }
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(frame_time);
        if !remaining.is_zero() {
            return;
        }
        drop(remaining);
        self.fired.store(true, Ordering::Relaxed);
        (self.timeout_fn)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_fires_once_after_timeout() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = {
            let fired = fired.clone();
            CountDownTimer::new(Duration::from_millis(100), "timeout", move || {
                fired.fetch_add(1, Ordering::Relaxed);
            })
        };

        timer.update(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::Relaxed), 0);
        timer.update(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        timer.update(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        timer.reset();
        timer.update(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::Relaxed), 2);
    }
}
