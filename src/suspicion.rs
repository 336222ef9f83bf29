// Suspicion timer
//
// Each suspect peer gets one timer that converts it into a confirmed-dead
// peer unless it refutes first. The deadline starts at `max` and is pulled
// toward `min` logarithmically as independent confirmations arrive, so a
// widely-suspected peer is declared dead quickly while a single flaky
// observation gets the full window to be refuted.

use crate::types::NodeId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct TimerShared {
    start: Instant,
    min: Duration,
    max: Duration,
    /// Confirmations expected to drive the deadline down to `min`.
    k: u32,
    /// Senders counted so far, including the original suspector.
    confirmers: Mutex<HashSet<NodeId>>,
    cancelled: AtomicBool,
    recompute: Notify,
}

impl TimerShared {
    /// Confirmations beyond the original suspector.
    fn confirmation_count(&self) -> u32 {
        (self.confirmers.lock().len().saturating_sub(1)) as u32
    }

    /// Total window for the given number of confirmations.
    fn window_for(&self, confirmations: u32) -> Duration {
        if self.k == 0 {
            return self.min;
        }
        let c = confirmations.min(self.k);
        let frac = ((c + 1) as f64).ln() / ((self.k + 1) as f64).ln();
        let span = self.max.saturating_sub(self.min);
        self.max.saturating_sub(span.mul_f64(frac)).max(self.min)
    }

    fn deadline(&self) -> Instant {
        self.start + self.window_for(self.confirmation_count())
    }
}

/// Handle to one running suspicion timer.
pub struct SuspicionTimer {
    shared: Arc<TimerShared>,
    task: JoinHandle<()>,
}

impl SuspicionTimer {
    /// Start a timer. `from` is the original suspector; `on_expiry` runs at
    /// the deadline unless the timer is cancelled first.
    pub fn spawn<F>(min: Duration, max: Duration, k: u32, from: NodeId, on_expiry: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            start: Instant::now(),
            min,
            max,
            k,
            confirmers: Mutex::new(HashSet::from([from])),
            cancelled: AtomicBool::new(false),
            recompute: Notify::new(),
        });

        let task = tokio::spawn(run_timer(shared.clone(), on_expiry));
        Self { shared, task }
    }

    /// Count a confirmation from a distinct sender and compress the
    /// deadline. Returns whether the sender was newly counted.
    pub fn confirm(&self, from: &str) -> bool {
        if self.shared.confirmation_count() >= self.shared.k {
            return false;
        }
        let newly = self.shared.confirmers.lock().insert(from.to_string());
        if newly {
            self.shared.recompute.notify_one();
        }
        newly
    }

    /// Stop the timer without firing.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.recompute.notify_one();
        self.task.abort();
    }
}

impl Drop for SuspicionTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_timer<F>(shared: Arc<TimerShared>, on_expiry: F)
where
    F: FnOnce() + Send + 'static,
{
    loop {
        let deadline = shared.deadline();
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                if !shared.cancelled.load(Ordering::Acquire) {
                    on_expiry();
                }
                return;
            }
            _ = shared.recompute.notified() => {
                if shared.cancelled.load(Ordering::Acquire) {
                    return;
                }
                // Loop re-reads the compressed deadline; a deadline already
                // in the past fires on the next select pass.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fired_flag() -> (Arc<AtomicU32>, impl FnOnce() + Send + 'static) {
        let fired = Arc::new(AtomicU32::new(0));
        let flag = fired.clone();
        (fired, move || {
            flag.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_max_without_confirmations() {
        let (fired, hook) = fired_flag();
        let _timer = SuspicionTimer::spawn(
            Duration::from_secs(1),
            Duration::from_secs(10),
            3,
            "x".into(),
            hook,
        );

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmations_compress_deadline() {
        let (fired, hook) = fired_flag();
        let timer = SuspicionTimer::spawn(
            Duration::from_secs(1),
            Duration::from_secs(10),
            3,
            "x".into(),
            hook,
        );

        // Full confirmation quorum pulls the window down to min.
        assert!(timer.confirm("y"));
        assert!(timer.confirm("z"));
        assert!(timer.confirm("w"));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_confirmers_not_counted() {
        let (_, hook) = fired_flag();
        let timer = SuspicionTimer::spawn(
            Duration::from_secs(1),
            Duration::from_secs(10),
            3,
            "x".into(),
            hook,
        );

        // The original suspector and repeats do not move the deadline.
        assert!(!timer.confirm("x"));
        assert!(timer.confirm("y"));
        assert!(!timer.confirm("y"));
        timer.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (fired, hook) = fired_flag();
        let timer = SuspicionTimer::spawn(
            Duration::from_secs(1),
            Duration::from_secs(5),
            0,
            "x".into(),
            hook,
        );

        timer.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_expected_confirmations_fires_at_min() {
        let (fired, hook) = fired_flag();
        let _timer = SuspicionTimer::spawn(
            Duration::from_secs(2),
            Duration::from_secs(20),
            0,
            "x".into(),
            hook,
        );

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
