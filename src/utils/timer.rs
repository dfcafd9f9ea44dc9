//! One-shot timer that can be cancelled before it fires

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Runs a callback once after a delay unless cancelled first
///
/// Dropping the timer cancels it.
pub struct CancellableTimer {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl CancellableTimer {
    /// Arm a timer that runs `on_fire` after `delay`
    pub fn start<F, Fut>(delay: Duration, on_fire: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));

        let child = token.clone();
        let fired_flag = fired.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !fired_flag.swap(true, Ordering::SeqCst) {
                        on_fire().await;
                    }
                }
            }
        });

        Self { token, fired }
    }

    /// Cancel the timer; no-op if it already fired
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for CancellableTimer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
