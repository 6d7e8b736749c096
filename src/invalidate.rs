//! Invalidation Sender (§4.G): coalesces change notifications behind a
//! single debounce timer, addressed to the catalog's two named
//! subscriber scopes (`music`, `video`).
//!
//! Reimplemented as a struct wrapping an `mpsc::UnboundedSender<String>`
//! plus the one pending debounce task, per SPEC_FULL.md §4.G. Owners
//! hold this behind an `Arc` so the `Drop` impl that cancels a pending
//! timer runs exactly once, when the last owner goes away — the
//! debounce task itself only holds a `Weak` back-reference, so it never
//! keeps the sender alive past that point.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// The two subscriber scopes the original notifies on every catalog
/// change (§6).
const SUBSCRIBERS: [&str; 2] = ["music", "video"];

pub struct Invalidator {
    delay: Duration,
    sender: mpsc::UnboundedSender<String>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Invalidator {
    /// Build a new sender and its receiving end. `delay` of zero makes
    /// `invalidate()` fire synchronously.
    pub fn new(delay: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                delay,
                sender,
                pending: Mutex::new(None),
            }),
            receiver,
        )
    }

    /// Arm the debounce timer. A call while one is already pending is a
    /// no-op — the original invalidation notice covers this one too.
    pub async fn invalidate(self: &Arc<Self>) {
        let mut pending = self.pending.lock().await;
        if pending.is_some() {
            return;
        }
        if self.delay.is_zero() {
            Self::fire(&self.sender);
            return;
        }

        let sender = self.sender.clone();
        let delay = self.delay;
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::fire(&sender);
            if let Some(this) = weak.upgrade() {
                *this.pending.lock().await = None;
            }
        });
        *pending = Some(handle);
    }

    fn fire(sender: &mpsc::UnboundedSender<String>) {
        for name in SUBSCRIBERS {
            let _ = sender.send(name.to_string());
        }
    }
}

impl Drop for Invalidator {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.try_lock() {
            if let Some(handle) = pending.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_delay_fires_synchronously() {
        let (invalidator, mut rx) = Invalidator::new(Duration::ZERO);
        invalidator.invalidate().await;
        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort();
        assert_eq!(seen, vec!["music".to_string(), "video".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_while_pending_is_a_no_op() {
        let (invalidator, mut rx) = Invalidator::new(Duration::from_millis(100));
        invalidator.invalidate().await;
        invalidator.invalidate().await;
        invalidator.invalidate().await;

        tokio::time::advance(Duration::from_millis(150)).await;
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_ne!(first, second);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_cancels_pending_timer() {
        let (invalidator, mut rx) = Invalidator::new(Duration::from_millis(100));
        invalidator.invalidate().await;
        drop(invalidator);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn can_rearm_after_previous_timer_fired() {
        let (invalidator, mut rx) = Invalidator::new(Duration::from_millis(50));
        invalidator.invalidate().await;
        tokio::time::advance(Duration::from_millis(75)).await;
        let _ = rx.recv().await.unwrap();
        let _ = rx.recv().await.unwrap();

        invalidator.invalidate().await;
        tokio::time::advance(Duration::from_millis(75)).await;
        assert!(rx.recv().await.is_some());
    }
}
