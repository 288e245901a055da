//! Session-owned timers
//!
//! One tokio task per armed timer. Expired tokens are delivered on the
//! owner's channel; the owner still checks the generation, since an abort can
//! race a token that is already queued.

use std::collections::HashMap;
use std::time::Duration;

use blechat_core::{TimerKind, TimerToken};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

#[derive(Debug)]
pub struct TimerSet {
    pending: HashMap<TimerKind, JoinHandle<()>>,
    tx: mpsc::UnboundedSender<TimerToken>,
}

impl TimerSet {
    pub fn new(tx: mpsc::UnboundedSender<TimerToken>) -> Self {
        Self {
            pending: HashMap::new(),
            tx,
        }
    }

    /// Arm `timer`, replacing a pending timer of the same kind
    pub fn start(&mut self, timer: TimerToken, after: Duration) {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(timer);
        });
        if let Some(previous) = self.pending.insert(timer.kind, handle) {
            previous.abort();
        }
        debug!("Armed {:?} for {:?} ({})", timer.kind, after, timer.generation);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(handle) = self.pending.remove(&kind) {
            handle.abort();
            debug!("Cancelled {:?}", kind);
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.pending
            .get(&kind)
            .map_or(false, |handle| !handle.is_finished())
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blechat_core::Generation;

    #[tokio::test(start_paused = true)]
    async fn test_rearming_replaces_previous_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new(tx);

        let first = TimerToken::new(TimerKind::ConnectionTimeout, Generation::new(1));
        let second = TimerToken::new(TimerKind::ConnectionTimeout, Generation::new(2));
        timers.start(first, Duration::from_secs(20));
        timers.start(second, Duration::from_secs(20));

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(rx.recv().await, Some(second));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_drop_silence_timers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new(tx);
        timers.start(
            TimerToken::new(TimerKind::SettleDelay, Generation::new(1)),
            Duration::from_secs(2),
        );
        timers.start(
            TimerToken::new(TimerKind::RetryBackoff, Generation::new(1)),
            Duration::from_secs(2),
        );
        timers.cancel(TimerKind::SettleDelay);
        assert!(!timers.is_armed(TimerKind::SettleDelay));
        drop(timers);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rx.recv().await, None);
    }
}
