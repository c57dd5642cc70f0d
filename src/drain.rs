//! Borrow-with-await-on-close: the drainer primitive behind connection
//! lifetimes.
//!
//! A [`Drainer`] hands out [`DrainLock`]s to code that wants to touch the
//! guarded object. Teardown calls [`Drainer::drain`], which refuses new
//! locks, waits for every outstanding lock to drop, then fires the drain
//! signal exactly once. Locks may be cloned and sent across tasks; a clone
//! keeps the object alive wherever it travels.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};

#[derive(Debug)]
struct DrainState {
    outstanding: AtomicUsize,
    draining: AtomicBool,
    released: Notify,
    drained_tx: watch::Sender<bool>,
}

/// Owner side of the drain protocol. One per guarded object.
#[derive(Debug, Clone)]
pub struct Drainer {
    state: Arc<DrainState>,
}

/// A live borrow of the guarded object. While any `DrainLock` exists, the
/// drain signal cannot fire.
#[derive(Debug)]
pub struct DrainLock {
    state: Arc<DrainState>,
}

/// One-shot broadcast fired when the guarded object has fully drained.
#[derive(Debug, Clone)]
pub struct DrainSignal {
    rx: watch::Receiver<bool>,
}

impl Drainer {
    pub fn new() -> Self {
        let (drained_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(DrainState {
                outstanding: AtomicUsize::new(0),
                draining: AtomicBool::new(false),
                released: Notify::new(),
                drained_tx,
            }),
        }
    }

    /// Acquire a lock, or `None` once draining has begun.
    pub fn lock(&self) -> Option<DrainLock> {
        // Increment first so a concurrent drain() either sees the count or
        // we see its flag; either way no lock slips past a completed drain.
        self.state.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.state.draining.load(Ordering::SeqCst) {
            release(&self.state);
            return None;
        }
        Some(DrainLock {
            state: self.state.clone(),
        })
    }

    /// Whether teardown has begun.
    pub fn is_draining(&self) -> bool {
        self.state.draining.load(Ordering::SeqCst)
    }

    /// Number of outstanding locks.
    pub fn outstanding(&self) -> usize {
        self.state.outstanding.load(Ordering::SeqCst)
    }

    /// Subscribe to the drain signal.
    pub fn signal(&self) -> DrainSignal {
        DrainSignal {
            rx: self.state.drained_tx.subscribe(),
        }
    }

    /// Begin teardown and wait for every outstanding lock to drop, then fire
    /// the drain signal. Idempotent: concurrent callers all return once the
    /// signal has fired.
    pub async fn drain(&self) {
        self.state.draining.store(true, Ordering::SeqCst);
        loop {
            let released = self.state.released.notified();
            tokio::pin!(released);
            // Register for the wakeup before re-checking the count, or a
            // release between the check and the await would be missed.
            released.as_mut().enable();
            if self.state.outstanding.load(Ordering::SeqCst) == 0 {
                break;
            }
            released.await;
        }
        self.state.drained_tx.send_replace(true);
    }
}

impl Default for Drainer {
    fn default() -> Self {
        Self::new()
    }
}

fn release(state: &DrainState) {
    if state.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
        state.released.notify_waiters();
    }
}

impl Clone for DrainLock {
    fn clone(&self) -> Self {
        // Clones are always granted, even mid-drain: publishing a lock to
        // another task must keep the object alive there too.
        self.state.outstanding.fetch_add(1, Ordering::SeqCst);
        Self {
            state: self.state.clone(),
        }
    }
}

impl Drop for DrainLock {
    fn drop(&mut self) {
        release(&self.state);
    }
}

impl DrainSignal {
    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn wait(&mut self) {
        // The sender lives inside the Drainer state, which every lock keeps
        // alive; a closed channel still reports the final value.
        let _ = self.rx.wait_for(|fired| *fired).await;
    }

    /// Whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drain_with_no_locks() {
        let drainer = Drainer::new();
        let signal = drainer.signal();
        assert!(!signal.is_fired());
        drainer.drain().await;
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn test_no_locks_after_drain() {
        let drainer = Drainer::new();
        drainer.drain().await;
        assert!(drainer.lock().is_none());
    }

    #[tokio::test]
    async fn test_drain_waits_for_lock() {
        let drainer = Drainer::new();
        let lock = drainer.lock().unwrap();
        let mut signal = drainer.signal();

        let d = drainer.clone();
        let drain_task = tokio::spawn(async move { d.drain().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!signal.is_fired());
        assert!(drainer.is_draining());

        drop(lock);
        drain_task.await.unwrap();
        signal.wait().await;
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn test_clone_extends_borrow() {
        let drainer = Drainer::new();
        let lock = drainer.lock().unwrap();
        let clone = lock.clone();
        drop(lock);

        let signal = drainer.signal();
        let d = drainer.clone();
        let drain_task = tokio::spawn(async move { d.drain().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!signal.is_fired());

        drop(clone);
        drain_task.await.unwrap();
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn test_drain_idempotent() {
        let drainer = Drainer::new();
        drainer.drain().await;
        drainer.drain().await;
        let signal = drainer.signal();
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn test_concurrent_drainers_all_return() {
        let drainer = Drainer::new();
        let lock = drainer.lock().unwrap();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let d = drainer.clone();
            tasks.push(tokio::spawn(async move { d.drain().await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lock);
        for t in tasks {
            t.await.unwrap();
        }
    }
}
