//! Single-flight build lock with an explicit FIFO waiter queue.
//!
//! Release hands the lock straight to the oldest live waiter, so a newcomer
//! can never barge ahead of a queued build. The permit releases on drop, which
//! covers success, errors, cancellation and a dropped `run` future alike.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct LockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

#[derive(Debug, Default)]
pub struct BuildMutex {
    state: Mutex<LockState>,
}

/// Held for the whole step loop of one run.
#[derive(Debug)]
#[must_use = "the build lock is released as soon as the permit is dropped"]
pub struct BuildPermit<'a> {
    mutex: &'a BuildMutex,
}

impl Drop for BuildPermit<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

/// A queued acquire. If it is dropped after the lock was handed to it, the
/// lock is passed on instead of being lost.
struct Waiter<'a> {
    mutex: &'a BuildMutex,
    rx: Option<oneshot::Receiver<()>>,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                self.mutex.release();
            }
        }
    }
}

impl BuildMutex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn acquire(&self) -> BuildPermit<'_> {
        let rx = {
            let mut s = self.lock();
            if !s.locked {
                s.locked = true;
                return BuildPermit { mutex: self };
            }
            let (tx, rx) = oneshot::channel();
            s.waiters.push_back(tx);
            rx
        };

        let mut waiter = Waiter {
            mutex: self,
            rx: Some(rx),
        };
        if let Some(rx) = waiter.rx.as_mut() {
            // The sender only disappears by being used, so either way the lock is ours.
            let _ = rx.await;
        }
        waiter.rx = None;
        BuildPermit { mutex: self }
    }

    /// Takes the lock only if nobody holds it and nobody is queued.
    pub fn try_acquire(&self) -> Option<BuildPermit<'_>> {
        let mut s = self.lock();
        if s.locked {
            return None;
        }
        s.locked = true;
        Some(BuildPermit { mutex: self })
    }

    fn release(&self) {
        let mut s = self.lock();
        while let Some(tx) = s.waiters.pop_front() {
            if tx.send(()).is_ok() {
                // Ownership moved to that waiter; stay locked.
                return;
            }
        }
        s.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.lock().locked
    }

    pub fn queued(&self) -> usize {
        self.lock().waiters.len()
    }
}
