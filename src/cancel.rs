use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

/// Owning side of a cancellation pair. Cancelling (or dropping) the handle
/// wakes every token that is sleeping on it.
#[derive(Debug)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    wake: Option<Sender<()>>,
    token: CancelToken,
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    wake: Receiver<()>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let flag = Arc::new(AtomicBool::new(false));
        let (tx, rx) = bounded(0);
        Self {
            token: CancelToken {
                flag: flag.clone(),
                wake: rx,
            },
            flag,
            wake: Some(tx),
        }
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn cancel(&mut self) {
        self.flag.store(true, Ordering::SeqCst);
        // Disconnecting the channel wakes sleepers immediately.
        self.wake.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless cancelled first. Returns `false` when the
    /// sleep was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match self.wake.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => !self.is_cancelled(),
            _ => false,
        }
    }
}
