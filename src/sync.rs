use std::task::Waker;

use spin::Mutex;

/// Suspend/wake primitive.
///
/// A waiter registers its waker while still holding the lock protecting
/// the condition it waits on, then releases that lock and returns
/// `Poll::Pending`. Producers change the condition under the same lock
/// and call [`wake_all`][Self::wake_all], so no wakeup is lost.
#[derive(Default)]
pub struct WaitQueue {
    wakers: Mutex<Vec<Waker>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, waker: &Waker) {
        let mut wakers = self.wakers.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    pub fn wake_all(&self) {
        let wakers = std::mem::take(&mut *self.wakers.lock());
        wakers.into_iter().for_each(Waker::wake);
    }

    pub fn has_waiters(&self) -> bool {
        !self.wakers.lock().is_empty()
    }
}
