//! Lock-ordered mutexes.
//!
//! Every process-wide mutex carries a [`LockLevel`]. A thread may only acquire
//! locks in strictly increasing level order; debug builds assert this on every
//! acquisition so an ordering inversion fails loudly in tests instead of
//! deadlocking in production. Poisoning is ignored: a panic while holding a
//! lock leaves plain data behind, never a half-applied git operation.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

/// Acquisition order, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    SyncState = 10,
    StoreDirectory = 20,
    RepoRegistry = 30,
    Worktree = 40,
    RepoHandle = 50,
    KeyCache = 60,
    TaskHandle = 70,
}

thread_local! {
    static HELD: RefCell<Vec<LockLevel>> = const { RefCell::new(Vec::new()) };
}

fn note_acquire(level: LockLevel) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(top) = held.last() {
            debug_assert!(
                level > *top,
                "lock order violation: acquiring {level:?} while holding {top:?}"
            );
        }
        held.push(level);
    });
}

fn note_release(level: LockLevel) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|l| *l == level) {
            held.remove(pos);
        }
    });
}

#[derive(Debug)]
pub struct OrderedMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

pub struct OrderedMutexGuard<'a, T> {
    level: LockLevel,
    guard: MutexGuard<'a, T>,
}

impl<T> OrderedMutex<T> {
    #[must_use]
    pub const fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    #[must_use]
    pub const fn level(&self) -> LockLevel {
        self.level
    }

    pub fn lock(&self) -> OrderedMutexGuard<'_, T> {
        note_acquire(self.level);
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        OrderedMutexGuard {
            level: self.level,
            guard,
        }
    }

    /// Polls for the lock until `timeout` elapses.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<OrderedMutexGuard<'_, T>> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_millis(1);
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Some(self.wrap(guard)),
                Err(TryLockError::Poisoned(e)) => return Some(self.wrap(e.into_inner())),
                Err(TryLockError::WouldBlock) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(Duration::from_millis(50));
        }
    }

    fn wrap<'a>(&'a self, guard: MutexGuard<'a, T>) -> OrderedMutexGuard<'a, T> {
        note_acquire(self.level);
        OrderedMutexGuard {
            level: self.level,
            guard,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Default> Default for OrderedMutex<T> {
    fn default() -> Self {
        Self::new(LockLevel::TaskHandle, T::default())
    }
}

impl<T> Deref for OrderedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedMutexGuard<'_, T> {
    fn drop(&mut self) {
        note_release(self.level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn increasing_order_is_allowed() {
        let a = OrderedMutex::new(LockLevel::StoreDirectory, 1);
        let b = OrderedMutex::new(LockLevel::Worktree, 2);
        let ga = a.lock();
        let gb = b.lock();
        assert_eq!(*ga + *gb, 3);
    }

    #[test]
    fn release_allows_reacquire() {
        let a = OrderedMutex::new(LockLevel::Worktree, 0);
        {
            let mut g = a.lock();
            *g += 1;
        }
        let g = a.lock();
        assert_eq!(*g, 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn inverted_order_panics_in_debug() {
        let low = OrderedMutex::new(LockLevel::SyncState, ());
        let high = OrderedMutex::new(LockLevel::KeyCache, ());
        let _h = high.lock();
        let _l = low.lock();
    }

    #[test]
    fn try_lock_for_times_out_while_held() {
        let m = Arc::new(OrderedMutex::new(LockLevel::Worktree, ()));
        let held = Arc::clone(&m);
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let t = std::thread::spawn(move || {
            let _g = held.lock();
            tx.send(()).unwrap();
            let _ = done_rx.recv();
        });
        rx.recv().unwrap();
        assert!(m.try_lock_for(Duration::from_millis(30)).is_none());
        done_tx.send(()).unwrap();
        t.join().unwrap();
        assert!(m.try_lock_for(Duration::from_millis(30)).is_some());
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let m = Arc::new(OrderedMutex::new(LockLevel::Worktree, 5));
        let p = Arc::clone(&m);
        let _ = std::thread::spawn(move || {
            let _g = p.lock();
            panic!("boom");
        })
        .join();
        assert_eq!(*m.lock(), 5);
    }
}
