//! Interrupt-masking spinlock.
//!
//! Taking the lock first masks local interrupts (capturing the previous
//! state as an [`IrqKey`]) and then claims an atomic lock word. Releasing
//! clears the lock word and restores exactly the captured interrupt state.
//! Masking comes first so that an interrupt handler on the same execution
//! unit can never spin on a lock its own interrupted context holds.
//!
//! On bare-metal uniprocessor builds (no `smp` feature) there is nobody to
//! spin against: finding the word already set means the lock was
//! re-acquired recursively, which is reported as a bug instead of hanging.
//! Hosted builds always spin, since host threads are real concurrent
//! execution units.

use core::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    mem,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

#[cfg(debug_assertions)]
use core::sync::atomic::AtomicUsize;

use spin::relax::{RelaxStrategy, Spin};

use crate::arch::{irq_lock, irq_unlock, IrqKey};

const SPIN_ON_CONTENTION: bool = cfg!(any(feature = "smp", not(target_os = "none")));

/// A lock word plus interrupt masking, with no protected data.
///
/// This is the key-passing form: [`lock`](Self::lock) hands back the
/// [`IrqKey`] that must be given to [`unlock`](Self::unlock). Debug builds
/// remember the key taken at acquisition and assert that the same key comes
/// back, which catches a lock taken on one execution unit being released
/// with state captured on another.
pub struct RawSpinLock<R = Spin> {
    locked: AtomicBool,
    #[cfg(debug_assertions)]
    saved_key: AtomicUsize,
    relax: PhantomData<R>,
}

impl<R: RelaxStrategy> RawSpinLock<R> {
    /// Create an unlocked spinlock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            #[cfg(debug_assertions)]
            saved_key: AtomicUsize::new(0),
            relax: PhantomData,
        }
    }

    /// Mask interrupts and acquire the lock word.
    pub fn lock(&self) -> IrqKey {
        let key = irq_lock();

        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            assert!(
                SPIN_ON_CONTENTION,
                "spinlock re-acquired on a uniprocessor build"
            );
            while self.locked.load(Ordering::Relaxed) {
                R::relax();
            }
        }

        #[cfg(debug_assertions)]
        self.saved_key.store(key.raw(), Ordering::Relaxed);

        key
    }

    /// Acquire the lock only if it is free right now.
    ///
    /// On failure interrupts are restored before returning.
    pub fn try_lock(&self) -> Option<IrqKey> {
        let key = irq_lock();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            #[cfg(debug_assertions)]
            self.saved_key.store(key.raw(), Ordering::Relaxed);
            Some(key)
        } else {
            irq_unlock(key);
            None
        }
    }

    /// Release the lock word, then restore the interrupt state in `key`.
    ///
    /// Panics if the lock is not held. Debug builds also panic if `key` is
    /// not the key returned by the matching [`lock`](Self::lock).
    pub fn unlock(&self, key: IrqKey) {
        #[cfg(debug_assertions)]
        assert_eq!(
            self.saved_key.load(Ordering::Relaxed),
            key.raw(),
            "mismatched spinlock lock/unlock keys"
        );

        self.release();
        irq_unlock(key);
    }

    /// Release the lock word but leave local interrupts masked.
    ///
    /// Used when interrupt state has to persist across a hand-off to
    /// another thread of control; whoever ends up holding the key restores
    /// it with [`irq_unlock`].
    pub fn release(&self) {
        let was_locked = self.locked.swap(false, Ordering::Release);
        assert!(was_locked, "spinlock released while not held");
    }

    /// Whether the lock word is currently set.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl<R: RelaxStrategy> Default for RawSpinLock<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for RawSpinLock<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSpinLock")
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SpinLock<T>
// ---------------------------------------------------------------------------

/// A [`RawSpinLock`] protecting a value, with RAII release.
pub struct SpinLock<T, R = Spin> {
    raw: RawSpinLock<R>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by the lock word; the value only
// ever moves between execution units through a guard.
unsafe impl<T: Send, R> Sync for SpinLock<T, R> {}
// SAFETY: the lock owns `data`; sending the lock sends the value.
unsafe impl<T: Send, R> Send for SpinLock<T, R> {}

impl<T, R: RelaxStrategy> SpinLock<T, R> {
    /// Create an unlocked spinlock around `data`.
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Mask interrupts, spin until the lock is ours, and return a guard.
    pub fn lock(&self) -> SpinLockGuard<'_, T, R> {
        let key = self.raw.lock();
        SpinLockGuard {
            lock: self,
            key,
            _not_send: PhantomData,
        }
    }

    /// Take the lock only if it is free.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T, R>> {
        self.raw.try_lock().map(|key| SpinLockGuard {
            lock: self,
            key,
            _not_send: PhantomData,
        })
    }

    /// Whether some execution unit currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Direct access through a unique borrow; no locking needed.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consume the lock and return the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default, R: RelaxStrategy> Default for SpinLock<T, R> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T, R> fmt::Debug for SpinLock<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.raw.locked.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Proof of holding a [`SpinLock`]. Dropping it unlocks.
///
/// The guard is tied to the execution unit whose interrupt state it saved,
/// so it is neither `Send` nor `Sync`.
pub struct SpinLockGuard<'a, T, R = Spin> {
    lock: &'a SpinLock<T, R>,
    key: IrqKey,
    _not_send: PhantomData<*mut ()>,
}

impl<'a, T, R: RelaxStrategy> SpinLockGuard<'a, T, R> {
    /// Give up the lock word but keep interrupts masked.
    ///
    /// Returns the saved key; the caller must eventually pass it to
    /// [`irq_unlock`](crate::arch::irq_unlock).
    pub fn release(self) -> IrqKey {
        let key = self.key;
        let lock = self.lock;
        mem::forget(self);
        lock.raw.release();
        key
    }
}

impl<T, R> Deref for SpinLockGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard exists only while the lock word is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, R> DerefMut for SpinLockGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard exists only while the lock word is held, and
        // `&mut self` makes this the only live borrow through it.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, R> Drop for SpinLockGuard<'_, T, R> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        assert_eq!(
            self.lock.raw.saved_key.load(Ordering::Relaxed),
            self.key.raw(),
            "mismatched spinlock lock/unlock keys"
        );

        let was_locked = self.lock.raw.locked.swap(false, Ordering::Release);
        debug_assert!(was_locked, "spinlock guard dropped while not held");
        irq_unlock(self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn test_lock_unlock_roundtrip() {
        let lock: RawSpinLock = RawSpinLock::new();
        let key = lock.lock();
        assert!(lock.is_locked());
        lock.unlock(key);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock: SpinLock<u32> = SpinLock::new(5);
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert_eq!(*lock.try_lock().unwrap(), 5);
    }

    #[test]
    #[should_panic(expected = "released while not held")]
    fn test_double_unlock_panics() {
        let lock: RawSpinLock = RawSpinLock::new();
        let key = lock.lock();
        lock.unlock(key);
        lock.unlock(key);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "mismatched spinlock")]
    fn test_mismatched_key_panics_in_debug() {
        let lock: RawSpinLock = RawSpinLock::new();
        let key = lock.lock();
        lock.unlock(IrqKey::from_raw(key.raw() ^ 0x200));
    }

    #[test]
    fn test_release_keeps_key_for_later_restore() {
        let lock: SpinLock<u32> = SpinLock::new(0);
        let guard = lock.lock();
        let key = guard.release();
        assert!(!lock.is_locked());
        crate::arch::irq_unlock(key);
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        let lock = Arc::new(SpinLock::<u64>::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }
}
