//! Guarded mutexes.
//!
//! A [`GuardedMutex`] is a mutual exclusion lock for kernel code that may run
//! at any point where APCs could otherwise be delivered. Acquiring one enters
//! a [guarded region](crate::region), so the owner receives no kernel APCs
//! of either class until it releases the mutex.
//!
//! [`GuardedLock`] wraps a `GuardedMutex` around the data it protects, and
//! hands out RAII guards.
//!
//! # Implementation
//!
//! All of the mutex's state is packed into one 32-bit word:
//!
//! ```text
//! | 31 ........................... 2 |     1      |    0     |
//! |       blocked waiter count       | waiter woke| unlocked |
//! ```
//!
//! Note that bit 0 is *set* when the mutex is free. Acquiring the mutex
//! without contention is then a single atomic `fetch_and` that clears it: if
//! the bit was set, the caller now owns the lock.
//!
//! A contended acquirer adds itself to the waiter count and parks on the
//! mutex's [`Gate`]. A release that finds waiters but no woken waiter moves
//! one waiter out of the count and into the "woken" bit, then signals the
//! gate. Only one waiter is ever woken at a time: while the woken bit is set,
//! releases don't wake anyone. The woken waiter either takes the lock,
//! clearing both the unlocked and woken bits, or finds that another thread
//! got there first and goes back to sleep, folding the woken bit back into
//! the waiter count.
use crate::{
    gate::{Gate, SpinGate, WaitReason},
    loom::{
        cell::{MutPtr, UnsafeCell},
        hint,
        sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering::*},
    },
    thread::{CurrentThread, ThreadId},
    ContractViolation,
};
use core::{
    fmt,
    ops::{Deref, DerefMut},
};


/// A mutual exclusion lock that suppresses APC delivery while held.
///
/// Acquiring a `GuardedMutex` with [`acquire`](Self::acquire) or
/// [`try_acquire`](Self::try_acquire) enters a guarded region on the calling
/// thread, and [`release`](Self::release) leaves it. A thread that is already
/// suppressing APCs may use [`acquire_unsafe`](Self::acquire_unsafe) and
/// [`release_unsafe`](Self::release_unsafe) to skip the region bookkeeping.
///
/// Guarded mutexes are not recursive: a thread that acquires a mutex it
/// already owns will deadlock. In debug builds, this is detected and panics
/// with [`ContractViolation::RecursiveAcquire`].
///
/// # Fairness
///
/// This is *not* a fair mutex. Uncontended acquirers may take the lock ahead
/// of a waiter that was woken but has not yet run, and the order in which
/// blocked waiters are woken is up to the [`Gate`].
pub struct GuardedMutex<G = SpinGate> {
    count: AtomicI32,
    /// The owning thread's ID, or 0.
    owner: AtomicUsize,
    contention: AtomicU32,
    gate: G,
}

/// A [`GuardedMutex`] protecting a value of type `T`.
///
/// The data can only be accessed through the RAII guards returned by
/// [`lock`](Self::lock) and [`try_lock`](Self::try_lock), and the lock is
/// only released when a guard is dropped. The underlying mutex is not
/// exposed, so it cannot be released out from under a live guard:
///
///```compile_fail
/// use kesync::{CurrentThread, GuardedLock, NoDelivery, Thread, ThreadId};
///
/// let thread = Thread::new(ThreadId::next(), &NoDelivery);
/// let current = CurrentThread::new(&thread);
/// let lock = GuardedLock::new(0u32);
///
/// let guard = lock.lock(&current);
/// lock.raw().release(&current);
/// # drop(guard);
/// ```
pub struct GuardedLock<T, G = SpinGate> {
    mutex: GuardedMutex<G>,
    data: UnsafeCell<T>,
}

/// An RAII guard for a locked [`GuardedLock`].
///
/// The protected data can be accessed through this guard via its [`Deref`]
/// and [`DerefMut`] implementations. When the guard is dropped, the mutex is
/// released and the guarded region it entered is left.
#[must_use = "if unused, the `GuardedLock` will immediately unlock"]
pub struct GuardedLockGuard<'a, T, G: Gate = SpinGate> {
    ptr: MutPtr<T>,
    mutex: &'a GuardedMutex<G>,
    thread: CurrentThread<'a>,
}

/// Set when the mutex is *not* held.
const LOCK_BIT: i32 = 1 << 0;
/// Set when a blocked waiter has been signaled and has not yet run.
const WAITER_WOKEN: i32 = 1 << 1;
const WAITER_SHIFT: u32 = 2;
/// One blocked waiter's worth of the count.
const WAITER_INC: i32 = 1 << WAITER_SHIFT;

fn waiters(count: i32) -> u32 {
    (count >> WAITER_SHIFT) as u32
}

// === impl GuardedMutex ===

impl GuardedMutex {
    loom_const_fn! {
        /// Returns a new, unlocked `GuardedMutex` that parks contended
        /// acquirers on a [`SpinGate`].
        #[must_use]
        pub fn new() -> GuardedMutex {
            GuardedMutex::with_gate(SpinGate::new())
        }
    }
}

impl<G> GuardedMutex<G> {
    loom_const_fn! {
        /// Returns a new, unlocked `GuardedMutex` that parks contended
        /// acquirers on the provided [`Gate`].
        #[must_use]
        pub fn with_gate(gate: G) -> GuardedMutex<G> {
            GuardedMutex {
                count: AtomicI32::new(LOCK_BIT),
                owner: AtomicUsize::new(0),
                contention: AtomicU32::new(0),
                gate,
            }
        }
    }

    /// Resets this mutex to the unlocked state, in place.
    ///
    /// This is for mutexes embedded in larger structures that are recycled
    /// without being reconstructed. The gate is left as it is: a mutex with
    /// no waiters never leaves its gate signaled.
    pub fn initialize(&mut self) {
        self.count.store(LOCK_BIT, Relaxed);
        self.owner.store(0, Relaxed);
        self.contention.store(0, Relaxed);
    }

    /// Returns the ID of the thread that owns this mutex, if it is owned.
    ///
    /// The owner is recorded just after the lock is taken and cleared just
    /// before it is released, so this may briefly return `None` for a locked
    /// mutex.
    #[inline]
    #[must_use]
    pub fn owner(&self) -> Option<ThreadId> {
        ThreadId::from_usize(self.owner.load(Relaxed))
    }

    /// Returns `true` if this mutex is currently locked.
    #[inline]
    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.count.load(Relaxed) & LOCK_BIT == 0
    }

    /// Returns `true` if the given thread owns this mutex.
    #[inline]
    #[must_use]
    pub fn is_owned_by(&self, thread: &CurrentThread<'_>) -> bool {
        self.owner() == Some(thread.id())
    }

    /// Returns the number of acquires that have found this mutex locked.
    #[inline]
    #[must_use]
    pub fn contention(&self) -> u32 {
        self.contention.load(Relaxed)
    }

    /// Returns the number of threads currently blocked in
    /// [`acquire`](Self::acquire), not counting a woken waiter that has not
    /// yet run.
    #[inline]
    #[must_use]
    pub fn waiters(&self) -> u32 {
        waiters(self.count.load(Relaxed))
    }

    /// Returns a reference to this mutex's [`Gate`].
    #[inline]
    #[must_use]
    pub fn gate(&self) -> &G {
        &self.gate
    }

    /// Clears the unlocked bit, returning `true` if this took the lock.
    #[inline(always)]
    fn try_lock_bit(&self) -> bool {
        test_dbg!(self.count.fetch_and(!LOCK_BIT, Acquire) & LOCK_BIT != 0)
    }

    #[inline(always)]
    fn set_owner(&self, thread: &CurrentThread<'_>) {
        self.owner.store(thread.id().as_usize(), Relaxed);
    }
}

impl<G: Gate> GuardedMutex<G> {
    /// Acquires this mutex, blocking until it is available.
    ///
    /// The calling thread enters a guarded region before trying to take the
    /// lock, and remains in it until the mutex is
    /// [released](Self::release).
    ///
    /// # Panics
    ///
    /// In debug builds, if the calling thread already owns this mutex.
    #[inline]
    pub fn acquire(&self, thread: &CurrentThread<'_>) {
        thread.enter_guarded_region();
        self.acquire_inner(thread);
    }

    /// Releases this mutex and leaves the guarded region that
    /// [`acquire`](Self::acquire) entered.
    ///
    /// If any threads are blocked on the mutex and none has already been
    /// woken, one of them is woken.
    ///
    /// # Panics
    ///
    /// In debug builds, if the calling thread does not own this mutex.
    #[inline]
    pub fn release(&self, thread: &CurrentThread<'_>) {
        self.release_inner(thread);
        thread.leave_guarded_region();
    }

    /// Attempts to acquire this mutex without blocking.
    ///
    /// Returns `true` if the lock was taken, in which case the calling thread
    /// is left inside a guarded region, exactly as if it had called
    /// [`acquire`](Self::acquire). Otherwise, the mutex state is unchanged,
    /// the guarded region is left again, and this returns `false`.
    #[must_use]
    pub fn try_acquire(&self, thread: &CurrentThread<'_>) -> bool {
        thread.enter_guarded_region();
        if !self.try_lock_bit() {
            thread.leave_guarded_region();
            hint::spin_loop();
            return false;
        }

        self.set_owner(thread);
        true
    }

    /// Acquires this mutex without entering a guarded region.
    ///
    /// The caller must already be suppressing APC delivery, by being inside
    /// a critical or guarded region.
    ///
    /// # Panics
    ///
    /// In debug builds, if APC delivery is enabled on the calling thread, or
    /// if the calling thread already owns this mutex.
    pub fn acquire_unsafe(&self, thread: &CurrentThread<'_>) {
        contract!(
            thread.are_apcs_disabled(),
            ContractViolation::ApcsEnabled {
                thread: thread.id()
            },
        );
        self.acquire_inner(thread);
    }

    /// Releases a mutex acquired with
    /// [`acquire_unsafe`](Self::acquire_unsafe).
    ///
    /// # Panics
    ///
    /// In debug builds, if APC delivery is enabled on the calling thread, or
    /// if the calling thread does not own this mutex.
    pub fn release_unsafe(&self, thread: &CurrentThread<'_>) {
        contract!(
            thread.are_apcs_disabled(),
            ContractViolation::ApcsEnabled {
                thread: thread.id()
            },
        );
        self.release_inner(thread);
    }

    #[inline]
    fn acquire_inner(&self, thread: &CurrentThread<'_>) {
        contract!(
            !self.is_owned_by(thread),
            ContractViolation::RecursiveAcquire {
                thread: thread.id()
            },
        );

        if !self.try_lock_bit() {
            self.acquire_contended(thread);
        }

        self.set_owner(thread);
    }

    #[cold]
    #[inline(never)]
    #[cfg_attr(not(any(test, feature = "tracing", loom)), allow(unused_variables))]
    fn acquire_contended(&self, thread: &CurrentThread<'_>) {
        let contention = self.contention.fetch_add(1, Relaxed).wrapping_add(1);
        trace!(thread = %thread.id(), contention, "GuardedMutex::acquire: contended");

        // Until this thread has been woken once, taking the lock only clears
        // the unlocked bit, and blocking adds a waiter. Once woken, it also
        // owns the woken bit: taking the lock must clear it, and blocking
        // again adds `WAITER_WOKEN`, which carries into the waiter count.
        let mut bits_to_change = LOCK_BIT;
        let mut wait_increment = WAITER_INC;
        let mut count = self.count.load(Relaxed);
        loop {
            if count & LOCK_BIT != 0 {
                debug_assert!(
                    bits_to_change & WAITER_WOKEN == 0 || count & WAITER_WOKEN != 0,
                    "woken waiter lost its woken bit; count={count:#x}",
                );
                match self.count.compare_exchange_weak(
                    count,
                    count ^ bits_to_change,
                    Acquire,
                    Relaxed,
                ) {
                    Ok(_) => {
                        trace!(thread = %thread.id(), "GuardedMutex::acquire: locked after contention");
                        return;
                    }
                    Err(actual) => {
                        count = actual;
                        continue;
                    }
                }
            }

            match self.count.compare_exchange_weak(
                count,
                count.wrapping_add(wait_increment),
                Relaxed,
                Relaxed,
            ) {
                Ok(_) => {
                    trace!(
                        thread = %thread.id(),
                        waiters = waiters(count.wrapping_add(wait_increment)),
                        "GuardedMutex::acquire: waiting",
                    );
                    self.gate.wait(WaitReason::GuardedMutex);

                    bits_to_change = LOCK_BIT | WAITER_WOKEN;
                    wait_increment = WAITER_WOKEN;
                    count = self.count.load(Relaxed);
                    debug_assert!(
                        count & WAITER_WOKEN != 0,
                        "woken waiter found no woken bit; count={count:#x}",
                    );
                    trace!(thread = %thread.id(), "GuardedMutex::acquire: woken");
                }
                Err(actual) => count = actual,
            }
        }
    }

    #[inline]
    fn release_inner(&self, thread: &CurrentThread<'_>) {
        let owner = self.owner();
        contract!(
            owner == Some(thread.id()),
            ContractViolation::NotOwner {
                thread: thread.id(),
                owner,
            },
        );
        self.owner.store(0, Relaxed);

        let old = test_dbg!(self.count.fetch_add(LOCK_BIT, Release));
        debug_assert_eq!(old & LOCK_BIT, 0, "released an unlocked guarded mutex");

        if old != 0 && old & WAITER_WOKEN == 0 {
            self.wake_one(old.wrapping_add(LOCK_BIT));
        }
    }

    /// Moves one waiter from the waiter count to the woken bit, and signals
    /// the gate.
    #[cold]
    #[inline(never)]
    fn wake_one(&self, count: i32) {
        let woken = count.wrapping_add(WAITER_WOKEN).wrapping_sub(WAITER_INC);
        // If this fails, the count changed after our release. Either another
        // release already woke a waiter, or the lock was taken again and
        // that owner's release will wake one.
        if self
            .count
            .compare_exchange(count, woken, Relaxed, Relaxed)
            .is_ok()
        {
            trace!(waiters = waiters(woken), "GuardedMutex::release: waking a waiter");
            self.gate.signal_boost();
        }
    }
}

impl Default for GuardedMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: fmt::Debug> fmt::Debug for GuardedMutex<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.count.load(Relaxed);
        f.debug_struct("GuardedMutex")
            .field("locked", &(count & LOCK_BIT == 0))
            .field("waiter_woken", &(count & WAITER_WOKEN != 0))
            .field("waiters", &waiters(count))
            .field("owner", &self.owner())
            .field("contention", &self.contention())
            .field("gate", &self.gate)
            .finish()
    }
}

// === impl GuardedLock ===

impl<T> GuardedLock<T> {
    loom_const_fn! {
        /// Returns a new, unlocked `GuardedLock` protecting `data`, using a
        /// [`SpinGate`] for contended acquirers.
        #[must_use]
        pub fn new(data: T) -> GuardedLock<T> {
            GuardedLock::with_gate(data, SpinGate::new())
        }
    }
}

impl<T, G> GuardedLock<T, G> {
    loom_const_fn! {
        /// Returns a new, unlocked `GuardedLock` protecting `data`, using the
        /// provided [`Gate`] for contended acquirers.
        #[must_use]
        pub fn with_gate(data: T, gate: G) -> GuardedLock<T, G> {
            GuardedLock {
                mutex: GuardedMutex::with_gate(gate),
                data: UnsafeCell::new(data),
            }
        }
    }

    /// Returns `true` if the lock is currently held by any thread.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.mutex.is_owned()
    }

    /// Returns the thread that currently holds the lock, if any.
    ///
    /// See [`GuardedMutex::owner`].
    #[inline]
    #[must_use]
    pub fn owner(&self) -> Option<ThreadId> {
        self.mutex.owner()
    }

    /// Returns the number of times an acquirer found the lock held and had
    /// to wait.
    #[inline]
    #[must_use]
    pub fn contention(&self) -> u32 {
        self.mutex.contention()
    }

    /// Returns the number of threads currently blocked on the lock.
    #[inline]
    #[must_use]
    pub fn waiters(&self) -> u32 {
        self.mutex.waiters()
    }

    /// Returns the [`Gate`] that contended acquirers block on.
    #[inline]
    #[must_use]
    pub fn gate(&self) -> &G {
        self.mutex.gate()
    }

    /// Consumes this `GuardedLock`, returning the protected data.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Returns a mutable reference to the protected data.
    ///
    /// Since this call borrows the `GuardedLock` mutably, no locking needs to
    /// take place.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe {
            // Safety: the mutable borrow statically guarantees that no guards
            // exist.
            self.data.with_mut(|data| &mut *data)
        }
    }
}

impl<T, G: Gate> GuardedLock<T, G> {
    fn guard<'a>(&'a self, thread: &CurrentThread<'a>) -> GuardedLockGuard<'a, T, G> {
        GuardedLockGuard {
            ptr: self.data.get_mut(),
            mutex: &self.mutex,
            thread: *thread,
        }
    }

    /// Acquires the lock, blocking until it is available.
    ///
    /// The calling thread stays in a guarded region until the returned guard
    /// is dropped.
    pub fn lock<'a>(&'a self, thread: &CurrentThread<'a>) -> GuardedLockGuard<'a, T, G> {
        self.mutex.acquire(thread);
        self.guard(thread)
    }

    /// Attempts to acquire the lock without blocking.
    #[must_use]
    pub fn try_lock<'a>(&'a self, thread: &CurrentThread<'a>) -> Option<GuardedLockGuard<'a, T, G>> {
        if self.mutex.try_acquire(thread) {
            Some(self.guard(thread))
        } else {
            None
        }
    }
}

impl<T: Default> Default for GuardedLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T, G: fmt::Debug> fmt::Debug for GuardedLock<T, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedLock")
            .field("mutex", &self.mutex)
            .finish_non_exhaustive()
    }
}

unsafe impl<T: Send, G: Send> Send for GuardedLock<T, G> {}
unsafe impl<T: Send, G: Sync> Sync for GuardedLock<T, G> {}

// === impl GuardedLockGuard ===

impl<T, G: Gate> Deref for GuardedLockGuard<'_, T, G> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe {
            // Safety: we are holding the lock, so it is okay to dereference the
            // mut pointer.
            &*self.ptr.deref()
        }
    }
}

impl<T, G: Gate> DerefMut for GuardedLockGuard<'_, T, G> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe {
            // Safety: we are holding the lock, so it is okay to dereference the
            // mut pointer.
            self.ptr.deref()
        }
    }
}

impl<T, G: Gate> Drop for GuardedLockGuard<'_, T, G> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.release(&self.thread);
    }
}

impl<T: fmt::Debug, G: Gate> fmt::Debug for GuardedLockGuard<'_, T, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedLockGuard")
            .field("data", &self.deref())
            .field("thread", &self.thread)
            .finish()
    }
}
