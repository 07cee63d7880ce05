//! Gates: the wait primitive that contended [`GuardedMutex`] acquirers park
//! on.
//!
//! A gate is a binary signal. [`Gate::signal_boost`] sets it, and a
//! [`Gate::wait`] returns once it is set, consuming the signal. A signal sent
//! while nobody is waiting is kept until the next `wait`. The mutex
//! guarantees that it never signals a gate twice without a matching wait in
//! between, so a gate never has to remember more than one signal.
//!
//! Kernels that have their own scheduler gate object should implement
//! [`Gate`] for it. Two implementations are provided:
//!
//! - [`SpinGate`] polls an atomic flag with exponential backoff, and needs no
//!   scheduler at all.
//! - [`CondvarGate`] (requires the "std" feature) blocks the OS thread on a
//!   `std::sync::Condvar`.
//!
//! [`GuardedMutex`]: crate::GuardedMutex
use crate::{
    loom::sync::atomic::{AtomicBool, Ordering::*},
    util::Backoff,
};
use core::fmt;

/// Why a thread is waiting on a [`Gate`].
///
/// Gates backed by a real scheduler can use this for diagnostics, such as a
/// thread's wait reason in a debugger.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum WaitReason {
    /// Waiting to acquire a [`GuardedMutex`](crate::GuardedMutex).
    GuardedMutex,
    /// A wait on behalf of some other executive component.
    Executive,
}

/// A binary wait/wake primitive.
pub trait Gate: Sync {
    /// Blocks the calling thread until the gate is signaled, then consumes
    /// the signal.
    fn wait(&self, reason: WaitReason);

    /// Signals the gate, releasing exactly one waiter.
    ///
    /// If no thread is waiting yet, the signal is kept, and the next call to
    /// [`wait`](Self::wait) returns immediately. Implementations backed by a
    /// scheduler should give the released thread a priority boost.
    fn signal_boost(&self);
}

/// A [`Gate`] that spins on an atomic flag.
///
/// Waiting threads spin with an exponential [`Backoff`], so this is only
/// appropriate where the wait is expected to be short, or where there is no
/// scheduler to block on. Priority boosting is a no-op.
pub struct SpinGate {
    signaled: AtomicBool,
    max_backoff: u8,
}

// === impl SpinGate ===

impl SpinGate {
    loom_const_fn! {
        /// Returns a new, unsignaled `SpinGate`.
        #[must_use]
        pub fn new() -> SpinGate {
            SpinGate {
                signaled: AtomicBool::new(false),
                max_backoff: Backoff::DEFAULT_MAX_EXPONENT,
            }
        }
    }

    /// Returns a new, unsignaled `SpinGate` whose waiters back off at most
    /// `2^max_exponent` spins between polls.
    ///
    /// # Panics
    ///
    /// If `max_exponent` is greater than [`Backoff::DEFAULT_MAX_EXPONENT`].
    #[must_use]
    pub fn with_backoff_max(max_exponent: u8) -> Self {
        assert!(
            max_exponent <= Backoff::DEFAULT_MAX_EXPONENT,
            "backoff exponent may not exceed `Backoff::DEFAULT_MAX_EXPONENT`"
        );
        Self {
            signaled: AtomicBool::new(false),
            max_backoff: max_exponent,
        }
    }

    /// Returns `true` if the gate holds an unconsumed signal.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Acquire)
    }
}

impl Gate for SpinGate {
    #[cfg_attr(not(test), allow(unused_variables))]
    fn wait(&self, reason: WaitReason) {
        let mut boff = Backoff::with_max_exponent(self.max_backoff);
        loop {
            if test_dbg!(self
                .signaled
                .compare_exchange(true, false, Acquire, Relaxed)
                .is_ok())
            {
                test_trace!(?reason, "SpinGate::wait -> signaled");
                return;
            }

            while !self.signaled.load(Relaxed) {
                boff.spin();
            }
        }
    }

    fn signal_boost(&self) {
        test_trace!("SpinGate::signal_boost");
        self.signaled.store(true, Release);
    }
}

impl Default for SpinGate {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpinGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinGate")
            .field("signaled", &self.is_signaled())
            .field("max_backoff", &self.max_backoff)
            .finish()
    }
}

feature! {
    #![any(test, feature = "std")]

    use crate::loom::sync::{Condvar, Mutex};
    use std::sync::PoisonError;

    /// A [`Gate`] that blocks the waiting OS thread on a [`Condvar`].
    ///
    /// Priority boosting is left to the host scheduler.
    ///
    /// [`Condvar`]: std::sync::Condvar
    #[derive(Debug)]
    pub struct CondvarGate {
        signaled: Mutex<bool>,
        condvar: Condvar,
    }

    impl CondvarGate {
        /// Returns a new, unsignaled `CondvarGate`.
        #[must_use]
        pub fn new() -> Self {
            Self {
                signaled: Mutex::new(false),
                condvar: Condvar::new(),
            }
        }
    }

    impl Gate for CondvarGate {
        #[cfg_attr(not(test), allow(unused_variables))]
        fn wait(&self, reason: WaitReason) {
            let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
            while !*signaled {
                test_trace!(?reason, "CondvarGate::wait -> blocking");
                signaled = self
                    .condvar
                    .wait(signaled)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            *signaled = false;
        }

        fn signal_boost(&self) {
            let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
            *signaled = true;
            drop(signaled);
            self.condvar.notify_one();
        }
    }

    impl Default for CondvarGate {
        fn default() -> Self {
            Self::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::{self, sync::Arc, thread};

    #[test]
    #[cfg(not(loom))]
    fn signal_before_wait_is_kept() {
        let gate = SpinGate::new();
        assert!(!gate.is_signaled());
        gate.signal_boost();
        assert!(gate.is_signaled());

        gate.wait(WaitReason::Executive);
        assert!(!gate.is_signaled(), "wait consumes the signal");
    }

    #[test]
    #[cfg(not(loom))]
    fn condvar_signal_before_wait_is_kept() {
        let gate = CondvarGate::new();
        gate.signal_boost();
        gate.wait(WaitReason::Executive);
        assert!(!*gate.signaled.lock().unwrap());
    }

    #[test]
    #[cfg(not(loom))]
    #[should_panic]
    fn spin_gate_backoff_is_bounded() {
        let _ = SpinGate::with_backoff_max(Backoff::DEFAULT_MAX_EXPONENT + 1);
    }

    fn wakes_waiter<G: Gate + Send + 'static>(new_gate: fn() -> G) {
        loom::model(move || {
            let gate = Arc::new(new_gate());
            let waiter = thread::spawn({
                let gate = gate.clone();
                move || gate.wait(WaitReason::Executive)
            });

            gate.signal_boost();
            waiter.join().unwrap();
        })
    }

    #[test]
    fn spin_gate_wakes_waiter() {
        wakes_waiter(|| SpinGate::with_backoff_max(2));
    }

    #[test]
    fn condvar_gate_wakes_waiter() {
        wakes_waiter(CondvarGate::new);
    }
}
