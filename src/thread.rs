//! Per-thread asynchronous procedure call (APC) state.
//!
//! Every kernel thread carries an [`ApcState`]: two nesting counters that
//! suppress delivery of the two classes of kernel APCs, a summary of the
//! thread's queue of pending normal kernel APCs, and a flag that is set while
//! a special kernel APC runs. The counters are written only by the thread
//! itself, through a [`CurrentThread`] handle. Other processors may read them
//! for diagnostics.
//!
//! The APC queue and the routine that actually delivers queued APCs belong to
//! the embedder. The queue reports its length through
//! [`Thread::note_kernel_apc_queued`] and [`Thread::note_kernel_apc_dequeued`],
//! and the delivery routine is reached through the [`ApcDelivery`] trait.
use crate::{
    loom::sync::atomic::{AtomicBool, AtomicI16, AtomicUsize, Ordering::*},
    ContractViolation,
};
use core::{fmt, marker::PhantomData, num::NonZeroUsize};

/// Identifies a kernel thread.
///
/// Thread IDs are never zero, so that an `Option<ThreadId>` fits in a
/// `usize` and a zero word can mean "no thread".
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ThreadId(NonZeroUsize);

/// A class of kernel APC.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ApcClass {
    /// Normal kernel APCs. Suppressed by critical and guarded regions.
    Normal,
    /// Special kernel APCs. Suppressed only by guarded regions.
    Special,
}

/// The routine that delivers queued kernel APCs to a thread.
///
/// When a thread leaves its outermost region while normal kernel APCs are
/// queued, it calls [`check_for_delivery`](Self::check_for_delivery) on its
/// own delivery routine. The routine may run the queued APCs synchronously
/// (consulting [`CurrentThread::may_deliver`] and wrapping special APCs in
/// [`CurrentThread::run_special_apc`]), request a software interrupt, or do
/// nothing at all.
pub trait ApcDelivery: Sync {
    /// Called on `thread` when APC delivery may have become possible.
    fn check_for_delivery(&self, thread: &CurrentThread<'_>);
}

/// An [`ApcDelivery`] that never delivers anything.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoDelivery;

/// A kernel thread's synchronization state.
///
/// A `Thread` is owned by the scheduler. The primitives in this crate only
/// ever borrow it, through a [`CurrentThread`].
pub struct Thread {
    id: ThreadId,
    apc: ApcState,
    delivery: &'static dyn ApcDelivery,
}

/// The APC suppression state of a [`Thread`].
#[derive(Debug)]
pub struct ApcState {
    /// Nesting count of critical regions, as a non-positive number.
    kernel_apc_disable: AtomicI16,
    /// Nesting count of guarded regions, as a non-positive number.
    special_apc_disable: AtomicI16,
    pending_kernel_apcs: AtomicUsize,
    special_apc_in_progress: AtomicBool,
}

/// A handle to the [`Thread`] that is currently executing.
///
/// Everything that mutates per-thread state takes a `CurrentThread`. The
/// handle is neither `Send` nor `Sync`, so it cannot leave the thread it was
/// created on.
#[derive(Copy, Clone)]
pub struct CurrentThread<'t> {
    thread: &'t Thread,
    _not_send: PhantomData<*const ()>,
}

// === impl ThreadId ===

impl ThreadId {
    /// Returns a `ThreadId` from a raw non-zero value.
    #[must_use]
    pub const fn from_raw(id: NonZeroUsize) -> Self {
        Self(id)
    }

    /// Returns a new, process-unique `ThreadId`.
    ///
    /// IDs are allocated from a global counter starting at 1.
    #[must_use]
    pub fn next() -> Self {
        // Not a loom atomic: it lives in a static, outside of any model.
        use portable_atomic::{AtomicUsize, Ordering::Relaxed};

        static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
        let id = NEXT_ID.fetch_add(1, Relaxed);
        match NonZeroUsize::new(id) {
            Some(id) => Self(id),
            None => panic!("thread IDs exhausted"),
        }
    }

    /// Returns the raw value of this ID.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0.get()
    }

    /// Decodes an owner word, where 0 means "no thread".
    #[must_use]
    pub(crate) const fn from_usize(id: usize) -> Option<Self> {
        match NonZeroUsize::new(id) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread {}", self.0)
    }
}

// === impl ApcClass ===

impl fmt::Display for ApcClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Normal => "normal kernel",
            Self::Special => "special kernel",
        })
    }
}

// === impl NoDelivery ===

impl ApcDelivery for NoDelivery {
    #[inline]
    fn check_for_delivery(&self, _: &CurrentThread<'_>) {}
}

// === impl Thread ===

impl Thread {
    loom_const_fn! {
        /// Returns a new `Thread` with the given ID and APC delivery routine.
        ///
        /// The new thread is not inside any region and has no pending APCs.
        #[must_use]
        pub fn new(id: ThreadId, delivery: &'static dyn ApcDelivery) -> Thread {
            Thread {
                id,
                apc: ApcState {
                    kernel_apc_disable: AtomicI16::new(0),
                    special_apc_disable: AtomicI16::new(0),
                    pending_kernel_apcs: AtomicUsize::new(0),
                    special_apc_in_progress: AtomicBool::new(false),
                },
                delivery,
            }
        }
    }

    /// Returns this thread's ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Returns a snapshot view of this thread's APC state.
    #[inline]
    #[must_use]
    pub fn apc_state(&self) -> &ApcState {
        &self.apc
    }

    /// Records that a normal kernel APC was inserted into this thread's queue.
    ///
    /// This may be called from any processor.
    pub fn note_kernel_apc_queued(&self) {
        let pending = self.apc.pending_kernel_apcs.fetch_add(1, Release) + 1;
        test_debug!(thread = %self.id, pending, "kernel APC queued");
    }

    /// Records that a normal kernel APC was removed from this thread's queue.
    ///
    /// # Panics
    ///
    /// In debug builds, if no APC was queued.
    pub fn note_kernel_apc_dequeued(&self) {
        let prev = self.apc.pending_kernel_apcs.fetch_sub(1, Release);
        debug_assert_ne!(prev, 0, "dequeued a kernel APC from an empty queue");
        test_debug!(thread = %self.id, pending = prev.wrapping_sub(1), "kernel APC dequeued");
    }

    /// Returns `true` if any normal kernel APCs are queued for this thread.
    #[inline]
    #[must_use]
    pub fn kernel_apc_pending(&self) -> bool {
        self.apc.pending_kernel_apcs.load(Acquire) != 0
    }

    pub(crate) fn delivery(&self) -> &'static dyn ApcDelivery {
        self.delivery
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("apc", &self.apc)
            .finish_non_exhaustive()
    }
}

// === impl ApcState ===

impl ApcState {
    /// Returns the kernel APC disable count: minus the critical region
    /// nesting depth.
    #[inline]
    #[must_use]
    pub fn kernel_apc_disable(&self) -> i16 {
        self.kernel_apc_disable.load(Relaxed)
    }

    /// Returns the special APC disable count: minus the guarded region
    /// nesting depth.
    #[inline]
    #[must_use]
    pub fn special_apc_disable(&self) -> i16 {
        self.special_apc_disable.load(Relaxed)
    }

    /// Returns the number of queued normal kernel APCs.
    #[inline]
    #[must_use]
    pub fn pending_kernel_apcs(&self) -> usize {
        self.pending_kernel_apcs.load(Acquire)
    }

    /// Returns `true` while a special kernel APC is running on the thread.
    #[inline]
    #[must_use]
    pub fn is_special_apc_in_progress(&self) -> bool {
        self.special_apc_in_progress.load(Relaxed)
    }

    pub(crate) fn counter(&self, class: ApcClass) -> &AtomicI16 {
        match class {
            ApcClass::Normal => &self.kernel_apc_disable,
            ApcClass::Special => &self.special_apc_disable,
        }
    }
}

// === impl CurrentThread ===

impl<'t> CurrentThread<'t> {
    /// Returns a handle to `thread`.
    ///
    /// The caller must be running as `thread`. Creating handles to the same
    /// `Thread` on two processors at once breaks the single-writer rule for
    /// its region counters; this cannot cause memory unsafety, but the
    /// counters and the delivery decisions made from them will be wrong.
    #[must_use]
    pub fn new(thread: &'t Thread) -> Self {
        Self {
            thread,
            _not_send: PhantomData,
        }
    }

    /// Returns the underlying [`Thread`].
    #[inline]
    #[must_use]
    pub fn thread(&self) -> &'t Thread {
        self.thread
    }

    /// Returns the current thread's ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.thread.id
    }

    /// Returns `true` if delivery of an APC of the given class is permitted
    /// on this thread right now.
    ///
    /// Special kernel APCs are blocked by a guarded region, or while another
    /// special APC is already running. Normal kernel APCs are blocked by
    /// all of that and by a critical region.
    #[must_use]
    pub fn may_deliver(&self, class: ApcClass) -> bool {
        let apc = &self.thread.apc;
        if apc.special_apc_disable() != 0 || apc.is_special_apc_in_progress() {
            return false;
        }

        match class {
            ApcClass::Special => true,
            ApcClass::Normal => apc.kernel_apc_disable() == 0,
        }
    }

    /// Runs `f` as a special kernel APC on this thread.
    ///
    /// While `f` runs, [`may_deliver`](Self::may_deliver) returns `false` for
    /// both classes, so a delivery routine invoked from inside `f` will not
    /// nest further APCs.
    ///
    /// # Panics
    ///
    /// In debug builds, if special APC delivery is currently suppressed.
    pub fn run_special_apc<R>(&self, f: impl FnOnce() -> R) -> R {
        contract!(
            self.may_deliver(ApcClass::Special),
            ContractViolation::DeliverySuppressed {
                class: ApcClass::Special
            },
        );

        struct InProgress<'a>(&'a AtomicBool);

        impl Drop for InProgress<'_> {
            fn drop(&mut self) {
                self.0.store(false, Relaxed);
            }
        }

        let in_progress = &self.thread.apc.special_apc_in_progress;
        in_progress.store(true, Relaxed);
        let _in_progress = InProgress(in_progress);
        test_trace!(thread = %self.id(), "running special kernel APC");
        f()
    }

    /// Checks that this thread is not inside any critical or guarded region.
    ///
    /// Schedulers call this on the way out of a system service or
    /// asynchronous callback, where an unbalanced region is a fatal error.
    ///
    /// # Errors
    ///
    /// Returns [`ContractViolation::ApcIndexMismatch`] with both counters if
    /// either is non-zero.
    pub fn verify_apc_balance(&self) -> Result<(), ContractViolation> {
        let apc = &self.thread.apc;
        let kernel_apc_disable = apc.kernel_apc_disable();
        let special_apc_disable = apc.special_apc_disable();
        if kernel_apc_disable != 0 || special_apc_disable != 0 {
            return Err(ContractViolation::ApcIndexMismatch {
                kernel_apc_disable,
                special_apc_disable,
            });
        }

        Ok(())
    }

    /// Invokes this thread's delivery routine.
    #[inline(never)]
    pub(crate) fn check_for_delivery(&self) {
        trace!(thread = %self.id(), "checking for APC delivery");
        self.thread.delivery().check_for_delivery(self);
    }
}

impl fmt::Debug for CurrentThread<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CurrentThread").field(&self.thread.id).finish()
    }
}
