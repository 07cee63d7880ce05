#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg, doc_cfg_hide))]
#![cfg_attr(docsrs, doc(cfg_hide(docsrs, loom)))]
#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs, missing_debug_implementations)]

pub(crate) mod loom;

#[macro_use]
pub mod util;

pub mod gate;
pub mod guarded_mutex;
pub mod region;
pub mod thread;

#[doc(inline)]
pub use self::gate::{Gate, SpinGate, WaitReason};
#[doc(inline)]
pub use self::guarded_mutex::{GuardedLock, GuardedLockGuard, GuardedMutex};
#[doc(inline)]
pub use self::region::{CriticalRegion, GuardedRegion, Region};
#[doc(inline)]
pub use self::thread::{ApcClass, ApcDelivery, CurrentThread, NoDelivery, Thread, ThreadId};
pub use kesync_slist as slist;
#[doc(inline)]
pub use kesync_slist::{AtomicStack, Chain, Linked, Links};

feature! {
    #![any(test, feature = "std")]
    #[doc(inline)]
    pub use self::gate::CondvarGate;
}

/// A violation of the calling contract of one of this crate's primitives.
///
/// Violations are programming errors in the caller. Most are detected by
/// debug assertions, whose panic messages are formatted from this type; only
/// [`CurrentThread::verify_apc_balance`] returns one as a value, so that a
/// scheduler can turn it into a fatal system error at a service boundary.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ContractViolation {
    /// A thread tried to acquire a [`GuardedMutex`] it already owns.
    #[error("{thread} tried to recursively acquire a guarded mutex it already owns")]
    RecursiveAcquire {
        /// The thread that attempted the acquire.
        thread: ThreadId,
    },

    /// A thread released a [`GuardedMutex`] that it does not own.
    #[error("{thread} released a guarded mutex owned by {owner:?}")]
    NotOwner {
        /// The thread that attempted the release.
        thread: ThreadId,
        /// The mutex's owner at the time of the release.
        owner: Option<ThreadId>,
    },

    /// A region was entered while its disable count was positive, or while
    /// the count was already at its maximum nesting depth.
    #[error("cannot enter a {region} region: disable count is {disable}")]
    RegionOverflow {
        /// The region being entered.
        region: Region,
        /// The disable count at the time of the enter.
        disable: i16,
    },

    /// A region was left more times than it was entered.
    #[error("left a {region} region that was never entered")]
    RegionUnderflow {
        /// The region being left.
        region: Region,
    },

    /// A thread reached a point where it must not be inside any region (such
    /// as returning from a system service) with a region still entered.
    #[error(
        "APC index mismatch: kernel APC disable = {kernel_apc_disable}, \
        special APC disable = {special_apc_disable}"
    )]
    ApcIndexMismatch {
        /// The thread's kernel APC disable count.
        kernel_apc_disable: i16,
        /// The thread's special APC disable count.
        special_apc_disable: i16,
    },

    /// An APC of the given class was delivered while delivery of that class
    /// is suppressed on the current thread.
    #[error("{class} APC delivered while {class} APC delivery is suppressed")]
    DeliverySuppressed {
        /// The class of APC being delivered.
        class: ApcClass,
    },

    /// One of the `_unsafe` [`GuardedMutex`] operations was called by a
    /// thread that is not already suppressing APC delivery.
    #[error("{thread} called an unsafe guarded mutex operation with APCs enabled")]
    ApcsEnabled {
        /// The calling thread.
        thread: ThreadId,
    },
}
