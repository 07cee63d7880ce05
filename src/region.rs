//! Critical and guarded regions.
//!
//! A thread enters a region to stop kernel APCs from being delivered to it.
//! Regions nest: each [`Region`] kind has a per-thread counter that holds
//! minus the current nesting depth, and delivery of the suppressed class
//! resumes only when the counter climbs back to zero.
//!
//! - A **critical region** suppresses normal kernel APCs.
//! - A **guarded region** suppresses special kernel APCs. Since normal APCs
//!   are never delivered while special delivery is blocked, a guarded region
//!   suppresses both classes.
//!
//! On leaving the outermost region of a kind, if normal kernel APCs are
//! queued and nothing else still suppresses them, the thread calls its
//! [`ApcDelivery`](crate::ApcDelivery) routine.
//!
//! Regions are entered and left either explicitly, through
//! [`CurrentThread::enter_region`] and [`CurrentThread::leave_region`], or
//! with the RAII guards returned by [`CurrentThread::critical_region`] and
//! [`CurrentThread::guarded_region`].
use crate::{
    loom::sync::atomic::{AtomicI16, Ordering::Relaxed},
    thread::{ApcClass, CurrentThread},
    ContractViolation,
};
use core::{
    fmt,
    sync::atomic::{compiler_fence, Ordering::SeqCst},
};

/// A kind of APC-suppressing region.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Region {
    /// Suppresses normal kernel APCs.
    Critical,
    /// Suppresses special kernel APCs, and with them, normal kernel APCs.
    Guarded,
}

/// An RAII guard for a critical region.
///
/// Returned by [`CurrentThread::critical_region`]. The region is left when the
/// guard is dropped.
#[must_use = "dropping a `CriticalRegion` immediately leaves the region"]
pub struct CriticalRegion<'t> {
    thread: CurrentThread<'t>,
}

/// An RAII guard for a guarded region.
///
/// Returned by [`CurrentThread::guarded_region`]. The region is left when the
/// guard is dropped.
#[must_use = "dropping a `GuardedRegion` immediately leaves the region"]
pub struct GuardedRegion<'t> {
    thread: CurrentThread<'t>,
}

// === impl Region ===

impl Region {
    /// Returns the class of APC whose disable count this region adjusts.
    #[must_use]
    pub const fn suppresses(self) -> ApcClass {
        match self {
            Self::Critical => ApcClass::Normal,
            Self::Guarded => ApcClass::Special,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Critical => "critical",
            Self::Guarded => "guarded",
        })
    }
}

// === impl CurrentThread ===

impl<'t> CurrentThread<'t> {
    /// Enters a region of the given kind on this thread.
    ///
    /// # Panics
    ///
    /// In debug builds, if the region's disable count is positive, or if
    /// regions of this kind are already nested `i16::MAX + 1` deep.
    #[inline]
    pub fn enter_region(&self, region: Region) {
        let counter = self.disable_count(region);
        let disable = counter.load(Relaxed);
        contract!(
            disable <= 0 && disable != i16::MIN,
            ContractViolation::RegionOverflow { region, disable },
        );
        counter.store(disable.wrapping_sub(1), Relaxed);
        compiler_fence(SeqCst);
    }

    /// Leaves a region of the given kind on this thread.
    ///
    /// If this was the outermost region of its kind, normal kernel APCs are
    /// queued, and (when leaving a critical region) no guarded region is
    /// active, the thread's delivery routine is invoked before this returns.
    ///
    /// # Panics
    ///
    /// In debug builds, if no region of this kind was entered.
    #[inline]
    pub fn leave_region(&self, region: Region) {
        compiler_fence(SeqCst);
        let counter = self.disable_count(region);
        let disable = counter.load(Relaxed);
        contract!(disable < 0, ContractViolation::RegionUnderflow { region });
        let disable = disable.wrapping_add(1);
        counter.store(disable, Relaxed);

        if disable == 0 && self.thread().kernel_apc_pending() {
            let special_suppressed = match region {
                Region::Critical => self.thread().apc_state().special_apc_disable() != 0,
                Region::Guarded => false,
            };
            if !special_suppressed {
                self.check_for_delivery();
            }
        }
    }

    /// Enters a critical region, suppressing normal kernel APCs.
    #[inline]
    pub fn enter_critical_region(&self) {
        self.enter_region(Region::Critical)
    }

    /// Leaves a critical region.
    ///
    /// See [`leave_region`](Self::leave_region).
    #[inline]
    pub fn leave_critical_region(&self) {
        self.leave_region(Region::Critical)
    }

    /// Enters a guarded region, suppressing all kernel APCs.
    #[inline]
    pub fn enter_guarded_region(&self) {
        self.enter_region(Region::Guarded)
    }

    /// Leaves a guarded region.
    ///
    /// See [`leave_region`](Self::leave_region).
    #[inline]
    pub fn leave_guarded_region(&self) {
        self.leave_region(Region::Guarded)
    }

    /// Enters a critical region, returning a guard that leaves it on drop.
    pub fn critical_region(&self) -> CriticalRegion<'t> {
        self.enter_critical_region();
        CriticalRegion { thread: *self }
    }

    /// Enters a guarded region, returning a guard that leaves it on drop.
    pub fn guarded_region(&self) -> GuardedRegion<'t> {
        self.enter_guarded_region();
        GuardedRegion { thread: *self }
    }

    /// Returns `true` if this thread is inside any critical or guarded
    /// region.
    #[inline]
    #[must_use]
    pub fn are_apcs_disabled(&self) -> bool {
        let apc = self.thread().apc_state();
        apc.kernel_apc_disable() != 0 || apc.special_apc_disable() != 0
    }

    /// Returns `true` if this thread is inside a guarded region, so that no
    /// kernel APCs of either class can be delivered.
    #[inline]
    #[must_use]
    pub fn are_all_apcs_disabled(&self) -> bool {
        self.thread().apc_state().special_apc_disable() != 0
    }

    fn disable_count(&self, region: Region) -> &'t AtomicI16 {
        self.thread().apc_state().counter(region.suppresses())
    }
}

// === impl CriticalRegion ===

impl Drop for CriticalRegion<'_> {
    #[inline]
    fn drop(&mut self) {
        self.thread.leave_critical_region();
    }
}

impl fmt::Debug for CriticalRegion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalRegion")
            .field("thread", &self.thread)
            .finish()
    }
}

// === impl GuardedRegion ===

impl Drop for GuardedRegion<'_> {
    #[inline]
    fn drop(&mut self) {
        self.thread.leave_guarded_region();
    }
}

impl fmt::Debug for GuardedRegion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedRegion")
            .field("thread", &self.thread)
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::thread::{ApcDelivery, NoDelivery, Thread, ThreadId};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountChecks(AtomicUsize);

    impl ApcDelivery for CountChecks {
        fn check_for_delivery(&self, _: &CurrentThread<'_>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CountChecks {
        fn leaked() -> &'static Self {
            Box::leak(Box::default())
        }

        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn enter_leave_counts() {
        let thread = Thread::new(ThreadId::next(), &NoDelivery);
        let current = CurrentThread::new(&thread);

        current.enter_critical_region();
        current.enter_critical_region();
        current.enter_guarded_region();
        assert_eq!(thread.apc_state().kernel_apc_disable(), -2);
        assert_eq!(thread.apc_state().special_apc_disable(), -1);
        assert!(current.are_apcs_disabled());
        assert!(current.are_all_apcs_disabled());

        current.leave_guarded_region();
        assert!(current.are_apcs_disabled());
        assert!(!current.are_all_apcs_disabled());

        current.leave_critical_region();
        current.leave_critical_region();
        assert!(!current.are_apcs_disabled());
    }

    #[test]
    fn two_enters_one_leave_does_not_check() {
        let delivery = CountChecks::leaked();
        let thread = Thread::new(ThreadId::next(), delivery);
        let current = CurrentThread::new(&thread);
        thread.note_kernel_apc_queued();

        current.enter_critical_region();
        current.enter_critical_region();
        current.leave_critical_region();
        assert_eq!(delivery.count(), 0);

        current.leave_critical_region();
        assert_eq!(delivery.count(), 1);
    }

    #[test]
    fn no_check_without_pending_apcs() {
        let delivery = CountChecks::leaked();
        let thread = Thread::new(ThreadId::next(), delivery);
        let current = CurrentThread::new(&thread);

        current.enter_critical_region();
        current.leave_critical_region();
        current.enter_guarded_region();
        current.leave_guarded_region();
        assert_eq!(delivery.count(), 0);
    }

    #[test]
    fn guarded_region_blocks_critical_leave_check() {
        let delivery = CountChecks::leaked();
        let thread = Thread::new(ThreadId::next(), delivery);
        let current = CurrentThread::new(&thread);
        thread.note_kernel_apc_queued();

        current.enter_guarded_region();
        current.enter_critical_region();
        current.leave_critical_region();
        assert_eq!(delivery.count(), 0, "special APCs are still suppressed");

        // the guarded leave checks regardless of the critical count
        current.leave_guarded_region();
        assert_eq!(delivery.count(), 1);
    }

    #[test]
    fn guarded_leave_checks_inside_critical_region() {
        let delivery = CountChecks::leaked();
        let thread = Thread::new(ThreadId::next(), delivery);
        let current = CurrentThread::new(&thread);
        thread.note_kernel_apc_queued();

        current.enter_critical_region();
        current.enter_guarded_region();
        current.leave_guarded_region();
        assert_eq!(delivery.count(), 1);
        assert!(!current.may_deliver(ApcClass::Normal));
        assert!(current.may_deliver(ApcClass::Special));

        current.leave_critical_region();
        assert_eq!(delivery.count(), 2);
    }

    #[test]
    fn guards_leave_on_drop() {
        let delivery = CountChecks::leaked();
        let thread = Thread::new(ThreadId::next(), delivery);
        let current = CurrentThread::new(&thread);
        thread.note_kernel_apc_queued();

        {
            let _critical = current.critical_region();
            {
                let _guarded = current.guarded_region();
                assert!(current.are_all_apcs_disabled());
            }
            assert!(!current.are_all_apcs_disabled());
            assert!(current.are_apcs_disabled());
            assert_eq!(delivery.count(), 1);
        }

        assert!(!current.are_apcs_disabled());
        assert_eq!(delivery.count(), 2);
        assert_eq!(current.verify_apc_balance(), Ok(()));
    }

    #[test]
    #[cfg_attr(not(debug_assertions), ignore)]
    #[should_panic = "left a critical region that was never entered"]
    fn leave_without_enter() {
        let thread = Thread::new(ThreadId::next(), &NoDelivery);
        let current = CurrentThread::new(&thread);
        current.leave_critical_region();
    }

    #[test]
    #[cfg_attr(not(debug_assertions), ignore)]
    #[should_panic = "cannot enter a guarded region"]
    fn nesting_overflow() {
        let thread = Thread::new(ThreadId::next(), &NoDelivery);
        let current = CurrentThread::new(&thread);
        for _ in 0..=(i16::MAX as u32 + 1) {
            current.enter_guarded_region();
        }
    }

    #[test]
    fn region_display() {
        assert_eq!(Region::Critical.to_string(), "critical");
        assert_eq!(Region::Guarded.to_string(), "guarded");
        assert_eq!(Region::Guarded.suppresses(), ApcClass::Special);
    }

    proptest! {
        #[test]
        fn nesting_is_idempotent(
            depth in 1usize..64,
            region in prop_oneof![Just(Region::Critical), Just(Region::Guarded)],
            pending in any::<bool>(),
        ) {
            let delivery = CountChecks::leaked();
            let thread = Thread::new(ThreadId::next(), delivery);
            let current = CurrentThread::new(&thread);
            if pending {
                thread.note_kernel_apc_queued();
            }

            for _ in 0..depth {
                current.enter_region(region);
            }
            let counter = match region {
                Region::Critical => thread.apc_state().kernel_apc_disable(),
                Region::Guarded => thread.apc_state().special_apc_disable(),
            };
            prop_assert_eq!(counter, -(depth as i16));

            for left in 1..=depth {
                current.leave_region(region);
                let expected = usize::from(pending && left == depth);
                prop_assert_eq!(delivery.count(), expected);
            }

            prop_assert_eq!(current.verify_apc_balance(), Ok(()));
        }
    }
}
