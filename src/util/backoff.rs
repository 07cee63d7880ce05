/// An [exponential backoff] for spin loops.
///
/// Each call to [`spin`](Self::spin) issues `2^exp` spin-loop hints and then
/// bumps the exponent, up to a configured maximum. [`SpinGate`] uses this
/// while polling for a signal.
///
/// [exponential backoff]: https://en.wikipedia.org/wiki/Exponential_backoff
/// [`SpinGate`]: crate::gate::SpinGate
#[derive(Debug, Copy, Clone)]
pub struct Backoff {
    exp: u8,
    max: u8,
}

// === impl Backoff ===

impl Backoff {
    /// The default maximum exponent (2^8).
    ///
    /// This is the maximum exponent returned by [`Backoff::new()`] and
    /// [`Backoff::default()`]. To override the maximum exponent, use
    /// [`Backoff::with_max_exponent()`].
    pub const DEFAULT_MAX_EXPONENT: u8 = 8;

    /// Returns a new exponential backoff with the maximum exponent set to
    /// [`Self::DEFAULT_MAX_EXPONENT`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            exp: 0,
            max: Self::DEFAULT_MAX_EXPONENT,
        }
    }

    /// Returns a new exponential backoff with the provided max exponent.
    ///
    /// # Panics
    ///
    /// If `max` is greater than [`Self::DEFAULT_MAX_EXPONENT`].
    #[must_use]
    pub const fn with_max_exponent(max: u8) -> Self {
        assert!(
            max <= Self::DEFAULT_MAX_EXPONENT,
            "backoff exponent may not exceed `Backoff::DEFAULT_MAX_EXPONENT`"
        );
        Self { exp: 0, max }
    }

    /// Backs off in a spin loop.
    ///
    /// Depending on the target architecture, this will generally issue a
    /// sequence of `yield` or `pause` instructions. Under loom, the current
    /// thread yields to the model scheduler instead.
    #[inline(always)]
    pub fn spin(&mut self) {
        #[cfg_attr(loom, allow(unused_variables))]
        let spins = 1u32 << self.exp;

        #[cfg(not(loom))]
        for _ in 0..spins {
            crate::loom::hint::spin_loop();
        }

        #[cfg(loom)]
        {
            test_debug!("would back off for {spins} spins");
            loom::thread::yield_now();
        }

        if self.exp < self.max {
            self.exp += 1
        }
    }

    /// Returns `true` if the backoff has reached its maximum exponent.
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.exp >= self.max
    }

    /// Resets the exponent to 0, so that the next [`spin`](Self::spin) issues
    /// a single hint.
    pub fn reset(&mut self) {
        self.exp = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn saturates_at_max() {
        let mut boff = Backoff::with_max_exponent(2);
        assert!(!boff.is_saturated());
        boff.spin();
        boff.spin();
        assert!(boff.is_saturated());
        boff.spin();
        assert!(boff.is_saturated());

        boff.reset();
        assert!(!boff.is_saturated());
    }

    #[test]
    #[should_panic]
    fn max_exponent_is_bounded() {
        let _ = Backoff::with_max_exponent(Backoff::DEFAULT_MAX_EXPONENT + 1);
    }
}
