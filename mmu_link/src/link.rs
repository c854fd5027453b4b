/// Trait representing the byte stream towards the MMU
///
/// Both directions must be non-blocking. The protocol logic owns the transport exclusively.
pub trait Transport {
    /// Returns the next received byte, if any has arrived
    fn receive(&mut self) -> Option<u8>;

    /// Queues a complete frame for transmission
    fn transmit(&mut self, frame: &[u8]);

    /// Drops any received bytes that have not been read yet
    ///
    /// Called before the link is re-established so stale responses cannot be mistaken for
    /// answers to the new handshake.
    fn discard_input(&mut self) {
        while self.receive().is_some() {}
    }
}

impl<T> Transport for &mut T
where
    T: Transport + ?Sized,
{
    fn receive(&mut self) -> Option<u8> {
        (**self).receive()
    }

    fn transmit(&mut self, frame: &[u8]) {
        (**self).transmit(frame)
    }

    fn discard_input(&mut self) {
        (**self).discard_input()
    }
}

/// Trait representing a monotonic millisecond clock
///
/// The counter may wrap; only differences between readings are ever used.
pub trait Clock {
    fn now(&self) -> Instant;
}

impl<C> Clock for &C
where
    C: Clock + ?Sized,
{
    fn now(&self) -> Instant {
        (*self).now()
    }
}

/// A wrapping millisecond timestamp
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Instant(u32);

impl Instant {
    pub const fn from_millis(ms: u32) -> Instant {
        Instant(ms)
    }

    pub const fn millis(self) -> u32 {
        self.0
    }

    /// Milliseconds from `earlier` to `self`
    pub fn elapsed_since(self, earlier: Instant) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// Whether at least `period` milliseconds passed between `earlier` and `self`
    pub fn expired(self, earlier: Instant, period: u32) -> bool {
        self.elapsed_since(earlier) >= period
    }
}

impl core::ops::Add<u32> for Instant {
    type Output = Self;
    fn add(self, rhs: u32) -> Self::Output {
        Instant(self.0.wrapping_add(rhs))
    }
}

impl core::ops::AddAssign<u32> for Instant {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_across_wraparound() {
        let before = Instant::from_millis(u32::MAX - 10);
        let after = before + 30;
        assert_eq!(after.millis(), 19);
        assert_eq!(after.elapsed_since(before), 30);
        assert!(after.expired(before, 30));
        assert!(!after.expired(before, 31));
    }

    struct Bytes(std::collections::VecDeque<u8>);

    impl Transport for Bytes {
        fn receive(&mut self) -> Option<u8> {
            self.0.pop_front()
        }

        fn transmit(&mut self, _frame: &[u8]) {}
    }

    #[test]
    fn discard_drains_pending_input() {
        let mut bytes = Bytes(b"T0 A*".iter().copied().collect());
        let mut by_ref = &mut bytes;
        Transport::discard_input(&mut by_ref);
        assert_eq!(bytes.receive(), None);
    }
}
