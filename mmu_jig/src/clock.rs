use lazy_static::lazy_static;
use mmu_link::{Clock, Instant};

/// Milliseconds since the jig started, wrapping like a firmware tick counter
pub fn cur_millis() -> u32 {
    use std::time::Instant;
    lazy_static! {
        static ref BEGIN: Instant = Instant::now();
    }
    (BEGIN.elapsed().as_millis() & 0xFFFF_FFFF) as u32
}

#[derive(Debug, Default, Copy, Clone)]
pub struct HostClock;

impl Clock for HostClock {
    fn now(&self) -> Instant {
        Instant::from_millis(cur_millis())
    }
}
