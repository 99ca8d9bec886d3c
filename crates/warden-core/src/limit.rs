/// Per-worker instruction budget and string-size cap.
///
/// One record per execution context: a coroutine worker carries its record,
/// the main caller's lives on the host facade. Fields are atomic because the
/// host resets a worker's counter from another OS thread between ticks.
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct InstructionLimit {
    current: AtomicU64,
    max: AtomicU64,
    max_string_size: AtomicUsize,
}

impl InstructionLimit {
    pub fn new(max_instructions: u64, max_string_size: usize) -> Arc<Self> {
        Arc::new(InstructionLimit {
            current: AtomicU64::new(0),
            max: AtomicU64::new(max_instructions),
            max_string_size: AtomicUsize::new(max_string_size),
        })
    }

    /// Add `n` to the counter. The bound check precedes the store, so a
    /// failed charge leaves `current` untouched and overflow is impossible.
    pub fn try_charge(&self, n: u64) -> Result<(), u64> {
        let max = self.max.load(Ordering::Relaxed);
        let mut cur = self.current.load(Ordering::Relaxed);
        loop {
            if cur.saturating_add(n) > max {
                return Err(max);
            }
            match self.current.compare_exchange_weak(
                cur,
                cur + n,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    pub fn max_string_size(&self) -> usize {
        self.max_string_size.load(Ordering::Relaxed)
    }

    /// True once the budget is spent; a resume in this state must not
    /// execute a single opcode.
    pub fn at_limit(&self) -> bool {
        self.current() >= self.max()
    }

    /// Zero the counter, preserving the configured maxima. Called by the
    /// host between scheduled ticks.
    pub fn reset(&self) {
        self.current.store(0, Ordering::Relaxed);
    }

    /// Reconfigure the maxima, preserving the counter.
    pub fn configure(&self, max_instructions: u64, max_string_size: usize) {
        self.max.store(max_instructions, Ordering::Relaxed);
        self.max_string_size
            .store(max_string_size, Ordering::Relaxed);
    }

    /// Guard for string construction: fails when a would-be intermediate
    /// exceeds the cap.
    pub fn check_string(&self, len: usize) -> Result<(), usize> {
        let cap = self.max_string_size.load(Ordering::Relaxed);
        if len > cap {
            Err(cap)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_up_to_max() {
        let lim = InstructionLimit::new(3, 100);
        assert!(lim.try_charge(1).is_ok());
        assert!(lim.try_charge(1).is_ok());
        assert!(lim.try_charge(1).is_ok());
        assert_eq!(lim.current(), 3);
        assert_eq!(lim.try_charge(1), Err(3));
        // The failed charge did not move the counter.
        assert_eq!(lim.current(), 3);
    }

    #[test]
    fn test_boundary_exact() {
        // max-1 + 1 succeeds; max + 1 fails.
        let lim = InstructionLimit::new(10, 100);
        assert!(lim.try_charge(9).is_ok());
        assert!(lim.try_charge(1).is_ok());
        assert!(lim.try_charge(1).is_err());
    }

    #[test]
    fn test_reset_preserves_max() {
        let lim = InstructionLimit::new(5, 77);
        lim.try_charge(5).unwrap();
        assert!(lim.at_limit());
        lim.reset();
        assert_eq!(lim.current(), 0);
        assert_eq!(lim.max(), 5);
        assert_eq!(lim.max_string_size(), 77);
        assert!(!lim.at_limit());
    }

    #[test]
    fn test_configure_preserves_current() {
        let lim = InstructionLimit::new(1, 100);
        lim.try_charge(1).unwrap();
        lim.configure(500, 200);
        assert_eq!(lim.current(), 1);
        assert_eq!(lim.max(), 500);
        assert_eq!(lim.max_string_size(), 200);
    }

    #[test]
    fn test_string_cap() {
        let lim = InstructionLimit::new(10, 100);
        assert!(lim.check_string(100).is_ok());
        assert_eq!(lim.check_string(101), Err(100));
    }

    #[test]
    fn test_monotone_between_resets() {
        let lim = InstructionLimit::new(1000, 100);
        let mut last = 0;
        for _ in 0..100 {
            lim.try_charge(3).unwrap();
            let cur = lim.current();
            assert!(cur >= last);
            last = cur;
        }
    }
}
