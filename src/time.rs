//! Monotonic microsecond time source used by sleeps and deadlines.

/// Current time in microseconds since an arbitrary, monotonically
/// increasing epoch. Never jumps backward, unlike wall-clock time.
pub fn now_us() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    assert_eq!(ret, 0, "clock_gettime(CLOCK_MONOTONIC) failed");
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_non_decreasing() {
        let a = now_us();
        let b = now_us();
        assert!(b >= a);
    }
}
