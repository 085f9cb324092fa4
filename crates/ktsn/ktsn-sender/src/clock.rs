//! TAI-nanosecond wall clock.
//!
//! `txtime` is defined (§3, GLOSSARY) as a TAI-nanosecond timestamp, but
//! `original_source/src/kt_common.c`'s `kt_get_realtime_ns` reads
//! `CLOCK_REALTIME` — UTC, currently 37 leap seconds behind TAI. Comparing a
//! `CLOCK_REALTIME` `now` against a TAI `txtime` would shift every deadline
//! by that offset, so this port reads `CLOCK_TAI` instead (see DESIGN.md for
//! the open-question resolution).

/// Current time in TAI nanoseconds.
pub fn now_ns() -> i64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `ts` is a valid, locally owned out-parameter.
    unsafe {
        libc::clock_gettime(libc::CLOCK_TAI, &mut ts);
    }
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}
