use std::time::Duration;

use nix::sys::time::{TimeSpec, TimeValLike};
use nix::time::ClockId;

/// The servicing clock. Monotonic so deadlines survive wall-clock jumps.
pub fn now() -> TimeSpec {
    nix::time::clock_gettime(ClockId::CLOCK_MONOTONIC)
        .expect("clock_gettime(CLOCK_MONOTONIC) failed, are we on Linux?")
}

pub fn now_micros() -> u64 {
    micros(now())
}

/// Microseconds since the epoch, for jack plug timestamps.
pub fn realtime_micros() -> u64 {
    let timespec = nix::time::clock_gettime(ClockId::CLOCK_REALTIME)
        .expect("clock_gettime(CLOCK_REALTIME) failed");
    micros(timespec)
}

fn micros(timespec: TimeSpec) -> u64 {
    u64::try_from(timespec.num_microseconds())
        .expect("cannot convert i64 time value to u64")
}

/// Absolute deadline `after` from now, for TFD_TIMER_ABSTIME.
pub fn deadline_after(after: Duration) -> TimeSpec {
    now() + TimeSpec::from_duration(after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines_are_monotonic() {
        let mut last = now();
        for _ in 0..1000 {
            let next = deadline_after(Duration::from_micros(10));
            assert!(next >= last);
            last = next;
        }
    }
}
