//! Conversions between frame counts and wall time.

use std::time::Duration;

pub fn frames_to_duration(frames: u64, rate_hz: u32) -> Duration {
    let nanos = u128::from(frames) * 1_000_000_000 / u128::from(rate_hz);
    let nanos = u64::try_from(nanos).expect("frame count too large for Duration");
    Duration::from_nanos(nanos)
}

pub fn duration_to_frames(duration: Duration, rate_hz: u32) -> u64 {
    let frames = duration.as_nanos() * u128::from(rate_hz) / 1_000_000_000;
    u64::try_from(frames).expect("duration too large for frame count")
}

/// Time until a sample `frames` ahead of the write position plays, given
/// `delay` frames already queued in front of it. Zero when the sample is
/// already due.
pub fn fill_time_from_frames(frames: u64, delay: u64, rate_hz: u32) -> Duration {
    frames_to_duration(frames.saturating_sub(delay), rate_hz)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: Duration = Duration::from_nanos(100_000);

    fn close(actual: Duration, expect: Duration) -> bool {
        let delta = if actual > expect { actual - expect } else { expect - actual };
        delta <= TOLERANCE
    }

    #[test]
    fn fill_time_normal() {
        let t = fill_time_from_frames(24000, 12000, 48000);
        assert_eq!(t.as_secs(), 0);
        assert!(close(t, Duration::from_nanos(250_000_000)), "{t:?}");
    }

    #[test]
    fn fill_time_long() {
        let t = fill_time_from_frames(120000, 12000, 48000);
        assert_eq!(t.as_secs(), 2);
        assert!(close(t, Duration::from_millis(2250)), "{t:?}");
    }

    #[test]
    fn fill_time_short() {
        assert_eq!(fill_time_from_frames(12000, 12000, 48000), Duration::ZERO);
    }

    #[test]
    fn frames_duration_roundtrip() {
        let d = frames_to_duration(44100, 44100);
        assert_eq!(d, Duration::from_secs(1));
        assert_eq!(duration_to_frames(d, 44100), 44100);
    }
}
