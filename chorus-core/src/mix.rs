//! In-place addition of client samples into a device buffer.
//!
//! Integer paths scale by a Q15 volume with round-to-nearest (ties to even)
//! and saturate at the encoding's range; the float path clips to [-1, 1].

use chorus_protocol::types::SampleEncoding;

use crate::ring::VOLUME_SHIFT;

const S24_MAX: i32 = (1 << 23) - 1;
const S24_MIN: i32 = -(1 << 23);

/// Mix `n_frames` frames of `src` into `dst`, both interleaved in
/// `encoding`. Returns the frame count summed; a muted mix is a no-op that
/// still reports `n_frames` so the caller's bookkeeping sees the stream as
/// serviced.
pub fn mix_add(
    dst: &mut [u8],
    src: &[u8],
    n_frames: usize,
    channels: u32,
    encoding: SampleEncoding,
    volume_q: i32,
    mute: bool,
) -> usize {
    if mute {
        return n_frames;
    }
    let samples = n_frames * channels as usize;
    match encoding {
        SampleEncoding::S16_LE => {
            let dst: &mut [i16] = bytemuck::cast_slice_mut(dst);
            let src: &[i16] = bytemuck::cast_slice(src);
            for (d, s) in dst[..samples].iter_mut().zip(&src[..samples]) {
                let scaled = scale(i64::from(*s), volume_q);
                *d = (i64::from(*d) + scaled).clamp(i16::MIN.into(), i16::MAX.into()) as i16;
            }
        }
        SampleEncoding::S24_LE => {
            let dst: &mut [i32] = bytemuck::cast_slice_mut(dst);
            let src: &[i32] = bytemuck::cast_slice(src);
            for (d, s) in dst[..samples].iter_mut().zip(&src[..samples]) {
                let scaled = scale(i64::from(*s), volume_q);
                *d = (i64::from(*d) + scaled).clamp(S24_MIN.into(), S24_MAX.into()) as i32;
            }
        }
        SampleEncoding::S32_LE => {
            let dst: &mut [i32] = bytemuck::cast_slice_mut(dst);
            let src: &[i32] = bytemuck::cast_slice(src);
            for (d, s) in dst[..samples].iter_mut().zip(&src[..samples]) {
                let scaled = scale(i64::from(*s), volume_q);
                *d = (i64::from(*d) + scaled).clamp(i32::MIN.into(), i32::MAX.into()) as i32;
            }
        }
        SampleEncoding::F32_LE => {
            let dst: &mut [f32] = bytemuck::cast_slice_mut(dst);
            let src: &[f32] = bytemuck::cast_slice(src);
            let volume = volume_q as f32 / (1 << VOLUME_SHIFT) as f32;
            for (d, s) in dst[..samples].iter_mut().zip(&src[..samples]) {
                *d = (*d + *s * volume).clamp(-1.0, 1.0);
            }
        }
        _ => unreachable!("mix_add called with invalid encoding"),
    }
    n_frames
}

/// Scale a sample by a Q15 volume, rounding to nearest with ties to even.
fn scale(sample: i64, volume_q: i32) -> i64 {
    round_shift_even(sample * i64::from(volume_q), VOLUME_SHIFT)
}

fn round_shift_even(v: i64, shift: u32) -> i64 {
    let half = 1i64 << (shift - 1);
    let floor = v >> shift;
    let rem = v - (floor << shift);
    if rem > half {
        floor + 1
    } else if rem < half {
        floor
    } else {
        floor + (floor & 1)
    }
}
