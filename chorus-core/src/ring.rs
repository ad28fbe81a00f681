//! The shared audio ring: a fixed-layout header followed by two
//! half-buffers of samples, mapped into both the server and the client.
//!
//! Each ring has exactly one producer and one consumer by construction
//! (output: client writes, device worker reads; input: the reverse). The
//! ring itself cannot enforce that discipline; creating two writers is a
//! logic error. Sample bytes are published with a release store on
//! `write_offset` and observed with an acquire load, so no lock is needed.
//!
//! Offsets advance modulo `2 * size` rather than `size` so that a
//! completely full ring is distinguishable from an empty one; the position
//! inside the sample area is `offset % size`.

use std::mem::size_of;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use static_assertions::const_assert;
use thiserror::Error;

use crate::shm::ShmRegion;

/// Q-format shift applied to `volume_scaler` at mix time.
pub const VOLUME_SHIFT: u32 = 15;
pub const VOLUME_UNITY: i32 = 1 << VOLUME_SHIFT;

/// Header at the front of every shared audio region. Field order is wire
/// layout; all fields are naturally aligned 32-bit words.
#[repr(C, align(64))]
pub struct RingHeader {
    /// Stride of one multi-channel frame in bytes.
    pub frame_bytes: AtomicU32,
    /// Usable bytes per half-buffer.
    pub used_size: AtomicU32,
    /// Total bytes in the two halves (`2 * used_size`).
    pub size: AtomicU32,
    pub write_offset: AtomicU32,
    pub read_offset: AtomicU32,
    /// Set by the producer while a reserved span is being filled.
    pub write_in_progress: AtomicU32,
    /// Monotonic count of producer-lapped-consumer events.
    pub num_overruns: AtomicU32,
    /// Q15 fixed-point multiplier applied at mix time.
    pub volume_scaler: AtomicI32,
    pub mute: AtomicU32,
    /// Set when the server has requested data and is waiting on it.
    pub callback_pending: AtomicU32,
}

pub const RING_HEADER_SIZE: usize = size_of::<RingHeader>();
const_assert!(RING_HEADER_SIZE == 64);

/// Region bytes needed for a ring of `used_size` bytes per half.
pub fn region_len(used_size: u32) -> usize {
    RING_HEADER_SIZE + 2 * used_size as usize
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("region too small for ring geometry")]
    TooSmall,
    #[error("ring header disagrees with region size")]
    BadGeometry,
    #[error("frame stride is zero or does not divide the buffer")]
    BadStride,
}

/// One handle onto a shared audio ring. Handles are cheap to clone; the
/// mapping lives until the last one is dropped.
pub struct AudioRing {
    region: Arc<ShmRegion>,
}

impl AudioRing {
    /// Initialize a fresh region as a ring. `used_size` is the per-half
    /// byte capacity and must be a multiple of `frame_bytes`.
    pub fn create(region: ShmRegion, frame_bytes: u32, used_size: u32) -> Result<AudioRing, RingError> {
        if frame_bytes == 0 || used_size == 0 || used_size % frame_bytes != 0 {
            return Err(RingError::BadStride);
        }
        if region.len() < region_len(used_size) {
            return Err(RingError::TooSmall);
        }
        let ring = AudioRing { region: Arc::new(region) };
        {
            let h = ring.header();
            h.frame_bytes.store(frame_bytes, Ordering::Relaxed);
            h.used_size.store(used_size, Ordering::Relaxed);
            h.size.store(2 * used_size, Ordering::Relaxed);
            h.write_offset.store(0, Ordering::Relaxed);
            h.read_offset.store(0, Ordering::Relaxed);
            h.write_in_progress.store(0, Ordering::Relaxed);
            h.num_overruns.store(0, Ordering::Relaxed);
            h.volume_scaler.store(VOLUME_UNITY, Ordering::Relaxed);
            h.mute.store(0, Ordering::Relaxed);
            h.callback_pending.store(0, Ordering::Release);
        }
        Ok(ring)
    }

    /// Adopt a region whose header was initialized by a peer.
    pub fn attach(region: ShmRegion) -> Result<AudioRing, RingError> {
        if region.len() < RING_HEADER_SIZE {
            return Err(RingError::TooSmall);
        }
        let ring = AudioRing { region: Arc::new(region) };
        let h = ring.header();
        let frame_bytes = h.frame_bytes.load(Ordering::Relaxed);
        let used = h.used_size.load(Ordering::Relaxed);
        let size = h.size.load(Ordering::Relaxed);
        if frame_bytes == 0 || used == 0 || used % frame_bytes != 0 {
            return Err(RingError::BadStride);
        }
        if size != 2 * used || ring.region.len() < region_len(used) {
            return Err(RingError::BadGeometry);
        }
        Ok(ring)
    }

    /// A second handle onto the same mapping, for the other side of the
    /// producer/consumer pair.
    pub fn handle(&self) -> AudioRing {
        AudioRing { region: self.region.clone() }
    }

    pub fn region(&self) -> &ShmRegion {
        &self.region
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*(self.region.as_ptr() as *const RingHeader) }
    }

    fn samples(&self) -> *mut u8 {
        unsafe { self.region.as_ptr().add(RING_HEADER_SIZE) }
    }

    pub fn frame_bytes(&self) -> u32 {
        self.header().frame_bytes.load(Ordering::Relaxed)
    }

    fn size(&self) -> u32 {
        self.header().size.load(Ordering::Relaxed)
    }

    fn used_size(&self) -> u32 {
        self.header().used_size.load(Ordering::Relaxed)
    }

    /// Frames a well-behaved producer may write without lapping the reader.
    pub fn writable_frames(&self) -> u32 {
        (self.size() - self.level()) / self.frame_bytes()
    }

    pub fn readable_frames(&self) -> u32 {
        self.level() / self.frame_bytes()
    }

    pub fn num_overruns(&self) -> u32 {
        self.header().num_overruns.load(Ordering::Relaxed)
    }

    pub fn volume_scaler(&self) -> i32 {
        self.header().volume_scaler.load(Ordering::Relaxed)
    }

    pub fn set_volume_scaler(&self, q: i32) {
        self.header().volume_scaler.store(q, Ordering::Relaxed);
    }

    pub fn muted(&self) -> bool {
        self.header().mute.load(Ordering::Relaxed) != 0
    }

    pub fn set_mute(&self, mute: bool) {
        self.header().mute.store(mute.into(), Ordering::Relaxed);
    }

    pub fn callback_pending(&self) -> bool {
        self.header().callback_pending.load(Ordering::Relaxed) != 0
    }

    pub fn set_callback_pending(&self, pending: bool) {
        self.header().callback_pending.store(pending.into(), Ordering::Relaxed);
    }

    fn wrap(&self) -> u32 {
        2 * self.size()
    }

    /// Unread bytes, acquire-ordered against the producer's commits.
    fn level(&self) -> u32 {
        let h = self.header();
        let wo = h.write_offset.load(Ordering::Acquire);
        let ro = h.read_offset.load(Ordering::Acquire);
        wo.wrapping_sub(ro).wrapping_add(self.wrap()) % self.wrap()
    }

    /// Reserve up to `frames` contiguous frames for writing, capped by free
    /// space and the end of the sample area. Never blocks.
    pub fn reserve_write(&self, frames: u32) -> (&mut [u8], u32) {
        let fb = self.frame_bytes();
        let space = self.size() - self.level();
        self.write_at(frames.min(space / fb))
    }

    /// Like `reserve_write` but ignores the reader: the capture path keeps
    /// writing when the client falls behind and lets `commit_write` account
    /// the overrun.
    pub fn write_span(&self, frames: u32) -> (&mut [u8], u32) {
        self.write_at(frames)
    }

    fn write_at(&self, frames: u32) -> (&mut [u8], u32) {
        let h = self.header();
        let fb = self.frame_bytes();
        let size = self.size();
        let pos = h.write_offset.load(Ordering::Relaxed) % size;
        let contig = (size - pos) / fb;
        let n = frames.min(contig);
        h.write_in_progress.store(1, Ordering::Relaxed);
        let buf = unsafe {
            std::slice::from_raw_parts_mut(self.samples().add(pos as usize), (n * fb) as usize)
        };
        (buf, n)
    }

    /// Publish `frames` written frames. If the distance to the reader now
    /// exceeds the ring, the overrun counter is bumped and the reader is
    /// snapped to one half behind the writer.
    pub fn commit_write(&self, frames: u32) {
        let h = self.header();
        let fb = self.frame_bytes();
        let wrap = self.wrap();
        let wo = h.write_offset.load(Ordering::Relaxed);
        let ro = h.read_offset.load(Ordering::Relaxed);
        let new_wo = (wo + frames * fb) % wrap;
        let level = new_wo.wrapping_sub(ro).wrapping_add(wrap) % wrap;
        if level > self.size() {
            h.num_overruns.fetch_add(1, Ordering::Relaxed);
            let snapped = new_wo.wrapping_sub(self.used_size()).wrapping_add(wrap) % wrap;
            h.read_offset.store(snapped, Ordering::Release);
        }
        h.write_offset.store(new_wo, Ordering::Release);
        h.write_in_progress.store(0, Ordering::Release);
    }

    /// Peek up to `frames` contiguous readable frames. Never blocks.
    pub fn reserve_read(&self, frames: u32) -> (&[u8], u32) {
        let h = self.header();
        let fb = self.frame_bytes();
        let size = self.size();
        let level = self.level();
        let pos = h.read_offset.load(Ordering::Relaxed) % size;
        let contig = (size - pos) / fb;
        let n = frames.min(level / fb).min(contig);
        let buf = unsafe {
            std::slice::from_raw_parts(self.samples().add(pos as usize), (n * fb) as usize)
        };
        (buf, n)
    }

    /// Consume `frames` frames previously returned by `reserve_read`.
    pub fn commit_read(&self, frames: u32) {
        let h = self.header();
        let fb = self.frame_bytes();
        let wrap = self.wrap();
        let ro = h.read_offset.load(Ordering::Relaxed);
        h.read_offset.store((ro + frames * fb) % wrap, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: u32 = 4;

    fn ring(used_frames: u32) -> AudioRing {
        let used = used_frames * FRAME;
        let region = ShmRegion::anonymous("chorus-ring-test", region_len(used)).unwrap();
        AudioRing::create(region, FRAME, used).unwrap()
    }

    fn write_frames(ring: &AudioRing, frames: u32, fill: u8) {
        let mut left = frames;
        while left > 0 {
            let (buf, n) = ring.write_span(left);
            assert!(n > 0);
            buf.fill(fill);
            ring.commit_write(n);
            left -= n;
        }
    }

    #[test]
    fn roundtrip_preserves_bytes() {
        let producer = ring(8);
        let consumer = producer.handle();

        let (buf, n) = producer.reserve_write(4);
        assert_eq!(n, 4);
        for (i, b) in buf.iter_mut().enumerate() {
            *b = i as u8;
        }
        producer.commit_write(4);

        assert_eq!(consumer.readable_frames(), 4);
        let (buf, n) = consumer.reserve_read(4);
        assert_eq!(n, 4);
        let expect: Vec<u8> = (0..16).map(|i| i as u8).collect();
        assert_eq!(buf, &expect[..]);
        consumer.commit_read(4);
        assert_eq!(consumer.readable_frames(), 0);
    }

    #[test]
    fn reserve_write_respects_reader() {
        let r = ring(8);
        // capacity is both halves: 16 frames
        let (_, n) = r.reserve_write(64);
        assert_eq!(n, 16);
        r.commit_write(16);
        let (_, n) = r.reserve_write(1);
        assert_eq!(n, 0);
        r.commit_read(4);
        assert_eq!(r.writable_frames(), 4);
    }

    #[test]
    fn spans_never_cross_the_end() {
        let r = ring(8);
        write_frames(&r, 12, 1);
        r.commit_read(12);
        // next write starts 12 frames in; only 4 contiguous frames remain
        let (_, n) = r.write_span(8);
        assert_eq!(n, 4);
    }

    #[test]
    fn third_unread_half_overruns_and_lands_in_front() {
        let r = ring(8);
        write_frames(&r, 8, 1);
        assert_eq!(r.num_overruns(), 0);
        write_frames(&r, 8, 2);
        assert_eq!(r.num_overruns(), 0);
        // both halves unread; the next block laps the reader
        write_frames(&r, 8, 3);
        assert_eq!(r.num_overruns(), 1);
        // reader snapped one half behind the writer, newest data readable
        assert_eq!(r.readable_frames(), 8);
        let (buf, n) = r.reserve_read(8);
        assert_eq!(n, 8);
        assert!(buf.iter().all(|b| *b == 3));
    }

    #[test]
    fn overrun_count_tracks_total_written() {
        // writing k half-buffers without reading overruns ceil((k - 2) / 2)
        // times: the snap leaves one half of room after every overrun
        for (halves, expect) in [(1, 0), (2, 0), (3, 1), (4, 1), (5, 2), (6, 2)] {
            let r = ring(8);
            for _ in 0..halves {
                write_frames(&r, 8, 0xee);
            }
            assert_eq!(r.num_overruns(), expect, "after {halves} halves");
        }
    }

    #[test]
    fn attach_validates_geometry() {
        let used = 8 * FRAME;
        let region = ShmRegion::anonymous("chorus-ring-test", region_len(used)).unwrap();
        let created = AudioRing::create(region, FRAME, used).unwrap();
        created.header().size.store(used, Ordering::Relaxed);

        let bad = ShmRegion::from_fd(
            created.region().fd().try_clone_to_owned().unwrap(),
            region_len(used),
        )
        .unwrap();
        assert_eq!(AudioRing::attach(bad).err(), Some(RingError::BadGeometry));
    }

    #[test]
    fn volume_and_mute_are_shared() {
        let a = ring(8);
        let b = a.handle();
        a.set_volume_scaler(VOLUME_UNITY / 2);
        a.set_mute(true);
        assert_eq!(b.volume_scaler(), VOLUME_UNITY / 2);
        assert!(b.muted());
    }
}
