//! Clock-driven software device. Consumes or produces frames at the rate a
//! real card would, so the server can run (and be tested) without hardware.

use chorus_protocol::types::{AudioFormat, Direction};
use chorus_util::time;

use crate::pcm::{Backend, DeviceDesc, MmapArea, NodeDesc, NodeType, Pcm, PcmError, SupportedFormats};

const DEFAULT_BUFFER_FRAMES: usize = 16384;

const EINVAL: i32 = 22;

fn elapsed_micros(since: u64) -> u64 {
    time::now_micros().saturating_sub(since)
}

struct OpenState {
    format: AudioFormat,
    buffer_frames: usize,
    // u64 storage keeps the staging buffer aligned for any sample width
    staging: Vec<u64>,
    started_at: Option<u64>,
    /// Frames moved through `mmap_commit` since start.
    transferred: u64,
    mapped: usize,
}

pub struct NullPcm {
    direction: Direction,
    supported: SupportedFormats,
    open: Option<OpenState>,
}

impl NullPcm {
    pub fn new(direction: Direction) -> NullPcm {
        NullPcm {
            direction,
            supported: SupportedFormats::default(),
            open: None,
        }
    }

    fn state(&mut self) -> Result<&mut OpenState, PcmError> {
        self.open.as_mut().ok_or(PcmError::NotOpen)
    }

    /// Frames the "hardware" clock has moved since start.
    fn hw_frames(state: &OpenState) -> u64 {
        match state.started_at {
            Some(at) => elapsed_micros(at) * u64::from(state.format.rate_hz) / 1_000_000,
            None => 0,
        }
    }
}

impl Pcm for NullPcm {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn supported(&self) -> &SupportedFormats {
        &self.supported
    }

    fn open(&mut self, format: &AudioFormat, buffer_frames: usize) -> Result<(), PcmError> {
        if self.open.is_some() {
            return Err(PcmError::AlreadyOpen);
        }
        if !self.supported.supports(format) {
            return Err(PcmError::UnsupportedFormat);
        }
        let buffer_frames = if buffer_frames == 0 { DEFAULT_BUFFER_FRAMES } else { buffer_frames };
        let bytes = buffer_frames * format.frame_bytes() as usize;
        self.open = Some(OpenState {
            format: *format,
            buffer_frames,
            staging: vec![0u64; bytes.div_ceil(8)],
            started_at: None,
            transferred: 0,
            mapped: 0,
        });
        Ok(())
    }

    fn close(&mut self) {
        self.open = None;
    }

    fn is_open(&self) -> bool {
        self.open.is_some()
    }

    fn start(&mut self) -> Result<(), PcmError> {
        let state = self.state()?;
        if state.started_at.is_none() {
            state.started_at = Some(time::now_micros());
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PcmError> {
        let state = self.state()?;
        state.started_at = None;
        state.transferred = 0;
        Ok(())
    }

    fn avail(&mut self) -> Result<usize, PcmError> {
        let input = self.direction.is_input();
        let state = self.state()?;
        let hw = Self::hw_frames(state);
        if input {
            // captured frames not yet read, capped at the ring
            let pending = hw.saturating_sub(state.transferred);
            Ok((pending as usize).min(state.buffer_frames))
        } else {
            // free space: what the clock consumed plus what was never queued
            let queued = state.transferred.saturating_sub(hw);
            Ok(state.buffer_frames - (queued as usize).min(state.buffer_frames))
        }
    }

    fn mmap_begin(&mut self, frames: usize) -> Result<MmapArea<'_>, PcmError> {
        let state = self.state()?;
        let fb = state.format.frame_bytes() as usize;
        let pos = (state.transferred as usize % state.buffer_frames) * fb;
        let bytes: &mut [u8] = unsafe {
            std::slice::from_raw_parts_mut(
                state.staging.as_mut_ptr() as *mut u8,
                state.buffer_frames * fb,
            )
        };
        let contig = (state.buffer_frames * fb - pos) / fb;
        let granted = frames.min(contig);
        state.mapped = granted;
        Ok(MmapArea {
            buf: &mut bytes[pos..pos + granted * fb],
            frames: granted,
        })
    }

    fn mmap_commit(&mut self, frames: usize) -> Result<(), PcmError> {
        let state = self.state()?;
        if frames > state.mapped {
            return Err(PcmError::Hardware(-EINVAL));
        }
        state.transferred += frames as u64;
        state.mapped = 0;
        Ok(())
    }

    fn delay(&mut self) -> Result<usize, PcmError> {
        let state = self.state()?;
        let hw = Self::hw_frames(state);
        Ok(state.transferred.saturating_sub(hw) as usize)
    }

    fn buffer_frames(&self) -> usize {
        self.open.as_ref().map(|s| s.buffer_frames).unwrap_or(0)
    }
}

/// Backend exposing one software sink and one software source.
pub struct NullBackend;

impl Backend for NullBackend {
    fn probe(&mut self) -> Vec<DeviceDesc> {
        vec![
            DeviceDesc {
                name: "null-output".to_string(),
                direction: Direction::OUTPUT,
                supported: SupportedFormats::default(),
                nodes: vec![NodeDesc {
                    node_type: NodeType::Speaker,
                    name: "Speaker".to_string(),
                    plugged: true,
                }],
            },
            DeviceDesc {
                name: "null-input".to_string(),
                direction: Direction::INPUT,
                supported: SupportedFormats::default(),
                nodes: vec![NodeDesc {
                    node_type: NodeType::InternalMic,
                    name: "Internal Mic".to_string(),
                    plugged: true,
                }],
            },
        ]
    }

    fn pcm(&mut self, _name: &str, direction: Direction) -> Result<Box<dyn Pcm>, PcmError> {
        Ok(Box::new(NullPcm::new(direction)))
    }
}
