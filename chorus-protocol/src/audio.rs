//! Fixed-size messages on the per-stream data-plane socketpair.

use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq)]
#[repr(transparent)]
pub struct AudioMsgId(u32);

impl AudioMsgId {
    /// Server expects at least `frames` frames at the next wakeup.
    pub const REQUEST_DATA: AudioMsgId = AudioMsgId(0);
    /// `frames` frames are committed in the shared ring.
    pub const DATA_READY: AudioMsgId = AudioMsgId(1);
    /// Terminal; `error` carries the code.
    pub const ERROR: AudioMsgId = AudioMsgId(2);
}

#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq)]
#[repr(C)]
pub struct AudioMsg {
    pub id: AudioMsgId,
    pub error: i32,
    pub frames: u32,
}

pub const AUDIO_MSG_SIZE: usize = size_of::<AudioMsg>();

impl AudioMsg {
    pub fn request_data(frames: u32) -> AudioMsg {
        AudioMsg { id: AudioMsgId::REQUEST_DATA, error: 0, frames }
    }

    pub fn data_ready(frames: u32) -> AudioMsg {
        AudioMsg { id: AudioMsgId::DATA_READY, error: 0, frames }
    }

    pub fn error(code: i32) -> AudioMsg {
        AudioMsg { id: AudioMsgId::ERROR, error: code, frames: 0 }
    }

    pub fn parse(bytes: &[u8]) -> Option<AudioMsg> {
        if bytes.len() != AUDIO_MSG_SIZE {
            return None;
        }
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}
