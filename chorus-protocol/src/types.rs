use bytemuck::{Pod, Zeroable};
use derive_more::Display;

/// Server-assigned identity of a connected client process.
#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq, Hash, Display)]
#[repr(transparent)]
pub struct ClientId(pub u32);

/// Stream ids pack the owning client in the high half so a stream can be
/// traced back to its control socket without a lookup.
#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq, Hash, Display)]
#[repr(transparent)]
pub struct StreamId(pub u32);

impl StreamId {
    pub fn new(client: ClientId, seq: u16) -> StreamId {
        StreamId((client.0 << 16) | u32::from(seq))
    }

    pub fn client(&self) -> ClientId {
        ClientId(self.0 >> 16)
    }

    pub fn seq(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

/// A node is one endpoint of a device (speaker, headphone, HDMI, mic).
#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq, Hash, Display)]
#[repr(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn new(device_idx: u32, node_idx: u32) -> NodeId {
        NodeId((u64::from(device_idx) << 32) | u64::from(node_idx))
    }

    pub fn device(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn node(&self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }
}

#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Direction(u32);

impl Direction {
    pub const OUTPUT: Direction = Direction(0);
    pub const INPUT: Direction = Direction(1);

    pub fn is_valid(&self) -> bool {
        *self == Self::OUTPUT || *self == Self::INPUT
    }

    pub fn is_input(&self) -> bool {
        *self == Self::INPUT
    }

    pub fn is_output(&self) -> bool {
        *self == Self::OUTPUT
    }
}

/// What a stream carries. Routing defaults are kept per type so a call can
/// target the headset while media keeps playing on speakers.
#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct StreamType(u32);

impl StreamType {
    pub const MEDIA: StreamType = StreamType(0);
    pub const CALL: StreamType = StreamType(1);
    pub const VOICE_COMMAND: StreamType = StreamType(2);
    pub const SYSTEM_SOUNDS: StreamType = StreamType(3);

    pub const COUNT: usize = 4;

    pub fn is_valid(&self) -> bool {
        (self.0 as usize) < Self::COUNT
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq)]
#[repr(transparent)]
pub struct SampleEncoding(u32);

impl SampleEncoding {
    pub const S16_LE: SampleEncoding = SampleEncoding(0);
    /// 24 significant bits in a 4-byte container, low-aligned.
    pub const S24_LE: SampleEncoding = SampleEncoding(1);
    pub const S32_LE: SampleEncoding = SampleEncoding(2);
    pub const F32_LE: SampleEncoding = SampleEncoding(3);

    pub fn is_valid(&self) -> bool {
        self.0 <= Self::F32_LE.0
    }

    pub fn sample_bytes(&self) -> u32 {
        match *self {
            Self::S16_LE => 2,
            _ => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq)]
#[repr(C)]
pub struct AudioFormat {
    pub rate_hz: u32,
    pub channels: u32,
    pub encoding: SampleEncoding,
}

impl AudioFormat {
    pub fn new(rate_hz: u32, channels: u32, encoding: SampleEncoding) -> AudioFormat {
        AudioFormat { rate_hz, channels, encoding }
    }

    /// Stride of one multi-channel frame in bytes.
    pub fn frame_bytes(&self) -> u32 {
        self.channels * self.encoding.sample_bytes()
    }

    pub fn is_valid(&self) -> bool {
        self.rate_hz > 0 && self.channels > 0 && self.encoding.is_valid()
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct StreamFlags: u32 {
        /// Client tolerates being asked for more than one callback of audio
        /// at a time.
        const BULK_AUDIO_OK = 0x01;
    }
}

/// Error codes carried in `STREAM_CONNECTED.err`. Zero is success.
pub mod err {
    pub const OK: i32 = 0;
    pub const PROTOCOL: i32 = -1;
    pub const FORMAT_UNSUPPORTED: i32 = -2;
    pub const NO_RESOURCES: i32 = -3;
    pub const HARDWARE: i32 = -4;
    pub const NO_DEVICE: i32 = -5;
}
