//! Contract between the server and the hardware abstraction layer. The
//! layer that actually programs a sound card lives behind `Pcm`; the server
//! only ever sees frames, descriptors and errors.

use chorus_protocol::types::{AudioFormat, Direction, SampleEncoding};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PcmError {
    #[error("device not open")]
    NotOpen,
    #[error("device already open")]
    AlreadyOpen,
    #[error("requested format not supported")]
    UnsupportedFormat,
    #[error("hardware reported an underrun or overrun")]
    Xrun,
    #[error("hardware error {0}")]
    Hardware(i32),
}

/// What a device can be programmed to. Rates and channel counts are exact;
/// the server does no conversion.
#[derive(Debug, Clone)]
pub struct SupportedFormats {
    pub rates: Vec<u32>,
    pub channel_counts: Vec<u32>,
    pub encodings: Vec<SampleEncoding>,
}

impl SupportedFormats {
    pub fn supports(&self, format: &AudioFormat) -> bool {
        self.rates.contains(&format.rate_hz)
            && self.channel_counts.contains(&format.channels)
            && self.encodings.contains(&format.encoding)
    }
}

impl Default for SupportedFormats {
    fn default() -> Self {
        SupportedFormats {
            rates: vec![44100, 48000],
            channel_counts: vec![1, 2],
            encodings: vec![SampleEncoding::S16_LE],
        }
    }
}

/// A directly writable (or readable) window into the hardware ring.
/// `frames` is how many frames the hardware granted; it may be less than
/// asked for near the ring's wrap point.
pub struct MmapArea<'a> {
    pub buf: &'a mut [u8],
    pub frames: usize,
}

/// One PCM handle, owned exclusively by a device worker.
///
/// `avail` reports free space for playback devices and captured frames for
/// capture devices. `mmap_begin`/`mmap_commit` bracket one transfer; the
/// granted area is valid until the commit.
pub trait Pcm: Send {
    fn direction(&self) -> Direction;
    fn supported(&self) -> &SupportedFormats;

    fn open(&mut self, format: &AudioFormat, buffer_frames: usize) -> Result<(), PcmError>;
    fn close(&mut self);
    fn is_open(&self) -> bool;

    fn start(&mut self) -> Result<(), PcmError>;
    fn stop(&mut self) -> Result<(), PcmError>;

    fn avail(&mut self) -> Result<usize, PcmError>;
    fn mmap_begin(&mut self, frames: usize) -> Result<MmapArea<'_>, PcmError>;
    fn mmap_commit(&mut self, frames: usize) -> Result<(), PcmError>;

    /// Frames between the application pointer and what the hardware is
    /// currently playing or capturing.
    fn delay(&mut self) -> Result<usize, PcmError>;

    /// Hardware ring size negotiated at open.
    fn buffer_frames(&self) -> usize;
}

/// Kinds of endpoints a device exposes. Ordering is the routing priority
/// used when a jack is plugged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Internal,
    InternalMic,
    Speaker,
    Mic,
    Headphone,
    Hdmi,
}

impl NodeType {
    pub fn priority(&self) -> u32 {
        match self {
            NodeType::Hdmi => 4,
            NodeType::Headphone => 3,
            NodeType::Mic => 3,
            NodeType::Speaker => 2,
            NodeType::InternalMic => 2,
            NodeType::Internal => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Internal => "INTERNAL",
            NodeType::InternalMic => "INTERNAL_MIC",
            NodeType::Speaker => "INTERNAL_SPEAKER",
            NodeType::Mic => "MIC",
            NodeType::Headphone => "HEADPHONE",
            NodeType::Hdmi => "HDMI",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeDesc {
    pub node_type: NodeType,
    pub name: String,
    pub plugged: bool,
}

#[derive(Debug, Clone)]
pub struct DeviceDesc {
    pub name: String,
    pub direction: Direction,
    pub supported: SupportedFormats,
    pub nodes: Vec<NodeDesc>,
}

/// Produces devices at discovery time and PCM handles on demand.
pub trait Backend: Send {
    fn probe(&mut self) -> Vec<DeviceDesc>;
    fn pcm(&mut self, name: &str, direction: Direction) -> Result<Box<dyn Pcm>, PcmError>;
}
