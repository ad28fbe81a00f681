pub mod null;
pub mod pcm;

use chorus_protocol::types::NodeId;

pub use pcm::{Backend, DeviceDesc, MmapArea, NodeDesc, NodeType, Pcm, PcmError, SupportedFormats};

/// Plug state change reported by a hardware jack monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JackEvent {
    pub node: NodeId,
    pub plugged: bool,
}
