//! Control messages exchanged on the per-client control socket. Every
//! message starts with `{length, kind}` and the length covers the whole
//! message, so a byte stream can be framed before it is understood.

use core::mem::size_of;

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert;

use crate::types::{AudioFormat, ClientId, Direction, StreamFlags, StreamId, StreamType};
use crate::{MAX_CTL_MSG_SIZE, PROTO_VERSION};

#[derive(Debug, Clone, Copy, Zeroable, Pod, PartialEq, Eq)]
#[repr(transparent)]
pub struct MsgKind(u32);

impl MsgKind {
    // client -> server
    pub const STREAM_CONNECT: MsgKind = MsgKind(0);
    pub const STREAM_DISCONNECT: MsgKind = MsgKind(1);
    pub const SWITCH_TYPE_DEVICE: MsgKind = MsgKind(2);
    // server -> client
    pub const CLIENT_CONNECTED: MsgKind = MsgKind(3);
    pub const STREAM_CONNECTED: MsgKind = MsgKind(4);
    pub const STREAM_REATTACH: MsgKind = MsgKind(5);
}

#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct MsgHeader {
    pub length: u32,
    pub kind: MsgKind,
}

impl MsgHeader {
    fn for_msg<T: Pod>(kind: MsgKind) -> MsgHeader {
        MsgHeader { length: size_of::<T>() as u32, kind }
    }
}

pub const HEADER_SIZE: usize = size_of::<MsgHeader>();

/// Sent by a client to connect a stream to the server.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct ConnectMsg {
    pub header: MsgHeader,
    pub proto_version: u32,
    pub direction: Direction,
    pub stream_id: StreamId,
    pub stream_type: StreamType,
    pub buffer_frames: u32,
    pub cb_threshold: u32,
    pub min_cb_level: u32,
    pub flags: StreamFlags,
    pub format: AudioFormat,
}

impl ConnectMsg {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        direction: Direction,
        stream_type: StreamType,
        buffer_frames: u32,
        cb_threshold: u32,
        min_cb_level: u32,
        flags: StreamFlags,
        format: AudioFormat,
    ) -> ConnectMsg {
        ConnectMsg {
            header: MsgHeader::for_msg::<Self>(MsgKind::STREAM_CONNECT),
            proto_version: PROTO_VERSION,
            direction,
            stream_id: StreamId(0),
            stream_type,
            buffer_frames,
            cb_threshold,
            min_cb_level,
            flags,
            format,
        }
    }
}

/// Sent by a client to remove a stream from the server.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct DisconnectMsg {
    pub header: MsgHeader,
    pub stream_id: StreamId,
}

impl DisconnectMsg {
    pub fn new(stream_id: StreamId) -> DisconnectMsg {
        DisconnectMsg {
            header: MsgHeader::for_msg::<Self>(MsgKind::STREAM_DISCONNECT),
            stream_id,
        }
    }
}

/// Move all streams of a type to the device at `device_idx`.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct SwitchTypeDeviceMsg {
    pub header: MsgHeader,
    pub stream_type: StreamType,
    pub device_idx: u32,
}

impl SwitchTypeDeviceMsg {
    pub fn new(stream_type: StreamType, device_idx: u32) -> SwitchTypeDeviceMsg {
        SwitchTypeDeviceMsg {
            header: MsgHeader::for_msg::<Self>(MsgKind::SWITCH_TYPE_DEVICE),
            stream_type,
            device_idx,
        }
    }
}

/// First message on a fresh control socket; tells the client its id.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct ClientConnectedMsg {
    pub header: MsgHeader,
    pub client_id: ClientId,
}

impl ClientConnectedMsg {
    pub fn new(client_id: ClientId) -> ClientConnectedMsg {
        ClientConnectedMsg {
            header: MsgHeader::for_msg::<Self>(MsgKind::CLIENT_CONNECTED),
            client_id,
        }
    }
}

/// Reply to `STREAM_CONNECT`. On success the shared ring and the data-plane
/// socket ride along as ancillary descriptors, in that order.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct StreamConnectedMsg {
    pub header: MsgHeader,
    pub err: i32,
    pub stream_id: StreamId,
    pub format: AudioFormat,
    pub ring_key: u32,
    pub ring_max_size: u32,
}

impl StreamConnectedMsg {
    pub fn new(
        stream_id: StreamId,
        format: AudioFormat,
        ring_key: u32,
        ring_max_size: u32,
    ) -> StreamConnectedMsg {
        StreamConnectedMsg {
            header: MsgHeader::for_msg::<Self>(MsgKind::STREAM_CONNECTED),
            err: 0,
            stream_id,
            format,
            ring_key,
            ring_max_size,
        }
    }

    pub fn error(err: i32, stream_id: StreamId) -> StreamConnectedMsg {
        StreamConnectedMsg {
            header: MsgHeader::for_msg::<Self>(MsgKind::STREAM_CONNECTED),
            err,
            stream_id,
            format: AudioFormat::zeroed(),
            ring_key: 0,
            ring_max_size: 0,
        }
    }
}

/// The stream was dropped from its device; the client should reconnect it.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct StreamReattachMsg {
    pub header: MsgHeader,
    pub stream_id: StreamId,
}

impl StreamReattachMsg {
    pub fn new(stream_id: StreamId) -> StreamReattachMsg {
        StreamReattachMsg {
            header: MsgHeader::for_msg::<Self>(MsgKind::STREAM_REATTACH),
            stream_id,
        }
    }
}

// No message may outgrow the framing buffer.
const_assert!(size_of::<ConnectMsg>() <= MAX_CTL_MSG_SIZE);
const_assert!(size_of::<StreamConnectedMsg>() <= MAX_CTL_MSG_SIZE);

#[derive(Debug)]
pub enum CtlMsg {
    Connect(ConnectMsg),
    Disconnect(DisconnectMsg),
    SwitchTypeDevice(SwitchTypeDeviceMsg),
    ClientConnected(ClientConnectedMsg),
    StreamConnected(StreamConnectedMsg),
    StreamReattach(StreamReattachMsg),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    Truncated,
    LengthMismatch,
    UnknownKind(u32),
}

/// Length of the frame starting at `bytes`, if a full header is present.
/// Returns `None` for lengths the codec would never produce.
pub fn frame_length(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    let header: MsgHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]);
    let length = header.length as usize;
    if length < HEADER_SIZE || length > MAX_CTL_MSG_SIZE {
        return None;
    }
    Some(length)
}

fn read_as<T: Pod>(bytes: &[u8]) -> Result<T, ParseError> {
    if bytes.len() != size_of::<T>() {
        return Err(ParseError::LengthMismatch);
    }
    Ok(bytemuck::pod_read_unaligned(bytes))
}

/// Parse one complete frame. The caller is expected to have already cut the
/// byte stream at `frame_length`.
pub fn parse(bytes: &[u8]) -> Result<CtlMsg, ParseError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ParseError::Truncated);
    }
    let header: MsgHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]);
    if header.length as usize != bytes.len() {
        return Err(ParseError::LengthMismatch);
    }
    match header.kind {
        MsgKind::STREAM_CONNECT => read_as(bytes).map(CtlMsg::Connect),
        MsgKind::STREAM_DISCONNECT => read_as(bytes).map(CtlMsg::Disconnect),
        MsgKind::SWITCH_TYPE_DEVICE => read_as(bytes).map(CtlMsg::SwitchTypeDevice),
        MsgKind::CLIENT_CONNECTED => read_as(bytes).map(CtlMsg::ClientConnected),
        MsgKind::STREAM_CONNECTED => read_as(bytes).map(CtlMsg::StreamConnected),
        MsgKind::STREAM_REATTACH => read_as(bytes).map(CtlMsg::StreamReattach),
        MsgKind(other) => Err(ParseError::UnknownKind(other)),
    }
}

pub fn as_bytes<T: Pod>(msg: &T) -> &[u8] {
    bytemuck::bytes_of(msg)
}
