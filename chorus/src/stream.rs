//! Per-client stream state shared between the front-end and the device
//! worker that currently services the stream.

use std::io::{self, Write};
use std::os::unix::net::UnixStream;

use chorus_core::ring::AudioRing;
use chorus_core::time::frames_to_duration;
use chorus_protocol::audio::AudioMsg;
use chorus_protocol::msg::ConnectMsg;
use chorus_protocol::types::{err, AudioFormat, Direction, StreamFlags, StreamId, StreamType};
use chorus_protocol::PROTO_VERSION;
use nix::sys::time::TimeSpec;

pub struct StreamRecord {
    pub id: StreamId,
    pub direction: Direction,
    pub stream_type: StreamType,
    pub format: AudioFormat,
    pub buffer_frames: u32,
    pub cb_threshold: u32,
    pub min_cb_level: u32,
    pub flags: StreamFlags,
    /// Current device index; 0 follows the routing default for the type.
    pub device_binding: u32,
    pub ring: AudioRing,
    /// Server end of the data-plane socketpair.
    pub audio_sock: UnixStream,
    pub num_underruns: u32,
    /// When the outstanding REQUEST_DATA was sent, if any.
    pending_since: Option<TimeSpec>,
}

impl StreamRecord {
    pub fn new(
        id: StreamId,
        connect: &ConnectMsg,
        ring: AudioRing,
        audio_sock: UnixStream,
    ) -> StreamRecord {
        StreamRecord {
            id,
            direction: connect.direction,
            stream_type: connect.stream_type,
            format: connect.format,
            buffer_frames: connect.buffer_frames,
            cb_threshold: connect.cb_threshold,
            min_cb_level: connect.min_cb_level,
            flags: connect.flags,
            device_binding: 0,
            ring,
            audio_sock,
            num_underruns: 0,
            pending_since: None,
        }
    }

    /// Front-end admission check; failures become `STREAM_CONNECTED.err`.
    pub fn validate(connect: &ConnectMsg) -> Result<(), i32> {
        if connect.proto_version != PROTO_VERSION {
            return Err(err::PROTOCOL);
        }
        if !connect.direction.is_valid()
            || !connect.stream_type.is_valid()
            || !connect.format.is_valid()
        {
            return Err(err::PROTOCOL);
        }
        if connect.min_cb_level == 0
            || connect.cb_threshold < connect.min_cb_level
            || connect.buffer_frames < connect.cb_threshold
        {
            return Err(err::PROTOCOL);
        }
        Ok(())
    }

    /// Ask the client for `frames` frames and remember that we are waiting.
    pub fn request_data(&mut self, frames: u32, now: TimeSpec) -> io::Result<()> {
        let msg = AudioMsg::request_data(frames);
        self.audio_sock.write_all(msg.as_bytes())?;
        self.pending_since = Some(now);
        self.ring.set_callback_pending(true);
        Ok(())
    }

    pub fn data_arrived(&mut self) {
        self.pending_since = None;
        self.ring.set_callback_pending(false);
    }

    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }

    /// True once a request has gone unanswered for two callback periods.
    pub fn pending_expired(&self, now: TimeSpec, rate_hz: u32) -> bool {
        match self.pending_since {
            Some(since) => {
                let deadline = frames_to_duration(u64::from(self.cb_threshold) * 2, rate_hz);
                now - since > TimeSpec::from_duration(deadline)
            }
            None => false,
        }
    }

    /// Restart the underrun clock so one stall is counted once per deadline.
    pub fn rearm_pending(&mut self, now: TimeSpec) {
        if self.pending_since.is_some() {
            self.pending_since = Some(now);
        }
    }

    pub fn send_error(&mut self, code: i32) {
        let msg = AudioMsg::error(code);
        let _ = self.audio_sock.write_all(msg.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_protocol::types::SampleEncoding;

    fn connect() -> ConnectMsg {
        ConnectMsg::new(
            Direction::OUTPUT,
            StreamType::MEDIA,
            480,
            96,
            240,
            StreamFlags::empty(),
            AudioFormat::new(44100, 2, SampleEncoding::S16_LE),
        )
    }

    #[test]
    fn accepts_well_formed_connect() {
        assert_eq!(StreamRecord::validate(&connect()), Ok(()));
    }

    #[test]
    fn rejects_version_mismatch() {
        let mut msg = connect();
        msg.proto_version = PROTO_VERSION + 1;
        assert_eq!(StreamRecord::validate(&msg), Err(err::PROTOCOL));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut msg = connect();
        msg.cb_threshold = msg.buffer_frames + 1;
        assert_eq!(StreamRecord::validate(&msg), Err(err::PROTOCOL));

        let mut msg = connect();
        msg.min_cb_level = 0;
        assert_eq!(StreamRecord::validate(&msg), Err(err::PROTOCOL));
    }

    #[test]
    fn rejects_bad_direction() {
        let mut msg = connect();
        msg.direction = bytemuck::cast(7u32);
        assert_eq!(StreamRecord::validate(&msg), Err(err::PROTOCOL));
    }
}
