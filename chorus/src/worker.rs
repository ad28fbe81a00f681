//! Per-device real-time servicing worker.
//!
//! One worker owns each open device handle exclusively. It sleeps on a
//! single poll set (absolute-deadline timerfd, command mailbox, per-stream
//! data sockets), mixes every attached playback stream into the hardware
//! ring or fans captured frames out to stream rings, and recovers from
//! xruns locally. Commands are processed before I/O on every wake so a
//! detach that beats the deadline is honored.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use chorus_core::mix;
use chorus_core::ring::VOLUME_SHIFT;
use chorus_core::time::frames_to_duration;
use chorus_device::{MmapArea, Pcm, PcmError};
use chorus_protocol::audio::{AudioMsg, AudioMsgId, AUDIO_MSG_SIZE};
use chorus_protocol::types::{err, AudioFormat, StreamId};
use chorus_util::{mailbox, thread, time};

use crate::state::Snapshot;
use crate::stream::StreamRecord;

const XRUN_WINDOW: Duration = Duration::from_millis(500);
const XRUN_LIMIT: usize = 3;

// Round-robin, just above normal interactive priority. High enough to win
// against bulk work, low enough not to starve the kernel's own threads.
const RT_PRIORITY: i32 = 10;

pub enum Command {
    Attach(Box<StreamRecord>),
    Detach(StreamId),
    Reattach { stream: StreamId, device: u32 },
    Jack { plugged: bool },
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    Requested,
    Reattach { device: u32 },
    DeviceFailed,
    Unplugged,
}

pub enum Event {
    Detached { stream: Box<StreamRecord>, reason: DetachReason },
    Idle { device: u32 },
    Failed { device: u32 },
    Stopped { device: u32 },
}

pub struct Handle {
    pub device: u32,
    pub cmds: mailbox::MailboxSender<Command>,
    pub events: mailbox::Mailbox<Event>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl Handle {
    pub fn send(&self, cmd: Command) -> bool {
        self.cmds.send(cmd).is_ok()
    }

    pub fn join(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Handle {
    #[cfg(test)]
    pub(crate) fn for_test(
        device: u32,
        cmds: mailbox::MailboxSender<Command>,
        events: mailbox::Mailbox<Event>,
    ) -> Handle {
        Handle { device, cmds, events, join: None }
    }
}

pub fn spawn(device: u32, pcm: Box<dyn Pcm>, snapshot: Arc<Snapshot>) -> nix::Result<Handle> {
    let (cmd_tx, cmd_rx) = mailbox::channel()?;
    let (event_tx, event_rx) = mailbox::channel()?;
    let join = thread::start(&format!("chorus/dev{device}"), move || {
        Worker::new(device, pcm, snapshot, cmd_rx, event_tx).run();
    });
    Ok(Handle {
        device,
        cmds: cmd_tx,
        events: event_rx,
        join: Some(join),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Draining,
}

struct Worker {
    device: u32,
    pcm: Box<dyn Pcm>,
    snapshot: Arc<Snapshot>,
    cmds: mailbox::Mailbox<Command>,
    events: mailbox::MailboxSender<Event>,
    /// Attach order; mix order is observable by clients.
    streams: Vec<Box<StreamRecord>>,
    state: State,
    started: bool,
    format: AudioFormat,
    /// Tightest parameters over the attached streams.
    used_size: u32,
    cb_threshold: u32,
    min_cb_level: u32,
    xruns: VecDeque<TimeSpec>,
    dead: bool,
}

impl Worker {
    fn new(
        device: u32,
        pcm: Box<dyn Pcm>,
        snapshot: Arc<Snapshot>,
        cmds: mailbox::Mailbox<Command>,
        events: mailbox::MailboxSender<Event>,
    ) -> Worker {
        Worker {
            device,
            pcm,
            snapshot,
            cmds,
            events,
            streams: Vec::new(),
            state: State::Idle,
            started: false,
            format: AudioFormat::new(0, 0, chorus_protocol::types::SampleEncoding::S16_LE),
            used_size: 0,
            cb_threshold: 0,
            min_cb_level: 0,
            xruns: VecDeque::new(),
            dead: false,
        }
    }

    fn run(mut self) {
        // a worker that cannot go realtime still services its device, just
        // with worse xrun odds
        if let Err(e) = thread::promote_to_realtime(RT_PRIORITY) {
            if e.kind() == io::ErrorKind::PermissionDenied {
                log::warn!(
                    "device {}: no realtime priority, grant the server CAP_SYS_NICE: {e}",
                    self.device
                );
            } else {
                log::warn!("device {}: no realtime priority: {e}", self.device);
            }
        }

        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .expect("creating worker timerfd");

        while !self.dead {
            {
                let mut fds = Vec::with_capacity(2 + self.streams.len());
                fds.push(PollFd::new(timer.as_fd(), PollFlags::POLLIN));
                fds.push(PollFd::new(self.cmds.fd(), PollFlags::POLLIN));
                for stream in &self.streams {
                    fds.push(PollFd::new(stream.audio_sock.as_fd(), PollFlags::POLLIN));
                }
                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) => {}
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        log::error!("device {}: poll failed: {e}", self.device);
                        break;
                    }
                }
            }

            let cmds: Vec<Command> = self.cmds.drain().collect();
            for cmd in cmds {
                if !self.handle_command(cmd) {
                    return;
                }
            }
            if self.dead {
                return;
            }

            self.pump_data_messages();

            // arming the timer resets any pending expiration, so the fd
            // never needs to be read
            match self.service() {
                Some(sleep) => {
                    let deadline = time::deadline_after(sleep);
                    timer
                        .set(
                            Expiration::OneShot(deadline),
                            TimerSetTimeFlags::TFD_TIMER_ABSTIME,
                        )
                        .expect("arming worker timer");
                }
                None => {
                    let _ = timer.unset();
                }
            }
        }
    }

    /// Returns false when the worker should exit.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Attach(stream) => {
                self.attach(stream);
                true
            }
            Command::Detach(id) => {
                self.detach(id, DetachReason::Requested);
                true
            }
            Command::Reattach { stream, device } => {
                self.detach(stream, DetachReason::Reattach { device });
                true
            }
            Command::Jack { plugged } => {
                if !plugged {
                    log::info!("device {}: jack unplugged, releasing streams", self.device);
                    let ids: Vec<StreamId> = self.streams.iter().map(|s| s.id).collect();
                    for id in ids {
                        self.detach(id, DetachReason::Unplugged);
                    }
                }
                true
            }
            Command::Stop => {
                self.shutdown();
                false
            }
        }
    }

    fn attach(&mut self, stream: Box<StreamRecord>) {
        let first = self.streams.is_empty();
        log::debug!("device {}: attach stream {}", self.device, stream.id);
        self.streams.push(stream);
        self.retune_params();

        if first {
            self.format = self.streams[0].format;
            if let Err(e) = self.pcm.open(&self.format, 0) {
                log::error!("device {}: open failed: {e}", self.device);
                self.fail_device();
                return;
            }
            self.started = false;
            if self.pcm.direction().is_input() {
                if let Err(e) = self.pcm.start() {
                    log::error!("device {}: start failed: {e}", self.device);
                    self.fail_device();
                    return;
                }
                self.started = true;
            }
            self.state = State::Running;
        }
    }

    fn detach(&mut self, id: StreamId, reason: DetachReason) {
        let Some(pos) = self.streams.iter().position(|s| s.id == id) else {
            log::warn!("device {}: detach for unknown stream {id}", self.device);
            return;
        };
        let stream = self.streams.remove(pos);
        log::debug!("device {}: detach stream {id}", self.device);
        let _ = self.events.send(Event::Detached { stream, reason });

        if self.streams.is_empty() {
            self.enter_drain();
        } else {
            self.retune_params();
        }
    }

    /// Device parameters are the tightest of every attached stream, so the
    /// lowest-latency client sets the pace.
    fn retune_params(&mut self) {
        self.used_size = self.streams.iter().map(|s| s.buffer_frames).min().unwrap_or(0);
        self.cb_threshold = self.streams.iter().map(|s| s.cb_threshold).min().unwrap_or(0);
        self.min_cb_level = self.streams.iter().map(|s| s.min_cb_level).min().unwrap_or(0);
    }

    fn enter_drain(&mut self) {
        let draining = self.pcm.direction().is_output()
            && self.started
            && self.queued().map(|q| q > 0).unwrap_or(false);
        if draining {
            log::debug!("device {}: draining", self.device);
            self.state = State::Draining;
        } else {
            self.close_device();
        }
    }

    fn close_device(&mut self) {
        if self.started {
            let _ = self.pcm.stop();
        }
        self.pcm.close();
        self.started = false;
        self.state = State::Idle;
        log::info!("device {}: closed", self.device);
        let _ = self.events.send(Event::Idle { device: self.device });
    }

    fn queued(&mut self) -> Result<u32, PcmError> {
        let avail = self.pcm.avail()?;
        Ok(self.pcm.buffer_frames().saturating_sub(avail) as u32)
    }

    fn service(&mut self) -> Option<Duration> {
        match self.state {
            State::Idle => None,
            State::Draining => self.drain_pass(),
            State::Running => {
                let pass = if self.pcm.direction().is_input() {
                    self.input_pass()
                } else {
                    self.output_pass()
                };
                match pass {
                    Ok(sleep) => Some(sleep),
                    Err(e) => self.recover(e),
                }
            }
        }
    }

    /// Wait out the hardware queue after the last output stream leaves,
    /// then release the device.
    fn drain_pass(&mut self) -> Option<Duration> {
        match self.queued() {
            Ok(0) | Err(_) => {
                self.close_device();
                None
            }
            Ok(queued) => Some(frames_to_duration(queued.into(), self.format.rate_hz)),
        }
    }

    fn output_pass(&mut self) -> Result<Duration, PcmError> {
        let rate = self.format.rate_hz;
        let queued = self.queued()?;

        // woken early with plenty buffered: sleep until the hardware drains
        // back to the callback threshold
        if queued > self.cb_threshold {
            return Ok(frames_to_duration((queued - self.cb_threshold).into(), rate));
        }

        let want = self.used_size.saturating_sub(queued);
        if want == 0 {
            return Ok(frames_to_duration(self.cb_threshold.into(), rate));
        }

        let now = time::now();
        let fb = self.format.frame_bytes() as usize;
        let channels = self.format.channels;
        let encoding = self.format.encoding;
        let sys_scaler = self.snapshot.volume_scaler();
        let sys_mute = self.snapshot.output_muted();
        let min_cb_level = self.min_cb_level as usize;

        let MmapArea { buf, frames } = self.pcm.mmap_begin(want as usize)?;
        let g = frames.min(want as usize);
        let dst = &mut buf[..g * fb];
        // the hardware always gets g full frames; anything a stream cannot
        // supply stays silence
        dst.fill(0);

        for stream in &mut self.streams {
            let avail = stream.ring.readable_frames() as usize;

            if avail + min_cb_level < g && !stream.is_pending() {
                if let Err(e) = stream.request_data(g as u32, now) {
                    log::debug!("stream {}: request_data failed: {e}", stream.id);
                }
            }

            let take = avail.min(g);
            let mut done = 0;
            while done < take {
                let (src, granted) = stream.ring.reserve_read((take - done) as u32);
                if granted == 0 {
                    break;
                }
                let n = granted as usize;
                let volume = combine_volume(stream.ring.volume_scaler(), sys_scaler);
                let mute = sys_mute || stream.ring.muted();
                mix::mix_add(
                    &mut dst[done * fb..(done + n) * fb],
                    src,
                    n,
                    channels,
                    encoding,
                    volume,
                    mute,
                );
                stream.ring.commit_read(granted);
                done += n;
            }

            if take == 0 && stream.pending_expired(now, rate) {
                stream.num_underruns += 1;
                stream.rearm_pending(now);
                log::debug!(
                    "stream {}: underrun ({} total)",
                    stream.id,
                    stream.num_underruns
                );
            }
        }

        self.pcm.mmap_commit(g)?;

        if !self.started {
            self.pcm.start()?;
            self.started = true;
        }

        let queued_after = queued + g as u32;
        Ok(frames_to_duration(
            queued_after.saturating_sub(self.cb_threshold).into(),
            rate,
        ))
    }

    fn input_pass(&mut self) -> Result<Duration, PcmError> {
        let rate = self.format.rate_hz;
        let cb = self.cb_threshold;
        let avail = self.pcm.avail()? as u32;

        if avail < cb {
            return Ok(frames_to_duration((cb - avail).into(), rate));
        }

        let fb = self.format.frame_bytes() as usize;
        // read one callback block per pass; leftover frames shorten the
        // next sleep instead
        let MmapArea { buf, frames } = self.pcm.mmap_begin(cb as usize)?;
        let g = frames.min(cb as usize);
        let src = &buf[..g * fb];

        for stream in &mut self.streams {
            let mut done = 0;
            while done < g {
                let (dst, granted) = stream.ring.write_span((g - done) as u32);
                if granted == 0 {
                    break;
                }
                let n = granted as usize;
                dst.copy_from_slice(&src[done * fb..(done + n) * fb]);
                stream.ring.commit_write(granted);
                done += n;
            }
            if stream.ring.readable_frames() >= cb {
                let ready = AudioMsg::data_ready(cb);
                if let Err(e) = stream.audio_sock.write_all(ready.as_bytes()) {
                    log::debug!("stream {}: data_ready failed: {e}", stream.id);
                }
            }
        }

        self.pcm.mmap_commit(g)?;

        let leftover = avail - g as u32;
        Ok(frames_to_duration(cb.saturating_sub(leftover).into(), rate))
    }

    /// Local xrun recovery: reopen with the last-known format and keep
    /// going. Repeated failures mark the device failed and release every
    /// stream for re-routing.
    fn recover(&mut self, error: PcmError) -> Option<Duration> {
        log::warn!("device {}: recovering after {error}", self.device);
        let now = time::now();
        self.xruns.push_back(now);
        while let Some(first) = self.xruns.front() {
            if now - *first > TimeSpec::from_duration(XRUN_WINDOW) {
                self.xruns.pop_front();
            } else {
                break;
            }
        }
        if self.xruns.len() >= XRUN_LIMIT {
            log::error!(
                "device {}: {} xruns within {:?}, marking failed",
                self.device,
                XRUN_LIMIT,
                XRUN_WINDOW
            );
            self.fail_device();
            return None;
        }

        if self.started {
            let _ = self.pcm.stop();
        }
        self.pcm.close();
        self.started = false;
        if let Err(e) = self.pcm.open(&self.format, 0) {
            log::error!("device {}: reopen failed: {e}", self.device);
            self.fail_device();
            return None;
        }
        if self.pcm.direction().is_input() {
            if self.pcm.start().is_err() {
                self.fail_device();
                return None;
            }
            self.started = true;
        }

        for stream in &mut self.streams {
            stream.num_underruns += 1;
        }

        Some(frames_to_duration(self.cb_threshold.into(), self.format.rate_hz))
    }

    fn fail_device(&mut self) {
        // Failed goes out first so routing stops considering this device
        // before the released streams come back for re-routing.
        let _ = self.events.send(Event::Failed { device: self.device });
        let streams = std::mem::take(&mut self.streams);
        for mut stream in streams {
            stream.send_error(err::HARDWARE);
            let _ = self.events.send(Event::Detached {
                stream,
                reason: DetachReason::DeviceFailed,
            });
        }
        if self.pcm.is_open() {
            self.pcm.close();
        }
        self.started = false;
        self.state = State::Idle;
        self.dead = true;
    }

    fn shutdown(&mut self) {
        if self.pcm.direction().is_output() && self.started {
            if let Ok(queued) = self.queued() {
                if queued > 0 {
                    std::thread::sleep(frames_to_duration(queued.into(), self.format.rate_hz));
                }
            }
        }
        let streams = std::mem::take(&mut self.streams);
        for stream in streams {
            let _ = self.events.send(Event::Detached {
                stream,
                reason: DetachReason::Requested,
            });
        }
        if self.pcm.is_open() {
            if self.started {
                let _ = self.pcm.stop();
            }
            self.pcm.close();
        }
        log::info!("device {}: worker stopped", self.device);
        let _ = self.events.send(Event::Stopped { device: self.device });
    }

    /// Drain the per-stream data sockets: DATA_READY clears the pending
    /// flag, a closed socket or ERROR is an implicit disconnect.
    fn pump_data_messages(&mut self) {
        let mut gone: Vec<StreamId> = Vec::new();
        for stream in &mut self.streams {
            let mut buf = [0u8; AUDIO_MSG_SIZE];
            loop {
                match stream.audio_sock.read(&mut buf) {
                    Ok(0) => {
                        gone.push(stream.id);
                        break;
                    }
                    Ok(n) => match AudioMsg::parse(&buf[..n]) {
                        Some(msg) if msg.id == AudioMsgId::DATA_READY => stream.data_arrived(),
                        Some(msg) if msg.id == AudioMsgId::ERROR => {
                            gone.push(stream.id);
                            break;
                        }
                        Some(_) => {}
                        None => {
                            log::debug!("stream {}: runt data-plane message", stream.id);
                        }
                    },
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        gone.push(stream.id);
                        break;
                    }
                }
            }
        }
        for id in gone {
            self.detach(id, DetachReason::Requested);
        }
    }
}

fn combine_volume(stream_q: i32, system_q: i32) -> i32 {
    ((i64::from(stream_q) * i64::from(system_q)) >> VOLUME_SHIFT) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Mutex;

    use chorus_core::ring::{region_len, AudioRing};
    use chorus_core::shm::ShmRegion;
    use chorus_protocol::msg::ConnectMsg;
    use chorus_protocol::types::{Direction, SampleEncoding, StreamFlags, StreamType};
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    const RATE: u32 = 44100;
    const FRAME_BYTES: usize = 4; // stereo S16

    #[derive(Default)]
    struct FakeState {
        open_calls: usize,
        close_calls: usize,
        start_calls: usize,
        stop_calls: usize,
        is_open: bool,
        buffer_frames: usize,
        default_avail: usize,
        avail_script: VecDeque<Result<usize, PcmError>>,
        grant: usize,
        committed: Vec<usize>,
    }

    struct FakePcm {
        direction: Direction,
        supported: chorus_device::SupportedFormats,
        staging: Vec<u64>,
        state: Arc<Mutex<FakeState>>,
    }

    impl FakePcm {
        fn new(direction: Direction, buffer_frames: usize) -> FakePcm {
            let state = FakeState {
                buffer_frames,
                ..Default::default()
            };
            FakePcm {
                direction,
                supported: chorus_device::SupportedFormats::default(),
                staging: vec![0u64; 64 * 1024],
                state: Arc::new(Mutex::new(state)),
            }
        }

        fn staging_ptr(&mut self) -> *mut u8 {
            self.staging.as_mut_ptr() as *mut u8
        }
    }

    impl Pcm for FakePcm {
        fn direction(&self) -> Direction {
            self.direction
        }

        fn supported(&self) -> &chorus_device::SupportedFormats {
            &self.supported
        }

        fn open(&mut self, _format: &AudioFormat, _buffer_frames: usize) -> Result<(), PcmError> {
            let mut s = self.state.lock().unwrap();
            s.open_calls += 1;
            s.is_open = true;
            Ok(())
        }

        fn close(&mut self) {
            let mut s = self.state.lock().unwrap();
            s.close_calls += 1;
            s.is_open = false;
        }

        fn is_open(&self) -> bool {
            self.state.lock().unwrap().is_open
        }

        fn start(&mut self) -> Result<(), PcmError> {
            self.state.lock().unwrap().start_calls += 1;
            Ok(())
        }

        fn stop(&mut self) -> Result<(), PcmError> {
            self.state.lock().unwrap().stop_calls += 1;
            Ok(())
        }

        fn avail(&mut self) -> Result<usize, PcmError> {
            let mut s = self.state.lock().unwrap();
            match s.avail_script.pop_front() {
                Some(result) => result,
                None => Ok(s.default_avail),
            }
        }

        fn mmap_begin(&mut self, frames: usize) -> Result<MmapArea<'_>, PcmError> {
            let granted = {
                let s = self.state.lock().unwrap();
                if s.grant == 0 { frames } else { frames.min(s.grant) }
            };
            let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.staging);
            Ok(MmapArea {
                buf: &mut bytes[..granted * FRAME_BYTES],
                frames: granted,
            })
        }

        fn mmap_commit(&mut self, frames: usize) -> Result<(), PcmError> {
            self.state.lock().unwrap().committed.push(frames);
            Ok(())
        }

        fn delay(&mut self) -> Result<usize, PcmError> {
            Ok(0)
        }

        fn buffer_frames(&self) -> usize {
            self.state.lock().unwrap().buffer_frames
        }
    }

    struct TestStream {
        client_sock: UnixStream,
        ring: AudioRing,
        id: StreamId,
    }

    fn seqpacket_pair() -> (UnixStream, UnixStream) {
        let (a, b): (OwnedFd, OwnedFd) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        (UnixStream::from(a), UnixStream::from(b))
    }

    fn make_stream(
        id: u32,
        buffer_frames: u32,
        cb_threshold: u32,
        min_cb_level: u32,
    ) -> (Box<StreamRecord>, TestStream) {
        let connect = ConnectMsg::new(
            Direction::OUTPUT,
            StreamType::MEDIA,
            buffer_frames,
            cb_threshold,
            min_cb_level,
            StreamFlags::empty(),
            AudioFormat::new(RATE, 2, SampleEncoding::S16_LE),
        );
        let used = buffer_frames * FRAME_BYTES as u32;
        let region = ShmRegion::anonymous("chorus-worker-test", region_len(used)).unwrap();
        let ring = AudioRing::create(region, FRAME_BYTES as u32, used).unwrap();
        let (server_sock, client_sock) = seqpacket_pair();
        let record = Box::new(StreamRecord::new(
            StreamId(id),
            &connect,
            ring.handle(),
            server_sock,
        ));
        (record, TestStream { client_sock, ring, id: StreamId(id) })
    }

    struct Fixture {
        worker: Worker,
        state: Arc<Mutex<FakeState>>,
        staging: *mut u8,
        events: mailbox::Mailbox<Event>,
        _cmd_tx: mailbox::MailboxSender<Command>,
    }

    fn fixture(direction: Direction, buffer_frames: usize) -> Fixture {
        let mut pcm = FakePcm::new(direction, buffer_frames);
        let state = pcm.state.clone();
        let staging = pcm.staging_ptr();
        let (cmd_tx, cmd_rx) = mailbox::channel().unwrap();
        let (event_tx, event_rx) = mailbox::channel().unwrap();
        let worker = Worker::new(0, Box::new(pcm), Arc::new(Snapshot::new()), cmd_rx, event_tx);
        Fixture {
            worker,
            state,
            staging,
            events: event_rx,
            _cmd_tx: cmd_tx,
        }
    }

    fn staging_frames(fx: &Fixture, frames: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(fx.staging, frames * FRAME_BYTES) }
    }

    fn fill_ring(ring: &AudioRing, frames: u32, value: u8) {
        let mut left = frames;
        while left > 0 {
            let (buf, n) = ring.write_span(left);
            assert!(n > 0);
            buf.fill(value);
            ring.commit_write(n);
            left -= n;
        }
    }

    fn read_audio_msg(sock: &mut UnixStream) -> Option<AudioMsg> {
        let mut buf = [0u8; AUDIO_MSG_SIZE];
        match sock.read(&mut buf) {
            Ok(n) => AudioMsg::parse(&buf[..n]),
            Err(_) => None,
        }
    }

    // attach/detach and parameter configuration, per the add/remove suite

    #[test]
    fn first_attach_opens_and_configures() {
        let mut fx = fixture(Direction::OUTPUT, 16384);
        let (record, _ts) = make_stream(1, 65, 80, 10);
        fx.worker.handle_command(Command::Attach(record));

        let s = fx.state.lock().unwrap();
        assert_eq!(s.open_calls, 1);
        assert_eq!(s.start_calls, 0); // playback starts on first fill
        assert_eq!(fx.worker.used_size, 65);
        assert_eq!(fx.worker.cb_threshold, 80);
        assert_eq!(fx.worker.state, State::Running);
    }

    #[test]
    fn input_attach_starts_immediately() {
        let mut fx = fixture(Direction::INPUT, 16384);
        let (record, _ts) = make_stream(1, 480, 480, 1);
        fx.worker.handle_command(Command::Attach(record));
        assert_eq!(fx.state.lock().unwrap().start_calls, 1);
    }

    #[test]
    fn second_stream_tightens_params_then_reverts() {
        let mut fx = fixture(Direction::OUTPUT, 16384);
        let (a, _ta) = make_stream(1, 65, 80, 10);
        let (b, _tb) = make_stream(2, 25, 12, 4);

        fx.worker.handle_command(Command::Attach(a));
        assert_eq!((fx.worker.used_size, fx.worker.cb_threshold), (65, 80));

        fx.worker.handle_command(Command::Attach(b));
        assert_eq!((fx.worker.used_size, fx.worker.cb_threshold), (25, 12));
        assert_eq!(fx.state.lock().unwrap().open_calls, 1); // still one open

        fx.worker.handle_command(Command::Detach(StreamId(2)));
        assert_eq!((fx.worker.used_size, fx.worker.cb_threshold), (65, 80));
        assert!(fx.state.lock().unwrap().is_open);

        fx.worker.handle_command(Command::Detach(StreamId(1)));
        assert!(!fx.state.lock().unwrap().is_open);
        assert_eq!(fx.worker.state, State::Idle);

        let reasons: Vec<bool> = fx
            .events
            .drain()
            .map(|e| matches!(e, Event::Detached { reason: DetachReason::Requested, .. } | Event::Idle { .. }))
            .collect();
        assert!(reasons.iter().all(|ok| *ok));
    }

    // playback servicing

    #[test]
    fn playback_early_wake_goes_back_to_sleep() {
        let mut fx = fixture(Direction::OUTPUT, 16384);
        let (record, mut ts) = make_stream(1, 480, 96, 240);
        fx.worker.handle_command(Command::Attach(record));

        // two callback periods still queued
        fx.state.lock().unwrap().avail_script.push_back(Ok(16384 - 96 * 2));
        let sleep = fx.worker.output_pass().unwrap();
        assert_eq!(sleep, frames_to_duration(96, RATE));

        // no mix, no request
        assert!(fx.state.lock().unwrap().committed.is_empty());
        assert!(read_audio_msg(&mut ts.client_sock).is_none());
    }

    #[test]
    fn playback_fills_from_stream() {
        let mut fx = fixture(Direction::OUTPUT, 16384);
        let (record, ts) = make_stream(1, 480, 96, 240);
        fx.worker.handle_command(Command::Attach(record));

        fill_ring(&ts.ring, 480, 0x01);

        {
            let mut s = fx.state.lock().unwrap();
            s.avail_script.push_back(Ok(16384 - 96));
            s.grant = 480 - 96;
        }
        let sleep = fx.worker.output_pass().unwrap();

        // fills to the used_size watermark and sleeps until it drains back
        // to the callback threshold
        assert_eq!(sleep, frames_to_duration((480 - 96) as u64, RATE));
        assert_eq!(fx.state.lock().unwrap().committed, vec![480 - 96]);
        assert_eq!(fx.state.lock().unwrap().start_calls, 1);

        // unity volume: the mixed output is the ring bytes as-is
        let g = 480 - 96;
        assert!(staging_frames(&fx, g).iter().all(|b| *b == 0x01));
        // consumed from the ring
        assert_eq!(ts.ring.readable_frames(), 480 - g as u32);
    }

    #[test]
    fn playback_requests_data_when_ring_is_low() {
        let mut fx = fixture(Direction::OUTPUT, 16384);
        let (record, mut ts) = make_stream(1, 480, 96, 240);
        fx.worker.handle_command(Command::Attach(record));

        {
            let mut s = fx.state.lock().unwrap();
            s.avail_script.push_back(Ok(16384 - 96));
            s.grant = 384;
        }
        fx.worker.output_pass().unwrap();

        let msg = read_audio_msg(&mut ts.client_sock).expect("expected REQUEST_DATA");
        assert_eq!(msg.id, AudioMsgId::REQUEST_DATA);
        assert_eq!(msg.frames, 384);
        // empty ring: hardware still got g frames of silence
        assert_eq!(fx.state.lock().unwrap().committed, vec![384]);
        assert!(staging_frames(&fx, 384).iter().all(|b| *b == 0));
    }

    #[test]
    fn playback_counts_underrun_after_deadline() {
        let mut fx = fixture(Direction::OUTPUT, 16384);
        let (record, _ts) = make_stream(1, 480, 96, 240);
        fx.worker.handle_command(Command::Attach(record));

        {
            let mut s = fx.state.lock().unwrap();
            s.avail_script.push_back(Ok(16384 - 96));
            s.avail_script.push_back(Ok(16384 - 96));
            s.grant = 384;
        }
        fx.worker.output_pass().unwrap();
        assert_eq!(fx.worker.streams[0].num_underruns, 0);

        // backdate the outstanding request past two callback periods
        let expired = time::now() - TimeSpec::from_duration(Duration::from_secs(1));
        fx.worker.streams[0].rearm_pending(expired);
        fx.worker.output_pass().unwrap();
        assert_eq!(fx.worker.streams[0].num_underruns, 1);
    }

    #[test]
    fn playback_avail_error_recovers_once() {
        let mut fx = fixture(Direction::OUTPUT, 16384);
        let (record, _ts) = make_stream(1, 480, 96, 240);
        fx.worker.handle_command(Command::Attach(record));

        fx.state.lock().unwrap().avail_script.push_back(Err(PcmError::Xrun));
        let sleep = fx.worker.service();
        assert!(sleep.is_some());

        let s = fx.state.lock().unwrap();
        assert_eq!(s.close_calls, 1);
        assert_eq!(s.open_calls, 2);
        drop(s);
        assert_eq!(fx.worker.streams[0].num_underruns, 1);
        assert!(!fx.worker.dead);
    }

    #[test]
    fn three_xruns_fail_the_device() {
        let mut fx = fixture(Direction::OUTPUT, 16384);
        let (record, _ts) = make_stream(1, 480, 96, 240);
        fx.worker.handle_command(Command::Attach(record));

        for _ in 0..3 {
            fx.state.lock().unwrap().avail_script.push_back(Err(PcmError::Xrun));
            fx.worker.service();
        }
        assert!(fx.worker.dead);
        assert!(fx.worker.streams.is_empty());

        let mut saw_failed = false;
        let mut saw_detached = false;
        for event in fx.events.drain() {
            match event {
                Event::Failed { device } => {
                    assert_eq!(device, 0);
                    saw_failed = true;
                }
                Event::Detached { reason, .. } => {
                    if reason == DetachReason::DeviceFailed {
                        saw_detached = true;
                    }
                }
                _ => {}
            }
        }
        assert!(saw_failed && saw_detached);
    }

    // capture servicing

    #[test]
    fn capture_empty_sleeps_a_callback_period() {
        let mut fx = fixture(Direction::INPUT, 16384);
        let (record, _ts) = make_stream(1, 480, 480, 1);
        fx.worker.handle_command(Command::Attach(record));

        fx.state.lock().unwrap().avail_script.push_back(Ok(0));
        let sleep = fx.worker.input_pass().unwrap();
        assert_eq!(sleep, frames_to_duration(480, RATE));
        assert!(fx.state.lock().unwrap().committed.is_empty());
    }

    #[test]
    fn capture_copies_block_and_signals_ready() {
        let mut fx = fixture(Direction::INPUT, 16384);
        let (record, mut ts) = make_stream(1, 480, 480, 1);
        fx.worker.handle_command(Command::Attach(record));

        // captured pattern in the fake hardware ring
        unsafe { std::slice::from_raw_parts_mut(fx.staging, 480 * FRAME_BYTES).fill(0x42) };
        {
            let mut s = fx.state.lock().unwrap();
            s.avail_script.push_back(Ok(480 + 4));
            s.grant = 480;
        }
        let sleep = fx.worker.input_pass().unwrap();

        // leftover 4 frames shorten the next sleep
        assert_eq!(sleep, frames_to_duration((480 - 4) as u64, RATE));
        let ready = read_audio_msg(&mut ts.client_sock).expect("expected DATA_READY");
        assert_eq!(ready.id, AudioMsgId::DATA_READY);
        assert_eq!(ready.frames, 480);

        let (bytes, n) = ts.ring.reserve_read(480);
        assert_eq!(n, 480);
        assert!(bytes.iter().all(|b| *b == 0x42));
    }

    #[test]
    fn capture_third_unread_block_overruns() {
        let mut fx = fixture(Direction::INPUT, 16384);
        let (record, mut ts) = make_stream(1, 480, 480, 1);
        fx.worker.handle_command(Command::Attach(record));

        for pass in 1u8..=3 {
            unsafe {
                std::slice::from_raw_parts_mut(fx.staging, 480 * FRAME_BYTES).fill(pass)
            };
            {
                let mut s = fx.state.lock().unwrap();
                s.avail_script.push_back(Ok(480 + 4));
                s.grant = 480;
            }
            fx.worker.input_pass().unwrap();
            let ready = read_audio_msg(&mut ts.client_sock).expect("expected DATA_READY");
            assert_eq!(ready.frames, 480);

            let expect = if pass < 3 { 0 } else { 1 };
            assert_eq!(ts.ring.num_overruns(), expect, "pass {pass}");
        }

        // after the overrun the newest block is what remains readable
        let (bytes, n) = ts.ring.reserve_read(480);
        assert_eq!(n, 480);
        assert!(bytes.iter().all(|b| *b == 3));
    }

    #[test]
    fn capture_without_streams_discards() {
        let mut fx = fixture(Direction::INPUT, 16384);
        let (record, _ts) = make_stream(1, 480, 480, 1);
        fx.worker.handle_command(Command::Attach(record));
        fx.worker.handle_command(Command::Detach(StreamId(1)));
        // capture device closes when the last stream leaves
        assert!(!fx.state.lock().unwrap().is_open);
    }

    // data-plane and command plumbing

    #[test]
    fn data_ready_clears_pending() {
        let mut fx = fixture(Direction::OUTPUT, 16384);
        let (record, mut ts) = make_stream(1, 480, 96, 240);
        fx.worker.handle_command(Command::Attach(record));

        {
            let mut s = fx.state.lock().unwrap();
            s.avail_script.push_back(Ok(16384 - 96));
            s.grant = 384;
        }
        fx.worker.output_pass().unwrap();
        assert!(fx.worker.streams[0].is_pending());
        assert!(read_audio_msg(&mut ts.client_sock).is_some());

        ts.client_sock
            .write_all(AudioMsg::data_ready(384).as_bytes())
            .unwrap();
        fx.worker.pump_data_messages();
        assert!(!fx.worker.streams[0].is_pending());
    }

    #[test]
    fn closed_data_socket_detaches_stream() {
        let mut fx = fixture(Direction::OUTPUT, 16384);
        let (record, ts) = make_stream(1, 480, 96, 240);
        fx.worker.handle_command(Command::Attach(record));

        drop(ts.client_sock);
        fx.worker.pump_data_messages();
        assert!(fx.worker.streams.is_empty());
    }

    #[test]
    fn reattach_hands_stream_back_with_target() {
        let mut fx = fixture(Direction::OUTPUT, 16384);
        let (record, ts) = make_stream(1, 480, 96, 240);
        fx.worker.handle_command(Command::Attach(record));
        fx.worker.handle_command(Command::Reattach { stream: ts.id, device: 3 });

        let mut found = false;
        for event in fx.events.drain() {
            if let Event::Detached { stream, reason } = event {
                assert_eq!(stream.id, ts.id);
                assert_eq!(reason, DetachReason::Reattach { device: 3 });
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn unplug_releases_every_stream() {
        let mut fx = fixture(Direction::OUTPUT, 16384);
        let (a, _ta) = make_stream(1, 480, 96, 240);
        let (b, _tb) = make_stream(2, 480, 96, 240);
        fx.worker.handle_command(Command::Attach(a));
        fx.worker.handle_command(Command::Attach(b));

        fx.worker.handle_command(Command::Jack { plugged: false });
        assert!(fx.worker.streams.is_empty());
        let unplugged = fx
            .events
            .drain()
            .filter(|e| matches!(e, Event::Detached { reason: DetachReason::Unplugged, .. }))
            .count();
        assert_eq!(unplugged, 2);
    }

    #[test]
    fn stop_releases_streams_and_reports() {
        let mut fx = fixture(Direction::OUTPUT, 16384);
        let (record, _ts) = make_stream(1, 480, 96, 240);
        fx.worker.handle_command(Command::Attach(record));

        fx.state.lock().unwrap().default_avail = 16384;
        let keep_running = fx.worker.handle_command(Command::Stop);
        assert!(!keep_running);
        assert!(fx
            .events
            .drain()
            .any(|e| matches!(e, Event::Stopped { device: 0 })));
    }
}
