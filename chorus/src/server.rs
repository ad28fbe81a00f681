//! Server front-end: accept control sockets, parse connect messages,
//! allocate stream resources, and hand streams to the routing engine. Runs
//! entirely on the main thread.

use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use chorus_core::ring::{region_len, AudioRing};
use chorus_core::shm::ShmRegion;
use chorus_device::null::NullBackend;
use chorus_protocol::msg::{
    self, ClientConnectedMsg, ConnectMsg, CtlMsg, StreamConnectedMsg, StreamReattachMsg,
};
use chorus_protocol::types::{err, ClientId, StreamId};

use crate::routing::DeviceList;
use crate::socket::{self, MsgReader};
use crate::state::Snapshot;
use crate::stream::StreamRecord;
use crate::{Opt, RunError};

pub const MAX_STREAMS: usize = 64;

struct Client {
    id: ClientId,
    sock: UnixStream,
    reader: MsgReader,
    next_seq: u16,
    streams: Vec<StreamId>,
    dead: bool,
}

pub struct Server {
    clients: Vec<Client>,
    devices: DeviceList,
    next_client: u32,
    max_streams: usize,
}

pub fn run(opt: Opt) -> Result<(), RunError> {
    let snapshot = Arc::new(Snapshot::new());
    let devices = DeviceList::new(Box::new(NullBackend), snapshot);
    let listener = socket::listen(&opt.socket).map_err(RunError::Listen)?;
    Server::new(devices).run_loop(&listener);
    Ok(())
}

impl Server {
    pub fn new(devices: DeviceList) -> Server {
        Server {
            clients: Vec::new(),
            devices,
            next_client: 1,
            max_streams: MAX_STREAMS,
        }
    }

    fn run_loop(&mut self, listener: &UnixListener) {
        loop {
            let (accept_ready, client_ready) = {
                let mut fds = Vec::with_capacity(1 + self.clients.len());
                fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
                for client in &self.clients {
                    fds.push(PollFd::new(client.sock.as_fd(), PollFlags::POLLIN));
                }
                for fd in self.devices.event_fds() {
                    fds.push(PollFd::new(fd, PollFlags::POLLIN));
                }
                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) => {}
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        log::error!("main poll failed: {e}");
                        self.devices.stop_all();
                        return;
                    }
                }
                let accept = fds[0].any() == Some(true);
                let ready: Vec<bool> = (0..self.clients.len())
                    .map(|i| fds[1 + i].any() == Some(true))
                    .collect();
                (accept, ready)
            };

            if accept_ready {
                self.accept_all(listener);
            }
            for (i, ready) in client_ready.into_iter().enumerate() {
                if ready {
                    self.service_client(i);
                }
            }
            self.pump_devices();
            self.reap_clients();
        }
    }

    fn accept_all(&mut self, listener: &UnixListener) {
        loop {
            match listener.accept() {
                Ok((sock, _)) => {
                    self.add_client(sock);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn add_client(&mut self, sock: UnixStream) -> ClientId {
        let id = ClientId(self.next_client & 0xffff);
        self.next_client += 1;

        let hello = ClientConnectedMsg::new(id);
        let dead = socket::send_msg(&sock, msg::as_bytes(&hello)).is_err();

        log::info!("client {id} connected");
        self.clients.push(Client {
            id,
            sock,
            reader: MsgReader::new(),
            next_seq: 0,
            streams: Vec::new(),
            dead,
        });
        id
    }

    fn service_client(&mut self, idx: usize) {
        let mut buf = [0u8; 1024];
        loop {
            match socket::recv_with_fds(&self.clients[idx].sock, &mut buf) {
                Ok((0, _)) => {
                    self.clients[idx].dead = true;
                    return;
                }
                Ok((n, _fds)) => self.clients[idx].reader.push(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.clients[idx].dead = true;
                    return;
                }
            }
        }

        loop {
            let frame = match self.clients[idx].reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("client {}: {e}", self.clients[idx].id);
                    self.reject(idx, err::PROTOCOL, StreamId(0));
                    self.clients[idx].dead = true;
                    return;
                }
            };
            match msg::parse(&frame) {
                Ok(CtlMsg::Connect(connect)) => self.handle_connect(idx, connect),
                Ok(CtlMsg::Disconnect(m)) => self.handle_disconnect(idx, m.stream_id),
                Ok(CtlMsg::SwitchTypeDevice(m)) => {
                    self.devices.switch_type_to_device(m.stream_type, m.device_idx);
                }
                Ok(_) => {
                    // server-to-client kinds are nonsense from a client
                    log::warn!("client {}: unexpected message kind", self.clients[idx].id);
                    self.reject(idx, err::PROTOCOL, StreamId(0));
                    self.clients[idx].dead = true;
                    return;
                }
                Err(e) => {
                    log::warn!("client {}: malformed message: {e:?}", self.clients[idx].id);
                    self.reject(idx, err::PROTOCOL, StreamId(0));
                    self.clients[idx].dead = true;
                    return;
                }
            }
        }
    }

    fn handle_connect(&mut self, idx: usize, connect: ConnectMsg) {
        if let Err(code) = StreamRecord::validate(&connect) {
            self.reject(idx, code, connect.stream_id);
            return;
        }
        if !self.devices.format_supported(connect.direction, &connect.format) {
            self.reject(idx, err::FORMAT_UNSUPPORTED, connect.stream_id);
            return;
        }
        if self.stream_count() >= self.max_streams {
            self.reject(idx, err::NO_RESOURCES, connect.stream_id);
            return;
        }

        let client_id = self.clients[idx].id;
        let seq = self.clients[idx].next_seq;
        let id = StreamId::new(client_id, seq);

        let frame_bytes = connect.format.frame_bytes();
        let used_size = connect.buffer_frames * frame_bytes;
        let shm_len = region_len(used_size);

        let region = match ShmRegion::anonymous(&format!("chorus-stream-{id}"), shm_len) {
            Ok(region) => region,
            Err(e) => {
                log::error!("stream {id}: shm failed: {e}");
                self.reject(idx, err::NO_RESOURCES, id);
                return;
            }
        };
        let ring = match AudioRing::create(region, frame_bytes, used_size) {
            Ok(ring) => ring,
            Err(e) => {
                log::error!("stream {id}: ring failed: {e}");
                self.reject(idx, err::NO_RESOURCES, id);
                return;
            }
        };
        let (server_sock, client_sock) = match socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        ) {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("stream {id}: socketpair failed: {e}");
                self.reject(idx, err::NO_RESOURCES, id);
                return;
            }
        };

        let record = StreamRecord::new(id, &connect, ring.handle(), UnixStream::from(server_sock));
        if let Err(code) = self.devices.attach_stream(Box::new(record)) {
            self.reject(idx, code, id);
            return;
        }

        self.clients[idx].next_seq = seq.wrapping_add(1);
        let reply = StreamConnectedMsg::new(id, connect.format, id.0, shm_len as u32);
        let fds = [ring.region().fd().as_raw_fd(), client_sock.as_raw_fd()];
        match socket::send_with_fds(&self.clients[idx].sock, msg::as_bytes(&reply), &fds) {
            Ok(()) => {
                self.clients[idx].streams.push(id);
            }
            Err(e) => {
                log::warn!("client {client_id}: reply failed: {e}");
                self.clients[idx].dead = true;
                self.devices.detach_stream(id);
            }
        }
        // our copy of the client's data socket closes here
    }

    fn handle_disconnect(&mut self, idx: usize, id: StreamId) {
        if id.client() != self.clients[idx].id {
            log::warn!("client {}: disconnect for foreign stream {id}", self.clients[idx].id);
            return;
        }
        self.devices.detach_stream(id);
        self.clients[idx].streams.retain(|s| *s != id);
    }

    fn reject(&mut self, idx: usize, code: i32, id: StreamId) {
        let reply = StreamConnectedMsg::error(code, id);
        if socket::send_msg(&self.clients[idx].sock, msg::as_bytes(&reply)).is_err() {
            self.clients[idx].dead = true;
        }
    }

    /// Apply worker events and tell clients about streams that need to
    /// reconnect.
    fn pump_devices(&mut self) {
        self.devices.pump_events();
        for id in self.devices.take_reattach_notices() {
            let reattach = StreamReattachMsg::new(id);
            if let Some(client) = self.clients.iter_mut().find(|c| c.id == id.client()) {
                let _ = socket::send_msg(&client.sock, msg::as_bytes(&reattach));
                client.streams.retain(|s| *s != id);
            }
        }
    }

    /// Dead control socket: implicit disconnect for every stream the
    /// client owned.
    fn reap_clients(&mut self) {
        let mut i = 0;
        while i < self.clients.len() {
            if self.clients[i].dead {
                let client = self.clients.remove(i);
                log::info!("client {} disconnected", client.id);
                for id in client.streams {
                    self.devices.detach_stream(id);
                }
            } else {
                i += 1;
            }
        }
    }

    fn stream_count(&self) -> usize {
        self.clients.iter().map(|c| c.streams.len()).sum()
    }
}
