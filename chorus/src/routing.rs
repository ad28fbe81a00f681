//! Device list and stream routing: which device a stream of a given type
//! lands on, what happens when jacks plug and unplug, and how streams move
//! between workers without dropping their control sockets.
//!
//! Everything here runs on the main thread; workers are reached only
//! through their command mailboxes.

use std::sync::Arc;

use chorus_device::{Backend, NodeType, Pcm, SupportedFormats};
use chorus_protocol::types::{err, AudioFormat, Direction, NodeId, StreamId, StreamType};
use chorus_util::time;

use crate::state::{Change, Snapshot};
use crate::stream::StreamRecord;
use crate::worker::{self, Command, DetachReason, Event, Handle};

pub struct NodeRec {
    pub id: NodeId,
    pub node_type: NodeType,
    pub name: String,
    pub plugged: bool,
    pub plugged_time_us: u64,
    pub volume: u32,
    pub capture_gain: i64,
}

struct AttachedStream {
    id: StreamId,
    stream_type: StreamType,
}

pub struct DeviceRec {
    pub idx: u32,
    pub name: String,
    pub direction: Direction,
    pub supported: SupportedFormats,
    /// Fixed by the first attached stream; later mismatches are rejected.
    pub current_format: Option<AudioFormat>,
    pub nodes: Vec<NodeRec>,
    pub failed: bool,
    attached: Vec<AttachedStream>,
    worker: Option<Handle>,
}

#[derive(Clone, Copy, Default)]
struct TypeDefaults {
    output: Option<u32>,
    input: Option<u32>,
}

impl TypeDefaults {
    fn get(&self, direction: Direction) -> Option<u32> {
        if direction.is_input() {
            self.input
        } else {
            self.output
        }
    }

    fn set(&mut self, direction: Direction, device: Option<u32>) {
        if direction.is_input() {
            self.input = device;
        } else {
            self.output = device;
        }
    }
}

type Spawner = Box<dyn FnMut(u32, Box<dyn Pcm>, Arc<Snapshot>) -> nix::Result<Handle>>;

pub struct DeviceList {
    backend: Box<dyn Backend>,
    devices: Vec<DeviceRec>,
    defaults: [TypeDefaults; StreamType::COUNT],
    active_output: Option<NodeId>,
    active_input: Option<NodeId>,
    /// Streams with no device for their direction, waiting for one.
    parked: Vec<Box<StreamRecord>>,
    /// Clients that should be told to reconnect their stream.
    reattach_notices: Vec<StreamId>,
    snapshot: Arc<Snapshot>,
    spawner: Spawner,
}

impl DeviceList {
    pub fn new(backend: Box<dyn Backend>, snapshot: Arc<Snapshot>) -> DeviceList {
        Self::with_spawner(
            backend,
            snapshot,
            Box::new(|idx, pcm, snapshot| worker::spawn(idx, pcm, snapshot)),
        )
    }

    pub(crate) fn with_spawner(
        mut backend: Box<dyn Backend>,
        snapshot: Arc<Snapshot>,
        spawner: Spawner,
    ) -> DeviceList {
        let descs = backend.probe();
        let mut devices = Vec::with_capacity(descs.len());
        for (i, desc) in descs.into_iter().enumerate() {
            // device indices are 1-based on the wire; 0 means "follow the
            // routing default"
            let idx = (i + 1) as u32;
            let nodes = desc
                .nodes
                .into_iter()
                .enumerate()
                .map(|(n, node)| NodeRec {
                    id: NodeId::new(idx, n as u32),
                    node_type: node.node_type,
                    name: node.name,
                    plugged: node.plugged,
                    plugged_time_us: if node.plugged { time::realtime_micros() } else { 0 },
                    volume: 100,
                    capture_gain: 0,
                })
                .collect();
            devices.push(DeviceRec {
                idx,
                name: desc.name,
                direction: desc.direction,
                supported: desc.supported,
                current_format: None,
                nodes,
                failed: false,
                attached: Vec::new(),
                worker: None,
            });
        }

        let mut list = DeviceList {
            backend,
            devices,
            defaults: [TypeDefaults::default(); StreamType::COUNT],
            active_output: None,
            active_input: None,
            parked: Vec::new(),
            reattach_notices: Vec::new(),
            snapshot,
            spawner,
        };

        for direction in [Direction::OUTPUT, Direction::INPUT] {
            if let Some(node) = list.best_plugged_node(direction) {
                list.set_active(direction, node);
            }
        }
        list
    }

    pub fn devices(&self) -> &[DeviceRec] {
        &self.devices
    }

    pub fn active_node(&self, direction: Direction) -> Option<NodeId> {
        if direction.is_input() {
            self.active_input
        } else {
            self.active_output
        }
    }

    /// Stream ids whose clients should receive STREAM_REATTACH.
    pub fn take_reattach_notices(&mut self) -> Vec<StreamId> {
        std::mem::take(&mut self.reattach_notices)
    }

    /// Worker event descriptors for the main thread's poll set.
    pub fn event_fds(&self) -> Vec<std::os::fd::BorrowedFd<'_>> {
        self.devices
            .iter()
            .filter_map(|d| d.worker.as_ref().map(|w| w.events.fd()))
            .collect()
    }

    fn device_mut(&mut self, idx: u32) -> Option<&mut DeviceRec> {
        self.devices.iter_mut().find(|d| d.idx == idx && !d.failed)
    }

    fn device(&self, idx: u32) -> Option<&DeviceRec> {
        self.devices.iter().find(|d| d.idx == idx && !d.failed)
    }

    /// Does any usable device in this direction accept the format?
    pub fn format_supported(&self, direction: Direction, format: &AudioFormat) -> bool {
        self.devices
            .iter()
            .any(|d| !d.failed && d.direction == direction && d.supported.supports(format))
    }

    fn best_plugged_node(&self, direction: Direction) -> Option<NodeId> {
        self.devices
            .iter()
            .filter(|d| !d.failed && d.direction == direction)
            .flat_map(|d| d.nodes.iter())
            .filter(|n| n.plugged)
            .max_by_key(|n| n.node_type.priority())
            .map(|n| n.id)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut NodeRec> {
        self.devices
            .iter_mut()
            .find(|d| d.idx == id.device())
            .and_then(|d| d.nodes.iter_mut().find(|n| n.id == id))
    }

    fn recount_streams(&mut self) {
        let count = self.devices.iter().map(|d| d.attached.len()).sum::<usize>() as i32;
        if count != self.snapshot.active_streams() {
            self.snapshot.set_active_streams(count);
        }
    }

    /// Route and attach a stream. `Ok(None)` parks the stream until a
    /// device for its direction appears.
    pub fn attach_stream(&mut self, stream: Box<StreamRecord>) -> Result<Option<u32>, i32> {
        let direction = stream.direction;
        let target = if stream.device_binding != 0 {
            self.device(stream.device_binding)
                .filter(|d| d.direction == direction)
                .map(|d| d.idx)
        } else {
            self.defaults[stream.stream_type.index()]
                .get(direction)
                .filter(|idx| self.device(*idx).is_some())
                .or_else(|| {
                    self.best_plugged_node(direction).map(|node| node.device())
                })
        };

        let Some(idx) = target else {
            log::info!("no {direction:?} device for stream {}, parking", stream.id);
            self.parked.push(stream);
            return Ok(None);
        };

        self.attach_to(stream, idx).map(Some)
    }

    fn attach_to(&mut self, stream: Box<StreamRecord>, idx: u32) -> Result<u32, i32> {
        let pos = self
            .devices
            .iter()
            .position(|d| d.idx == idx && !d.failed)
            .ok_or(err::NO_DEVICE)?;

        {
            let device = &self.devices[pos];
            if !device.supported.supports(&stream.format) {
                return Err(err::FORMAT_UNSUPPORTED);
            }
            // first attached stream fixes the running format
            if let Some(current) = device.current_format {
                if current != stream.format {
                    return Err(err::FORMAT_UNSUPPORTED);
                }
            }
        }

        if self.devices[pos].worker.is_none() {
            let name = self.devices[pos].name.clone();
            let direction = self.devices[pos].direction;
            let pcm = self.backend.pcm(&name, direction).map_err(|e| {
                log::error!("device {idx}: creating pcm failed: {e}");
                err::HARDWARE
            })?;
            let snapshot = self.snapshot.clone();
            let handle = (self.spawner)(idx, pcm, snapshot).map_err(|e| {
                log::error!("device {idx}: spawning worker failed: {e}");
                err::HARDWARE
            })?;
            self.devices[pos].worker = Some(handle);
        }

        let id = stream.id;
        let stream_type = stream.stream_type;
        let format = stream.format;
        let device = &mut self.devices[pos];
        let worker = device.worker.as_ref().expect("worker just ensured");
        if worker.cmds.send(Command::Attach(stream)).is_err() {
            return Err(err::HARDWARE);
        }
        device.attached.push(AttachedStream { id, stream_type });
        device.current_format.get_or_insert(format);
        log::info!("stream {id} attached to device {idx}");
        self.recount_streams();
        Ok(idx)
    }

    /// Ask the owning worker to drop a stream (client disconnect).
    pub fn detach_stream(&mut self, id: StreamId) {
        self.parked.retain(|s| s.id != id);
        for device in &self.devices {
            if device.attached.iter().any(|s| s.id == id) {
                if let Some(worker) = &device.worker {
                    worker.send(Command::Detach(id));
                }
                return;
            }
        }
    }

    /// Move every stream of `stream_type` to `device_idx`; 0 restores the
    /// routing default.
    pub fn switch_type_to_device(&mut self, stream_type: StreamType, device_idx: u32) {
        let Some(direction) = self.device(device_idx).map(|d| d.direction) else {
            log::warn!("switch to unknown device {device_idx}");
            return;
        };
        self.defaults[stream_type.index()].set(direction, Some(device_idx));
        for device in &self.devices {
            if device.idx == device_idx || device.direction != direction {
                continue;
            }
            if let Some(worker) = &device.worker {
                for stream in &device.attached {
                    if stream.stream_type == stream_type {
                        worker.send(Command::Reattach {
                            stream: stream.id,
                            device: device_idx,
                        });
                    }
                }
            }
        }
    }

    /// Make `node` the active endpoint for its direction. Returns false
    /// (and stays silent) when it already is.
    pub fn select_node(&mut self, direction: Direction, node: NodeId) -> bool {
        let exists = self
            .device(node.device())
            .filter(|d| d.direction == direction)
            .map(|d| d.nodes.iter().any(|n| n.id == node && n.plugged))
            .unwrap_or(false);
        if !exists {
            log::warn!("select of unknown or unplugged node {node}");
            return false;
        }
        if self.active_node(direction) == Some(node) {
            return false;
        }
        self.set_active(direction, node);
        let change = if direction.is_input() {
            Change::ActiveInputNode(node)
        } else {
            Change::ActiveOutputNode(node)
        };
        self.snapshot.notify(change);
        true
    }

    fn set_active(&mut self, direction: Direction, node: NodeId) {
        let idx = node.device();
        if direction.is_input() {
            self.active_input = Some(node);
        } else {
            self.active_output = Some(node);
        }
        for defaults in &mut self.defaults {
            defaults.set(direction, Some(idx));
        }
        // pull streams over from every other device in this direction
        for device in &self.devices {
            if device.idx == idx || device.direction != direction {
                continue;
            }
            if let Some(worker) = &device.worker {
                for stream in &device.attached {
                    worker.send(Command::Reattach { stream: stream.id, device: idx });
                }
            }
        }
        self.unpark(direction);
    }

    /// A device became available; parked streams get a reattach notice so
    /// their clients reconnect.
    fn unpark(&mut self, direction: Direction) {
        let mut kept = Vec::new();
        for stream in std::mem::take(&mut self.parked) {
            if stream.direction == direction {
                self.reattach_notices.push(stream.id);
            } else {
                kept.push(stream);
            }
        }
        self.parked = kept;
    }

    /// Jack state changed on a node. A newly plugged node becomes the
    /// default when it outranks the current one; unplugging the active
    /// node falls back to the best remaining endpoint.
    pub fn jack_event(&mut self, node_id: NodeId, plugged: bool) {
        {
            let Some(node) = self.node_mut(node_id) else {
                log::warn!("jack event for unknown node {node_id}");
                return;
            };
            node.plugged = plugged;
            node.plugged_time_us = if plugged { time::realtime_micros() } else { 0 };
        }
        let Some(direction) = self
            .devices
            .iter()
            .find(|d| d.idx == node_id.device())
            .map(|d| d.direction)
        else {
            return;
        };
        self.snapshot.notify(Change::Nodes);

        if plugged {
            let current_priority = self
                .active_node(direction)
                .and_then(|id| self.node_priority(id))
                .unwrap_or(0);
            let new_priority = self.node_priority(node_id).unwrap_or(0);
            if new_priority > current_priority {
                self.select_node(direction, node_id);
            }
        } else if self.active_node(direction) == Some(node_id) {
            // release the device's streams, then land them on the fallback
            if let Some(device) = self.device(node_id.device()) {
                if let Some(worker) = &device.worker {
                    worker.send(Command::Jack { plugged: false });
                }
            }
            if direction.is_input() {
                self.active_input = None;
            } else {
                self.active_output = None;
            }
            match self.best_plugged_node(direction) {
                Some(fallback) => {
                    self.select_node(direction, fallback);
                }
                None => {
                    for defaults in &mut self.defaults {
                        defaults.set(direction, None);
                    }
                }
            }
        }
    }

    fn node_priority(&self, id: NodeId) -> Option<u32> {
        self.device(id.device())
            .and_then(|d| d.nodes.iter().find(|n| n.id == id))
            .filter(|n| n.plugged)
            .map(|n| n.node_type.priority())
    }

    pub fn set_node_volume(&mut self, id: NodeId, volume: u32) -> bool {
        let volume = volume.min(crate::state::MAX_VOLUME);
        match self.node_mut(id) {
            Some(node) => {
                node.volume = volume;
                self.snapshot.notify(Change::OutputNodeVolume(id, volume));
                true
            }
            None => false,
        }
    }

    pub fn set_node_gain(&mut self, id: NodeId, gain: i64) -> bool {
        match self.node_mut(id) {
            Some(node) => {
                node.capture_gain = gain;
                self.snapshot.notify(Change::InputNodeGain(id, gain));
                true
            }
            None => false,
        }
    }

    /// Drain and apply every pending worker event. Must run on the main
    /// thread between servicing passes.
    pub fn pump_events(&mut self) {
        let mut events = Vec::new();
        for device in &self.devices {
            if let Some(worker) = &device.worker {
                events.extend(worker.events.drain());
            }
        }
        for event in events {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Detached { stream, reason } => {
                self.forget_attachment(stream.id);
                match reason {
                    DetachReason::Requested => {}
                    DetachReason::Reattach { device } => {
                        let id = stream.id;
                        if let Err(code) = self.attach_to(stream, device) {
                            // the record is gone; tell the client to redo
                            // the handshake
                            log::warn!("reattach to device {device} failed ({code})");
                            self.reattach_notices.push(id);
                        }
                    }
                    DetachReason::DeviceFailed | DetachReason::Unplugged => {
                        self.reattach_notices.push(stream.id);
                        let mut stream = stream;
                        stream.device_binding = 0;
                        if let Err(code) = self.attach_stream(stream).map(|_| ()) {
                            log::warn!("rerouting stream failed ({code})");
                        }
                    }
                }
                self.recount_streams();
            }
            Event::Idle { device } => {
                if let Some(device) = self.device_mut(device) {
                    device.current_format = None;
                }
            }
            Event::Failed { device } => {
                log::warn!("device {device} marked failed");
                if let Some(rec) = self.devices.iter_mut().find(|d| d.idx == device) {
                    rec.failed = true;
                    rec.current_format = None;
                    if let Some(mut worker) = rec.worker.take() {
                        worker.join();
                    }
                }
                self.snapshot.notify(Change::Nodes);
            }
            Event::Stopped { device } => {
                if let Some(rec) = self.devices.iter_mut().find(|d| d.idx == device) {
                    if let Some(mut worker) = rec.worker.take() {
                        worker.join();
                    }
                }
            }
        }
    }

    fn forget_attachment(&mut self, id: StreamId) {
        for device in &mut self.devices {
            device.attached.retain(|s| s.id != id);
            if device.attached.is_empty() && device.worker.is_none() {
                device.current_format = None;
            }
        }
    }

    /// Stop every worker and join them; called on shutdown.
    pub fn stop_all(&mut self) {
        for device in &mut self.devices {
            if let Some(mut worker) = device.worker.take() {
                log::info!("stopping worker for device {}", worker.device);
                worker.send(Command::Stop);
                worker.join();
            }
        }
    }
}
