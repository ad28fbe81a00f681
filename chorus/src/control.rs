//! Control-plane surface exposed to session managers. A transport front-end
//! (D-Bus or similar) maps its method calls onto `Controls` and forwards
//! snapshot change notifications as signals; node dictionaries serialize
//! with the wire field names.

use serde::Serialize;

use chorus_protocol::types::{Direction, NodeId};

use crate::routing::DeviceList;
use crate::state::Snapshot;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct NodeInfo {
    pub is_input: bool,
    pub id: u64,
    pub device_name: String,
    #[serde(rename = "Type")]
    pub node_type: &'static str,
    pub name: String,
    pub active: bool,
    /// Microseconds since the epoch at the last plug.
    pub plugged_time: u64,
    pub node_volume: u64,
    pub node_capture_gain: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeState {
    pub volume: i32,
    pub mute: bool,
    pub capture_gain: i64,
    pub capture_mute: bool,
    pub user_mute: bool,
}

pub struct Controls<'a> {
    devices: &'a mut DeviceList,
    snapshot: &'a Snapshot,
}

impl<'a> Controls<'a> {
    pub fn new(devices: &'a mut DeviceList, snapshot: &'a Snapshot) -> Controls<'a> {
        Controls { devices, snapshot }
    }

    pub fn set_output_volume(&mut self, volume: i32) {
        self.snapshot.set_output_volume(volume.max(0) as u32);
    }

    pub fn set_output_node_volume(&mut self, node: NodeId, volume: i32) {
        if !self.devices.set_node_volume(node, volume.max(0) as u32) {
            log::warn!("volume for unknown node {node}");
        }
    }

    pub fn set_output_mute(&mut self, mute: bool) {
        self.snapshot.set_system_mute(mute);
    }

    pub fn set_output_user_mute(&mut self, mute: bool) {
        self.snapshot.set_user_mute(mute);
    }

    pub fn set_input_gain(&mut self, gain_dbm: i64) {
        self.snapshot.set_capture_gain(gain_dbm);
    }

    pub fn set_input_node_gain(&mut self, node: NodeId, gain_dbm: i64) {
        if !self.devices.set_node_gain(node, gain_dbm) {
            log::warn!("gain for unknown node {node}");
        }
    }

    pub fn set_input_mute(&mut self, mute: bool) {
        self.snapshot.set_capture_mute(mute);
    }

    pub fn get_volume_state(&self) -> VolumeState {
        VolumeState {
            volume: self.snapshot.output_volume() as i32,
            mute: self.snapshot.system_muted(),
            capture_gain: self.snapshot.capture_gain(),
            capture_mute: self.snapshot.capture_muted(),
            user_mute: self.snapshot.user_muted(),
        }
    }

    /// Every plugged node; unplugged ones are omitted.
    pub fn get_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes = Vec::new();
        for device in self.devices.devices() {
            let active_node = self.devices.active_node(device.direction);
            for node in &device.nodes {
                if !node.plugged {
                    continue;
                }
                nodes.push(NodeInfo {
                    is_input: device.direction.is_input(),
                    id: node.id.0,
                    device_name: device.name.clone(),
                    node_type: node.node_type.as_str(),
                    name: node.name.clone(),
                    active: active_node == Some(node.id),
                    plugged_time: node.plugged_time_us,
                    node_volume: u64::from(node.volume),
                    node_capture_gain: node.capture_gain,
                });
            }
        }
        nodes
    }

    pub fn set_active_output_node(&mut self, node: NodeId) {
        self.devices.select_node(Direction::OUTPUT, node);
    }

    pub fn set_active_input_node(&mut self, node: NodeId) {
        self.devices.select_node(Direction::INPUT, node);
    }

    pub fn get_number_of_active_streams(&self) -> i32 {
        self.snapshot.active_streams()
    }
}
