//! Process-wide state snapshot. Scalar state lives in atomics so device
//! workers can read volume and mute on the mix path without touching any
//! lock the main thread holds; writes happen on the main thread only.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

use chorus_core::ring::VOLUME_UNITY;
use chorus_protocol::types::NodeId;

pub const MAX_VOLUME: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Change {
    OutputVolume(u32),
    OutputMute(bool),
    InputGain(i64),
    InputMute(bool),
    Nodes,
    ActiveOutputNode(NodeId),
    ActiveInputNode(NodeId),
    OutputNodeVolume(NodeId, u32),
    InputNodeGain(NodeId, i64),
    ActiveStreams(i32),
}

pub type Observer = Box<dyn Fn(&Change) + Send>;

pub struct Snapshot {
    volume: AtomicU32,
    system_mute: AtomicBool,
    user_mute: AtomicBool,
    capture_gain: AtomicI64,
    capture_mute: AtomicBool,
    active_streams: AtomicI32,
    observers: Mutex<Vec<Observer>>,
}

impl Snapshot {
    pub fn new() -> Snapshot {
        Snapshot {
            volume: AtomicU32::new(MAX_VOLUME),
            system_mute: AtomicBool::new(false),
            user_mute: AtomicBool::new(false),
            capture_gain: AtomicI64::new(0),
            capture_mute: AtomicBool::new(false),
            active_streams: AtomicI32::new(0),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register a typed change callback. Observers run synchronously with
    /// the writer and must not call back into the snapshot; follow-up work
    /// goes through the main mailbox.
    pub fn observe(&self, observer: impl Fn(&Change) + Send + 'static) {
        self.observers.lock().unwrap().push(Box::new(observer));
    }

    pub fn notify(&self, change: Change) {
        for observer in self.observers.lock().unwrap().iter() {
            observer(&change);
        }
    }

    pub fn set_output_volume(&self, volume: u32) {
        let volume = volume.min(MAX_VOLUME);
        self.volume.store(volume, Ordering::Relaxed);
        self.notify(Change::OutputVolume(volume));
    }

    pub fn output_volume(&self) -> u32 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn set_system_mute(&self, mute: bool) {
        self.system_mute.store(mute, Ordering::Relaxed);
        self.notify(Change::OutputMute(self.output_muted()));
    }

    pub fn set_user_mute(&self, mute: bool) {
        self.user_mute.store(mute, Ordering::Relaxed);
        self.notify(Change::OutputMute(self.output_muted()));
    }

    pub fn system_muted(&self) -> bool {
        self.system_mute.load(Ordering::Relaxed)
    }

    pub fn user_muted(&self) -> bool {
        self.user_mute.load(Ordering::Relaxed)
    }

    /// Mute as the mixer sees it: either source silences output.
    pub fn output_muted(&self) -> bool {
        self.system_muted() || self.user_muted()
    }

    /// System volume as a Q15 scaler for the mix path.
    pub fn volume_scaler(&self) -> i32 {
        (self.output_volume() as i64 * i64::from(VOLUME_UNITY) / i64::from(MAX_VOLUME)) as i32
    }

    pub fn set_capture_gain(&self, gain_dbm: i64) {
        self.capture_gain.store(gain_dbm, Ordering::Relaxed);
        self.notify(Change::InputGain(gain_dbm));
    }

    pub fn capture_gain(&self) -> i64 {
        self.capture_gain.load(Ordering::Relaxed)
    }

    pub fn set_capture_mute(&self, mute: bool) {
        self.capture_mute.store(mute, Ordering::Relaxed);
        self.notify(Change::InputMute(mute));
    }

    pub fn capture_muted(&self) -> bool {
        self.capture_mute.load(Ordering::Relaxed)
    }

    pub fn set_active_streams(&self, count: i32) {
        self.active_streams.store(count, Ordering::Relaxed);
        self.notify(Change::ActiveStreams(count));
    }

    pub fn active_streams(&self) -> i32 {
        self.active_streams.load(Ordering::Relaxed)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}
