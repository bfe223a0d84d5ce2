//! Request/response messaging with the audio DSP.
//!
//! The DSP runs one task per scene: download (playback) and upload (capture).
//! Each scene is serialized on its own lock so that a slow acknowledgement on one
//! direction never stalls the other.
use std::sync::{Arc, Mutex};

use log::{debug, error, trace};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::IpcError;
use crate::host::{EndpointInfo, Speed};

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Scene {
    Download,
    Upload,
}

impl Scene {
    pub const ALL: [Scene; 2] = [Scene::Download, Scene::Upload];

    /// Scene serving a PCM direction (0 playback, 1 capture).
    pub fn for_direction(direction: u8) -> Scene {
        if direction == 0 {
            Scene::Download
        } else {
            Scene::Upload
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum MessageId {
    InitAdsp,
    EnableStream,
    Disconnect,
    HidStart,
    HidStop,
    HidNotify,
}

impl MessageId {
    pub fn needs_ack(self) -> bool {
        !matches!(self, MessageId::HidNotify)
    }
}

/// Raw link to the DSP, provided by the platform.
pub trait DspLink: Send + Sync {
    /// Delivers one message. With `needs_ack` the call blocks until the DSP
    /// answers and returns the application status it reported.
    fn transmit(
        &self,
        scene: Scene,
        id: MessageId,
        payload: &[u8],
        needs_ack: bool,
    ) -> Result<i32, IpcError>;
}

pub struct IpcTransport {
    link: Arc<dyn DspLink>,
    scenes: [Mutex<()>; 2],
}

impl IpcTransport {
    pub fn new(link: Arc<dyn DspLink>) -> Self {
        Self {
            link,
            scenes: [Mutex::new(()), Mutex::new(())],
        }
    }

    pub fn send<T: Serialize>(&self, scene: Scene, id: MessageId, payload: &T) -> Result<i32, IpcError> {
        let bytes = serde_json::to_vec(payload).map_err(|err| {
            error!("failed to encode {:?}: {}", id, err);
            IpcError::Encode
        })?;

        let _guard = self.scenes[scene.index()].lock().unwrap();
        trace!("{:?} -> {:?}, {} bytes", id, scene, bytes.len());

        if !id.needs_ack() {
            self.link.transmit(scene, id, &bytes, false)?;
            return Ok(0);
        }

        match self.link.transmit(scene, id, &bytes, true)? {
            0 => {
                debug!("{:?} on {:?} acknowledged", id, scene);
                Ok(0)
            }
            status => {
                error!("{:?} on {:?} rejected with status {}", id, scene, status);
                Err(IpcError::RemoteRejected(status))
            }
        }
    }

    /// Sends the same message to every scene in turn, stopping at the first failure.
    pub fn broadcast<T: Serialize>(&self, id: MessageId, payload: &T) -> Result<(), IpcError> {
        for &scene in Scene::ALL.iter() {
            self.send(scene, id, payload)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MemoryRegion {
    pub phys: u64,
    pub size: u64,
}

/// Sent with `InitAdsp`: where the shared memory and the offload event ring live.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AdspMemoryInfo {
    pub dram_region: MemoryRegion,
    pub sram_region: MemoryRegion,
    pub event_ring_addr: u64,
    pub erst_addr: u64,
    pub adv_lowpwr: bool,
    pub sram_version: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum StreamRequest {
    Start,
    Stop,
}

/// Payload of `EnableStream`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct StreamMessage {
    pub request: StreamRequest,
    pub direction: u8,
    pub card: u8,
    pub device: u8,
    pub slot: u8,
    pub speed: Option<Speed>,
    pub interrupter: u8,
    pub data_endpoint: Option<EndpointInfo>,
    pub sync_endpoint: Option<EndpointInfo>,
    pub transfer_ring: u64,
    pub bit_rate: u32,
    pub bit_depth: u32,
    pub channels: u32,
    pub pcm_size: u32,
    pub urb_start: u64,
    pub urb_size: u32,
    pub urb_num: u32,
    pub urb_packs: u32,
}

impl StreamMessage {
    pub fn stop(direction: u8) -> Self {
        Self {
            request: StreamRequest::Stop,
            direction,
            card: 0,
            device: 0,
            slot: 0,
            speed: None,
            interrupter: 0,
            data_endpoint: None,
            sync_endpoint: None,
            transfer_ring: 0,
            bit_rate: 0,
            bit_depth: 0,
            channels: 0,
            pcm_size: 0,
            urb_start: 0,
            urb_size: 0,
            urb_num: 0,
            urb_packs: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum HidDirection {
    In,
    Out,
}

impl HidDirection {
    pub const ALL: [HidDirection; 2] = [HidDirection::In, HidDirection::Out];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn scene(self) -> Scene {
        match self {
            HidDirection::In => Scene::Upload,
            HidDirection::Out => Scene::Download,
        }
    }
}

/// Payload of `HidStart` and `HidStop`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct HidMessage {
    pub direction: HidDirection,
    pub slot: u8,
    pub endpoint: u8,
    /// Ring position with the cycle state in bit 0.
    pub dequeue: u64,
    /// Ask the DSP to give the ring back and report where it stopped.
    pub release: bool,
}

/// Payload of `HidNotify`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct HidNotify {
    pub direction: HidDirection,
    pub pending: usize,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DspEvent {
    /// The DSP stopped, either on request or because of an exception.
    Stop,
    Ready,
}

/// Messages originated by the DSP.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum DspMessage {
    HidPayload {
        direction: HidDirection,
        data: SmallVec<[u8; 64]>,
        status: i32,
        /// DSP dequeue position with the cycle state in bit 0.
        dequeue: u64,
        last: bool,
    },
    HidReleased {
        direction: HidDirection,
        dequeue: u64,
    },
    Event(DspEvent),
}

impl DspMessage {
    pub fn decode(bytes: &[u8]) -> Result<Self, IpcError> {
        serde_json::from_slice(bytes).map_err(|err| {
            error!("failed to decode DSP message: {}", err);
            IpcError::Encode
        })
    }
}
