//! Collaborators the offload engine drives but does not own: the USB host stack
//! (audio class driver and XHCI controller driver) and the SoC platform.
use serde::Serialize;
use smallvec::SmallVec;

use crate::error::RingError;
use crate::xhci::{EndpointCommand, CommandCompletion, Ring};

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Speed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl Speed {
    pub fn is_full_or_slower(self) -> bool {
        self <= Speed::Full
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum EndpointType {
    Control,
    Isoch,
    Bulk,
    Interrupt,
}

/// The endpoint descriptor fields the DSP needs, plus the controller's index.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct EndpointInfo {
    /// bEndpointAddress, bit 7 set for IN.
    pub address: u8,
    /// Endpoint context index in the device context (DCI - 1).
    pub index: u8,
    pub endpoint_type: EndpointType,
    pub max_packet: u16,
    pub interval: u8,
}

impl EndpointInfo {
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }
}

/// A PCM substream of the USB audio class driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Substream {
    pub slot: u8,
    pub interface: u8,
    pub data: Option<EndpointInfo>,
    pub sync: Option<EndpointInfo>,
    /// Log2 of the packet interval in (micro)frames, as negotiated by the class
    /// driver.
    pub datainterval: u8,
    pub shutdown: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UrbStatus {
    Success,
    Pending,
    /// Completed without data because the endpoint was reset underneath it.
    PermissionDenied,
    Error(i32),
}

/// A USB request block submitted by a class driver.
#[derive(Clone, Debug, PartialEq)]
pub struct Urb {
    pub id: u64,
    pub slot: u8,
    pub endpoint: u8,
    pub buffer: SmallVec<[u8; 64]>,
    pub actual_length: usize,
    pub status: UrbStatus,
}

impl Urb {
    pub fn new(id: u64, slot: u8, endpoint: u8, length: usize) -> Self {
        let mut buffer = SmallVec::new();
        buffer.resize(length, 0);
        Self {
            id,
            slot,
            endpoint,
            buffer,
            actual_length: 0,
            status: UrbStatus::Pending,
        }
    }
}

/// Register values for a secondary interrupter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InterrupterSetup {
    pub interrupter: u8,
    pub erst_size: u16,
    pub erst_base: u64,
    pub erdp: u64,
}

/// What the offload control node is told about an attached USB device.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceInfo {
    pub vendor: u16,
    pub product: u16,
    pub is_audio: bool,
    /// Endpoint count of every audio streaming alternate setting.
    pub streaming_endpoints: Vec<u8>,
}

pub trait UsbHost: Send + Sync {
    fn find_substream(&self, card: u8, device: u8, direction: u8) -> Option<Substream>;

    fn device_speed(&self, slot: u8) -> Option<Speed>;

    fn endpoint_descriptor(&self, slot: u8, endpoint: u8) -> Option<EndpointInfo>;

    /// Runs `f` against the transfer ring of an endpoint. Returns false when the
    /// endpoint has no ring.
    fn with_transfer_ring(&self, slot: u8, endpoint: u8, f: &mut dyn FnMut(&mut Ring)) -> bool;

    /// Swaps the transfer ring of a configured endpoint and hands back the old one.
    fn replace_transfer_ring(&self, slot: u8, endpoint: u8, ring: Ring) -> Result<Ring, RingError>;

    /// Queues an endpoint command. The host signals `completion` when the
    /// command completion event arrives.
    fn submit_command(&self, command: EndpointCommand, completion: CommandCompletion);

    fn giveback_urb(&self, urb: Urb);

    fn program_interrupter(&self, setup: InterrupterSetup);

    /// Clears the Event Handler Busy bit of an interrupter.
    fn clear_event_handler_busy(&self, interrupter: u8);
}

pub trait SocControl: Send + Sync {
    fn sram_power(&self, on: bool);

    /// Secure monitor call announcing system suspend (`true`) or resume.
    fn smc_call(&self, suspend: bool) -> i32;

    fn hold_vcore(&self, hold: bool);

    fn bypass_pll(&self, bypass: bool);
}
