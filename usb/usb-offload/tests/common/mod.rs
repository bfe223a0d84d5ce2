#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use usb_offload::host::{
    EndpointInfo, EndpointType, InterrupterSetup, SocControl, Speed, Substream, Urb, UsbHost,
};
use usb_offload::ipc::{DspLink, MessageId, Scene};
use usb_offload::stream::{PcmFormat, StreamParams};
use usb_offload::xhci::{CommandCompletion, EndpointCommand, Ring, RingKind, TrbCompletionCode};
use usb_offload::{IpcError, OffloadConfig, OffloadDevice, RingError};

pub const AUDIO_SLOT: u8 = 1;
pub const PLAYBACK_EP: u8 = 1;
pub const CAPTURE_EP: u8 = 2;
pub const PLAYBACK_RING: u64 = 0x2000_0000;
pub const CAPTURE_RING: u64 = 0x2001_0000;

pub const HID_SLOT: u8 = 2;
pub const HID_IN_EP: u8 = 3;
pub const HID_OUT_EP: u8 = 4;
pub const HID_IN_RING: u64 = 0x3000_0000;
pub const HID_OUT_RING: u64 = 0x3001_0000;

pub struct MockHost {
    pub substreams: Mutex<HashMap<(u8, u8, u8), Substream>>,
    pub speeds: Mutex<HashMap<u8, Speed>>,
    pub rings: Mutex<HashMap<(u8, u8), Ring>>,
    pub commands: Mutex<Vec<EndpointCommand>>,
    /// Completion code for every command; `None` never completes.
    pub command_code: Mutex<Option<TrbCompletionCode>>,
    pub given_back: Mutex<Vec<Urb>>,
    pub interrupters: Mutex<Vec<InterrupterSetup>>,
    pub ehb_cleared: Mutex<Vec<u8>>,
    /// Panics inside the substream lookup, as a broken class driver would.
    pub panic_on_lookup: AtomicBool,
    /// Runs while an endpoint gets a new ring, before the ring table is locked.
    pub on_replace: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl MockHost {
    pub fn new(speed: Speed) -> Self {
        let host = Self {
            substreams: Mutex::new(HashMap::new()),
            speeds: Mutex::new(HashMap::new()),
            rings: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            command_code: Mutex::new(Some(TrbCompletionCode::Success)),
            given_back: Mutex::new(Vec::new()),
            interrupters: Mutex::new(Vec::new()),
            ehb_cleared: Mutex::new(Vec::new()),
            panic_on_lookup: AtomicBool::new(false),
            on_replace: Mutex::new(None),
        };
        host.speeds.lock().unwrap().insert(AUDIO_SLOT, speed);
        host.speeds.lock().unwrap().insert(HID_SLOT, Speed::Full);

        host.add_substream(0, PLAYBACK_EP, 0x01, PLAYBACK_RING);
        host.add_substream(1, CAPTURE_EP, 0x82, CAPTURE_RING);

        let mut rings = host.rings.lock().unwrap();
        rings.insert(
            (HID_SLOT, HID_IN_EP),
            Ring::native(1, 1, RingKind::Interrupt, 64, HID_IN_RING),
        );
        rings.insert(
            (HID_SLOT, HID_OUT_EP),
            Ring::native(1, 1, RingKind::Interrupt, 64, HID_OUT_RING),
        );
        drop(rings);
        host
    }

    fn add_substream(&self, direction: u8, index: u8, address: u8, ring: u64) {
        let data = EndpointInfo {
            address,
            index,
            endpoint_type: EndpointType::Isoch,
            max_packet: 192,
            interval: 1,
        };
        self.substreams.lock().unwrap().insert(
            (0, 0, direction),
            Substream {
                slot: AUDIO_SLOT,
                interface: 1 + direction,
                data: Some(data),
                sync: None,
                datainterval: 0,
                shutdown: false,
            },
        );
        self.rings.lock().unwrap().insert(
            (AUDIO_SLOT, index),
            Ring::native(2, 1, RingKind::Isoch, 192, ring),
        );
    }

    pub fn ring_info(&self, slot: u8, endpoint: u8) -> (u64, usize, bool) {
        let rings = self.rings.lock().unwrap();
        let ring = &rings[&(slot, endpoint)];
        (ring.first_phys(), ring.segment_count(), ring.is_native())
    }

    pub fn take_ring(&self, slot: u8, endpoint: u8) -> Option<Ring> {
        self.rings.lock().unwrap().remove(&(slot, endpoint))
    }

    pub fn given_back(&self) -> Vec<Urb> {
        self.given_back.lock().unwrap().clone()
    }
}

impl UsbHost for MockHost {
    fn find_substream(&self, card: u8, device: u8, direction: u8) -> Option<Substream> {
        if self.panic_on_lookup.load(Ordering::SeqCst) {
            panic!("substream table corrupted");
        }
        self.substreams
            .lock()
            .unwrap()
            .get(&(card, device, direction))
            .copied()
    }

    fn device_speed(&self, slot: u8) -> Option<Speed> {
        self.speeds.lock().unwrap().get(&slot).copied()
    }

    fn endpoint_descriptor(&self, slot: u8, endpoint: u8) -> Option<EndpointInfo> {
        self.substreams
            .lock()
            .unwrap()
            .values()
            .filter(|substream| substream.slot == slot)
            .filter_map(|substream| substream.data)
            .find(|data| data.index == endpoint)
    }

    fn with_transfer_ring(&self, slot: u8, endpoint: u8, f: &mut dyn FnMut(&mut Ring)) -> bool {
        match self.rings.lock().unwrap().get_mut(&(slot, endpoint)) {
            Some(ring) => {
                f(ring);
                true
            }
            None => false,
        }
    }

    fn replace_transfer_ring(&self, slot: u8, endpoint: u8, ring: Ring) -> Result<Ring, RingError> {
        if let Some(hook) = self.on_replace.lock().unwrap().as_ref() {
            hook();
        }
        let mut rings = self.rings.lock().unwrap();
        match rings.get_mut(&(slot, endpoint)) {
            Some(current) => Ok(std::mem::replace(current, ring)),
            None => Err(RingError::NoRing),
        }
    }

    fn submit_command(&self, command: EndpointCommand, completion: CommandCompletion) {
        self.commands.lock().unwrap().push(command);
        if let Some(code) = *self.command_code.lock().unwrap() {
            completion.complete(code);
        }
    }

    fn giveback_urb(&self, urb: Urb) {
        self.given_back.lock().unwrap().push(urb);
    }

    fn program_interrupter(&self, setup: InterrupterSetup) {
        self.interrupters.lock().unwrap().push(setup);
    }

    fn clear_event_handler_busy(&self, interrupter: u8) {
        self.ehb_cleared.lock().unwrap().push(interrupter);
    }
}

#[derive(Default)]
pub struct MockSoc {
    pub sram_on: AtomicBool,
    pub vcore: AtomicBool,
    pub pll_bypass: AtomicBool,
    pub smc_status: AtomicI32,
    pub smc_calls: Mutex<Vec<bool>>,
}

impl SocControl for MockSoc {
    fn sram_power(&self, on: bool) {
        self.sram_on.store(on, Ordering::SeqCst);
    }

    fn smc_call(&self, suspend: bool) -> i32 {
        self.smc_calls.lock().unwrap().push(suspend);
        self.smc_status.load(Ordering::SeqCst)
    }

    fn hold_vcore(&self, hold: bool) {
        self.vcore.store(hold, Ordering::SeqCst);
    }

    fn bypass_pll(&self, bypass: bool) {
        self.pll_bypass.store(bypass, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockDsp {
    pub status: AtomicI32,
    pub down: AtomicBool,
    pub sent: Mutex<Vec<(Scene, MessageId, Vec<u8>)>>,
}

impl MockDsp {
    pub fn count(&self, id: MessageId) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, sent, _)| *sent == id)
            .count()
    }

    pub fn scenes(&self, id: MessageId) -> Vec<Scene> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, sent, _)| *sent == id)
            .map(|(scene, _, _)| *scene)
            .collect()
    }

    pub fn last_payload(&self, id: MessageId) -> Option<serde_json::Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, sent, _)| *sent == id)
            .and_then(|(_, _, payload)| serde_json::from_slice(payload).ok())
    }
}

impl DspLink for MockDsp {
    fn transmit(
        &self,
        scene: Scene,
        id: MessageId,
        payload: &[u8],
        needs_ack: bool,
    ) -> Result<i32, IpcError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(IpcError::TransportDown);
        }
        self.sent.lock().unwrap().push((scene, id, payload.to_vec()));
        if needs_ack {
            Ok(self.status.load(Ordering::SeqCst))
        } else {
            Ok(0)
        }
    }
}

pub struct Fixture {
    pub host: Arc<MockHost>,
    pub soc: Arc<MockSoc>,
    pub dsp: Arc<MockDsp>,
    pub device: OffloadDevice,
}

pub fn fixture_with(config: OffloadConfig, speed: Speed) -> Fixture {
    let host = Arc::new(MockHost::new(speed));
    let soc = Arc::new(MockSoc::default());
    soc.sram_on.store(true, Ordering::SeqCst);
    let dsp = Arc::new(MockDsp::default());
    let device = OffloadDevice::new(config, host.clone(), soc.clone(), dsp.clone());
    Fixture {
        host,
        soc,
        dsp,
        device,
    }
}

pub fn fixture() -> Fixture {
    fixture_with(OffloadConfig::default(), Speed::High)
}

/// Connected with the DSP initialized.
pub fn ready_fixture() -> Fixture {
    let fixture = fixture();
    fixture.device.connect();
    fixture.device.init_adsp(true).unwrap();
    fixture
}

pub fn playback() -> StreamParams {
    StreamParams {
        enable: 1,
        bit_rate: 48000,
        bit_depth: 16,
        channels: 2,
        direction: 0,
        audio_format: PcmFormat::S16Le as u32,
        card: 0,
        device: 0,
        xhc_irq_period_ms: 4,
        xhc_urb_num: 4,
        pcm_size: 1536,
        dram_size: 4,
        dram_cnt: 2,
        service_interval: None,
    }
}

pub fn capture() -> StreamParams {
    StreamParams {
        direction: 1,
        ..playback()
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub fn wait_for<F: FnMut() -> bool>(mut condition: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(2) {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
