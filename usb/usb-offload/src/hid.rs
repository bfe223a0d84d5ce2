//! Hands a USB HID interrupt endpoint pair back and forth between the host
//! controller driver and the DSP.
//!
//! While an endpoint is offloaded the DSP owns its transfer ring. URBs the class
//! driver submits are held back and completed from payloads the DSP reports. When
//! the DSP is done the endpoint is stopped, the software enqueue pointer is moved to
//! where the DSP left the ring, and the endpoint goes back to the controller.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{debug, error, info, trace, warn};
use smallvec::SmallVec;

use crate::config::OffloadConfig;
use crate::error::RingError;
use crate::host::{Urb, UrbStatus, UsbHost};
use crate::ipc::{HidDirection, HidMessage, HidNotify, IpcTransport, MessageId};
use crate::timeout::Timeout;
use crate::xhci::{issue_command, EndpointCommand};

bitflags::bitflags! {
    pub struct HidFlags: u8 {
        /// The DSP owns the endpoint.
        const NEED_OFFLOAD = 1 << 0;
        /// The DSP is still producing payloads.
        const DSP_RUNNING = 1 << 1;
        /// URBs are held back waiting for a payload.
        const AP_QUEUED = 1 << 2;
        const DSP_ABNORMAL = 1 << 3;
        const RING_RESETTING = 1 << 4;
    }
}

/// What the controller driver should do with a submitted URB.
#[derive(Debug, PartialEq)]
pub enum UrbDisposition {
    Queue(Urb),
    Intercepted,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HidPayload {
    pub data: SmallVec<[u8; 64]>,
    pub status: i32,
}

struct EndpointState {
    slot: Option<u8>,
    endpoint: u8,
    flags: HidFlags,
    fifo: VecDeque<HidPayload>,
    waiting: VecDeque<Urb>,
    /// Last ring position the DSP reported, cycle state in bit 0.
    dsp_dequeue: Option<u64>,
    /// Position reported when the DSP gave the ring back on request.
    released: Option<u64>,
}

impl EndpointState {
    fn new() -> Self {
        Self {
            slot: None,
            endpoint: 0,
            flags: HidFlags::empty(),
            fifo: VecDeque::new(),
            waiting: VecDeque::new(),
            dsp_dequeue: None,
            released: None,
        }
    }

    fn matches(&self, slot: u8, endpoint: u8) -> bool {
        self.slot == Some(slot) && self.endpoint == endpoint
    }

    fn is_done(&self) -> bool {
        self.flags.contains(HidFlags::NEED_OFFLOAD)
            && !self.flags.contains(HidFlags::DSP_RUNNING)
            && self.fifo.is_empty()
    }
}

struct HidEndpoint {
    direction: HidDirection,
    state: Mutex<EndpointState>,
    released: Condvar,
    /// Serializes deferred completion and ring resets; may be held across IPC.
    ring: Mutex<()>,
    /// Set while a deferred completion is queued for this endpoint.
    mailbox: AtomicBool,
}

pub struct HidCoordinator {
    endpoints: [HidEndpoint; 2],
    host: Arc<dyn UsbHost>,
    ipc: Arc<IpcTransport>,
    requests: Sender<HidDirection>,
    command_timeout: Duration,
    release_timeout: Duration,
    max_payload: usize,
    fifo_depth: usize,
}

struct HidWorker {
    coordinator: Weak<HidCoordinator>,
    requests: Receiver<HidDirection>,
}

impl HidWorker {
    fn run(self) {
        debug!("HID worker started");
        // Ends once the coordinator, and with it the sender, is dropped.
        while let Ok(direction) = self.requests.recv() {
            let coordinator = match self.coordinator.upgrade() {
                Some(coordinator) => coordinator,
                None => break,
            };
            trace!("deferred completion for {:?}", direction);
            coordinator.endpoint(direction).mailbox.store(false, Ordering::SeqCst);
            coordinator.complete_deferred(direction);
        }
        debug!("HID worker stopped");
    }
}

impl HidCoordinator {
    pub fn new(
        config: &OffloadConfig,
        host: Arc<dyn UsbHost>,
        ipc: Arc<IpcTransport>,
    ) -> Arc<Self> {
        let (sender, receiver) = crossbeam_channel::bounded(HidDirection::ALL.len());
        let endpoint = |direction| HidEndpoint {
            direction,
            state: Mutex::new(EndpointState::new()),
            released: Condvar::new(),
            ring: Mutex::new(()),
            mailbox: AtomicBool::new(false),
        };

        let coordinator = Arc::new(Self {
            endpoints: [endpoint(HidDirection::In), endpoint(HidDirection::Out)],
            host,
            ipc,
            requests: sender,
            command_timeout: config.command_timeout(),
            release_timeout: config.dsp_release_timeout(),
            max_payload: config.hid.max_payload,
            fifo_depth: config.hid.fifo_depth.max(1),
        });

        let worker = HidWorker {
            coordinator: Arc::downgrade(&coordinator),
            requests: receiver,
        };
        if let Err(err) = thread::Builder::new()
            .name("usb-offload-hid".into())
            .spawn(move || worker.run())
        {
            error!("failed to spawn HID worker: {}", err);
        }
        coordinator
    }

    fn endpoint(&self, direction: HidDirection) -> &HidEndpoint {
        &self.endpoints[direction.index()]
    }

    pub fn flags(&self, direction: HidDirection) -> HidFlags {
        self.endpoint(direction).state.lock().unwrap().flags
    }

    pub fn is_offloaded(&self, direction: HidDirection) -> bool {
        self.flags(direction).contains(HidFlags::NEED_OFFLOAD)
    }

    pub fn queued_payloads(&self, direction: HidDirection) -> usize {
        self.endpoint(direction).state.lock().unwrap().fifo.len()
    }

    pub fn attach(&self, direction: HidDirection, slot: u8, endpoint: u8) {
        let detached = {
            let mut state = self.endpoint(direction).state.lock().unwrap();
            let detached = if state.slot.is_some() && !state.matches(slot, endpoint) {
                Self::clear(&mut state)
            } else {
                Vec::new()
            };
            state.slot = Some(slot);
            state.endpoint = endpoint;
            detached
        };
        self.give_back_denied(detached);
        info!("HID {:?} attached to slot {} ep {}", direction, slot, endpoint);
    }

    /// Forgets the endpoint without touching the hardware, which may already be
    /// gone. Held URBs complete with `PermissionDenied`.
    pub fn detach(&self, direction: HidDirection) {
        let endpoint = self.endpoint(direction);
        let _ring = endpoint.ring.lock().unwrap();
        let urbs = {
            let mut state = endpoint.state.lock().unwrap();
            let urbs = Self::clear(&mut state);
            state.slot = None;
            urbs
        };
        self.give_back_denied(urbs);
        debug!("HID {:?} detached", direction);
    }

    fn clear(state: &mut EndpointState) -> Vec<Urb> {
        state.flags = HidFlags::empty();
        state.fifo.clear();
        state.dsp_dequeue = None;
        state.released = None;
        state.waiting.drain(..).collect()
    }

    fn give_back_denied(&self, urbs: Vec<Urb>) {
        for mut urb in urbs {
            warn!("force completing urb {} on slot {} ep {}", urb.id, urb.slot, urb.endpoint);
            urb.actual_length = 0;
            urb.status = UrbStatus::PermissionDenied;
            self.host.giveback_urb(urb);
        }
    }

    fn schedule(&self, direction: HidDirection) {
        let endpoint = self.endpoint(direction);
        if endpoint.mailbox.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.requests.try_send(direction) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                endpoint.mailbox.store(false, Ordering::SeqCst);
                error!("failed to schedule deferred completion for {:?}", direction);
            }
        }
    }

    /// Decides whether a URB submitted on an offloaded endpoint goes to the
    /// hardware. Never blocks.
    pub fn skip_urb(&self, urb: Urb) -> UrbDisposition {
        for endpoint in self.endpoints.iter() {
            let mut state = endpoint.state.lock().unwrap();
            if !state.matches(urb.slot, urb.endpoint) {
                continue;
            }
            if !state.flags.contains(HidFlags::NEED_OFFLOAD) {
                return UrbDisposition::Queue(urb);
            }
            if state.fifo.is_empty()
                && !state.flags.intersects(HidFlags::DSP_RUNNING | HidFlags::RING_RESETTING)
            {
                // First request after a hand-off primes the ring.
                return UrbDisposition::Queue(urb);
            }

            trace!("intercepted urb {} on {:?}", urb.id, endpoint.direction);
            state.waiting.push_back(urb);
            state.flags.insert(HidFlags::AP_QUEUED);
            let ready = !state.fifo.is_empty();
            drop(state);

            if ready {
                self.schedule(endpoint.direction);
            }
            return UrbDisposition::Intercepted;
        }
        UrbDisposition::Queue(urb)
    }

    /// Queues one payload reported by the DSP. Never blocks.
    pub fn on_dsp_payload(
        &self,
        direction: HidDirection,
        data: &[u8],
        status: i32,
        dequeue: u64,
        last: bool,
    ) {
        let endpoint = self.endpoint(direction);
        let waiting = {
            let mut state = endpoint.state.lock().unwrap();
            if !state.flags.contains(HidFlags::NEED_OFFLOAD) {
                warn!("{:?} payload while not offloaded", direction);
                return;
            }
            state.dsp_dequeue = Some(dequeue);
            if state.fifo.len() >= self.fifo_depth {
                warn!("{:?} payload fifo full, dropping oldest", direction);
                state.fifo.pop_front();
            }

            let len = data.len().min(self.max_payload);
            state.fifo.push_back(HidPayload {
                data: SmallVec::from_slice(&data[..len]),
                status,
            });
            if last {
                state.flags.remove(HidFlags::DSP_RUNNING);
            }
            !state.waiting.is_empty()
        };

        if waiting {
            self.schedule(direction);
        }
    }

    pub fn on_dsp_released(&self, direction: HidDirection, dequeue: u64) {
        let endpoint = self.endpoint(direction);
        let mut state = endpoint.state.lock().unwrap();
        state.released = Some(dequeue);
        state.dsp_dequeue = Some(dequeue);
        endpoint.released.notify_all();
    }

    /// Completes held URBs from queued payloads, then gives the endpoint back once
    /// the DSP has nothing left to deliver.
    pub fn complete_deferred(&self, direction: HidDirection) {
        let endpoint = self.endpoint(direction);
        let _ring = endpoint.ring.lock().unwrap();

        loop {
            let (mut urb, payload) = {
                let mut state = endpoint.state.lock().unwrap();
                if state.fifo.is_empty() || state.waiting.is_empty() {
                    break;
                }
                let payload = state.fifo.pop_front();
                let urb = state.waiting.pop_front();
                if state.waiting.is_empty() {
                    state.flags.remove(HidFlags::AP_QUEUED);
                }
                match (urb, payload) {
                    (Some(urb), Some(payload)) => (urb, payload),
                    _ => break,
                }
            };

            let len = payload.data.len().min(urb.buffer.len());
            urb.buffer[..len].copy_from_slice(&payload.data[..len]);
            urb.actual_length = len;
            urb.status = match payload.status {
                0 => UrbStatus::Success,
                status => UrbStatus::Error(status),
            };
            trace!("completing urb {} with {} bytes", urb.id, len);
            self.host.giveback_urb(urb);
        }

        let (done, pending) = {
            let state = endpoint.state.lock().unwrap();
            (state.is_done(), state.waiting.len())
        };
        if done {
            self.give_back_endpoint(endpoint);
        } else if pending > 0 {
            let notify = HidNotify { direction, pending };
            if let Err(err) = self.ipc.send(direction.scene(), MessageId::HidNotify, &notify) {
                debug!("{:?} notify failed: {}", direction, err);
            }
        }
    }

    /// Stops the endpoint, points the ring at where the DSP stopped and clears the
    /// offload state. Called with the ring lock held.
    fn give_back_endpoint(&self, endpoint: &HidEndpoint) {
        let (slot, index, position) = {
            let state = endpoint.state.lock().unwrap();
            let position = if state.flags.contains(HidFlags::DSP_ABNORMAL) {
                None
            } else {
                state.dsp_dequeue
            };
            match state.slot {
                Some(slot) => (slot, state.endpoint, position),
                None => return,
            }
        };

        self.stop_endpoint(slot, index);
        self.restore_ring(slot, index, position);

        let urbs = {
            let mut state = endpoint.state.lock().unwrap();
            Self::clear(&mut state)
        };
        self.give_back_denied(urbs);
        info!("HID {:?} back with the host", endpoint.direction);
    }

    fn stop_endpoint(&self, slot: u8, endpoint: u8) {
        let command = EndpointCommand::StopEndpoint {
            slot,
            endpoint,
            suspend: false,
        };
        match issue_command(&*self.host, command, self.command_timeout) {
            Ok(()) => (),
            Err(RingError::CommandTimeout) => {
                warn!("slot {} ep {}: stop endpoint timed out", slot, endpoint)
            }
            Err(err) => error!("slot {} ep {}: stop endpoint failed: {}", slot, endpoint, err),
        }
    }

    /// Moves the software enqueue pointer to `position`, or reinitializes the ring
    /// when there is no usable position, then points the controller at it.
    fn restore_ring(&self, slot: u8, endpoint: u8, position: Option<u64>) {
        let mut pointer = None;
        let found = self.host.with_transfer_ring(slot, endpoint, &mut |ring| {
            let relocated = match position {
                Some(position) => match ring.relocate_enqueue(position) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!("slot {} ep {}: {}, resetting ring", slot, endpoint, err);
                        false
                    }
                },
                None => false,
            };
            if !relocated {
                ring.reinitialize(1);
            }
            pointer = Some(ring.register());
        });
        let pointer = match (found, pointer) {
            (true, Some(pointer)) => pointer,
            _ => {
                error!("slot {} ep {}: {}", slot, endpoint, RingError::NoRing);
                return;
            }
        };

        let command = EndpointCommand::SetTrDequeue {
            slot,
            endpoint,
            pointer,
        };
        match issue_command(&*self.host, command, self.command_timeout) {
            Ok(()) => debug!("slot {} ep {}: dequeue at {:#x}", slot, endpoint, pointer),
            // The next completed transfer moves the dequeue pointer anyway.
            Err(RingError::CommandTimeout) => {
                warn!("slot {} ep {}: set dequeue timed out", slot, endpoint)
            }
            Err(err) => error!("slot {} ep {}: set dequeue failed: {}", slot, endpoint, err),
        }
    }

    /// Takes the endpoint back from the DSP regardless of its state. With
    /// `request_release` the DSP is asked where it stopped and given a bounded
    /// time to answer.
    pub fn reset_ring(&self, direction: HidDirection, request_release: bool) {
        let endpoint = self.endpoint(direction);
        let _ring = endpoint.ring.lock().unwrap();

        let (slot, index, offloaded) = {
            let mut state = endpoint.state.lock().unwrap();
            let slot = match state.slot {
                Some(slot) => slot,
                None => return,
            };
            state.flags.insert(HidFlags::RING_RESETTING);
            state.released = None;
            (slot, state.endpoint, state.flags.contains(HidFlags::NEED_OFFLOAD))
        };
        info!("HID {:?} ring reset", direction);

        self.stop_endpoint(slot, index);

        let position = if request_release && offloaded {
            let message = HidMessage {
                direction,
                slot,
                endpoint: index,
                dequeue: 0,
                release: true,
            };
            match self.ipc.send(direction.scene(), MessageId::HidStop, &message) {
                Ok(_) => self.wait_released(endpoint),
                Err(err) => {
                    error!("{:?} release request failed: {}", direction, err);
                    None
                }
            }
        } else {
            let state = endpoint.state.lock().unwrap();
            if state.flags.contains(HidFlags::DSP_ABNORMAL) {
                None
            } else {
                state.dsp_dequeue
            }
        };
        self.restore_ring(slot, index, position);

        let urbs = {
            let mut state = endpoint.state.lock().unwrap();
            Self::clear(&mut state)
        };
        self.give_back_denied(urbs);
    }

    fn wait_released(&self, endpoint: &HidEndpoint) -> Option<u64> {
        let timeout = Timeout::new(self.release_timeout);
        let mut state = endpoint.state.lock().unwrap();
        loop {
            if let Some(position) = state.released {
                return Some(position);
            }
            if timeout.expired() {
                warn!("{:?}: DSP did not release the ring", endpoint.direction);
                return None;
            }
            state = endpoint
                .released
                .wait_timeout(state, timeout.remaining())
                .unwrap()
                .0;
        }
    }

    /// Hands every attached endpoint to the DSP.
    pub fn start_offload(&self) {
        for endpoint in self.endpoints.iter() {
            let direction = endpoint.direction;
            let _ring = endpoint.ring.lock().unwrap();
            let (slot, index) = {
                let state = endpoint.state.lock().unwrap();
                match state.slot {
                    Some(slot) if !state.flags.contains(HidFlags::NEED_OFFLOAD) => {
                        (slot, state.endpoint)
                    }
                    _ => continue,
                }
            };

            self.stop_endpoint(slot, index);
            let mut dequeue = None;
            self.host
                .with_transfer_ring(slot, index, &mut |ring| dequeue = Some(ring.register()));
            let dequeue = match dequeue {
                Some(dequeue) => dequeue,
                None => {
                    error!("HID {:?}: {}", direction, RingError::NoRing);
                    continue;
                }
            };

            let message = HidMessage {
                direction,
                slot,
                endpoint: index,
                dequeue,
                release: false,
            };
            let result = self.ipc.send(direction.scene(), MessageId::HidStart, &message);

            let mut state = endpoint.state.lock().unwrap();
            match result {
                Ok(_) => {
                    state.flags.remove(HidFlags::DSP_ABNORMAL);
                    state.flags.insert(HidFlags::NEED_OFFLOAD | HidFlags::DSP_RUNNING);
                    state.dsp_dequeue = Some(dequeue);
                    info!("HID {:?} offloaded at {:#x}", direction, dequeue);
                }
                Err(err) => {
                    state.flags.insert(HidFlags::DSP_ABNORMAL);
                    error!("HID {:?} start failed: {}", direction, err);
                }
            }
        }
    }

    /// Asks the DSP to stop producing. Endpoints with nothing left to deliver go
    /// back to the host right away, the rest once their payloads are consumed.
    pub fn finish_offload(&self) {
        for endpoint in self.endpoints.iter() {
            let direction = endpoint.direction;
            let message = {
                let state = endpoint.state.lock().unwrap();
                match state.slot {
                    Some(slot) if state.flags.contains(HidFlags::NEED_OFFLOAD) => HidMessage {
                        direction,
                        slot,
                        endpoint: state.endpoint,
                        dequeue: 0,
                        release: false,
                    },
                    _ => continue,
                }
            };

            if let Err(err) = self.ipc.send(direction.scene(), MessageId::HidStop, &message) {
                error!("HID {:?} stop failed: {}", direction, err);
            }

            let idle = {
                let mut state = endpoint.state.lock().unwrap();
                state.flags.remove(HidFlags::DSP_RUNNING);
                state.fifo.is_empty() && state.waiting.is_empty()
            };
            if idle {
                let _ring = endpoint.ring.lock().unwrap();
                self.give_back_endpoint(endpoint);
            } else {
                self.schedule(direction);
            }
        }
    }

    /// The DSP stopped unexpectedly; nothing it reported can be trusted and no more
    /// payloads will arrive.
    pub fn mark_abnormal(&self) {
        for endpoint in self.endpoints.iter() {
            let offloaded = {
                let mut state = endpoint.state.lock().unwrap();
                state.flags.insert(HidFlags::DSP_ABNORMAL);
                state.flags.remove(HidFlags::DSP_RUNNING);
                state.flags.contains(HidFlags::NEED_OFFLOAD)
            };
            if offloaded {
                self.schedule(endpoint.direction);
            }
        }
    }
}
