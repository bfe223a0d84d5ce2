use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info, warn};

use crate::config::{OffloadConfig, ReservationModel};
use crate::error::{IpcError, OffloadError};
use crate::hid::{HidCoordinator, UrbDisposition};
use crate::host::{DeviceInfo, SocControl, Urb, UsbHost};
use crate::ipc::{
    AdspMemoryInfo, DspEvent, DspLink, DspMessage, HidDirection, IpcTransport, MemoryRegion,
    MessageId,
};
use crate::memory::{BufferHandle, MemoryClass, RegionAllocator};
use crate::stream::{StreamContext, StreamParams, StreamState, StreamTable};
use crate::xhci::{EventRing, EventRingState};

/// Power mode the USB device controller may enter while offload is running.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OffloadMode {
    None,
    Dram,
    Sram,
}

#[derive(Clone, Copy, Debug, Default)]
struct DeviceFlags {
    connected: bool,
    opened: bool,
    adsp_inited: bool,
    adsp_exception: bool,
    adsp_ready: bool,
}

/// All offload state of one host controller.
pub struct OffloadDevice {
    pub(crate) config: OffloadConfig,
    pub(crate) allocator: Mutex<RegionAllocator>,
    pub(crate) event_ring: Mutex<Option<EventRing>>,
    /// Also serializes DSP initialization against stream transitions.
    streams: Mutex<StreamTable>,
    /// Mirrors `StreamTable::any_active` for hooks the host calls while a stream
    /// transition holds the table.
    pub(crate) streaming: AtomicBool,
    flags: Mutex<DeviceFlags>,
    pub(crate) dcbaa: Mutex<Option<BufferHandle>>,
    hid: Arc<HidCoordinator>,
    ipc: Arc<IpcTransport>,
    pub(crate) host: Arc<dyn UsbHost>,
    pub(crate) soc: Arc<dyn SocControl>,
}

impl OffloadDevice {
    pub fn new(
        config: OffloadConfig,
        host: Arc<dyn UsbHost>,
        soc: Arc<dyn SocControl>,
        link: Arc<dyn DspLink>,
    ) -> Self {
        let ipc = Arc::new(IpcTransport::new(link));
        let hid = HidCoordinator::new(&config, host.clone(), ipc.clone());
        let allocator = RegionAllocator::new(&config);
        info!(
            "usb offload: sram v{}, adv_lowpwr:{} dl_only:{} smc:{}",
            config.sram_version.version(),
            config.adv_lowpwr,
            config.adv_lowpwr_dl_only,
            config.smc_ctrl
        );

        Self {
            config,
            allocator: Mutex::new(allocator),
            event_ring: Mutex::new(None),
            streams: Mutex::new(StreamTable::new()),
            streaming: AtomicBool::new(false),
            flags: Mutex::new(DeviceFlags::default()),
            dcbaa: Mutex::new(None),
            hid,
            ipc,
            host,
            soc,
        }
    }

    fn stream_context(&self) -> StreamContext<'_> {
        StreamContext {
            config: &self.config,
            allocator: &self.allocator,
            event_ring: &self.event_ring,
            host: &*self.host,
            soc: &*self.soc,
            ipc: &self.ipc,
        }
    }

    /// Locks the stream table. A transition that panicked is settled instead of
    /// taking every later caller down with it.
    pub(crate) fn streams(&self) -> MutexGuard<'_, StreamTable> {
        self.streams.lock().unwrap_or_else(|poisoned| {
            error!("stream table poisoned");
            let mut streams = poisoned.into_inner();
            streams.abandon_transitions();
            streams
        })
    }

    fn publish_streaming(&self, streams: &StreamTable) {
        self.streaming.store(streams.any_active(), Ordering::SeqCst);
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    pub fn hid(&self) -> &Arc<HidCoordinator> {
        &self.hid
    }

    pub fn allocator(&self) -> MutexGuard<'_, RegionAllocator> {
        self.allocator.lock().unwrap()
    }

    pub fn event_ring_state(&self) -> Option<EventRingState> {
        self.event_ring.lock().unwrap().as_ref().map(EventRing::state)
    }

    pub fn stream_state(&self, direction: u8) -> StreamState {
        self.streams().state(direction)
    }

    pub fn is_connected(&self) -> bool {
        self.flags.lock().unwrap().connected
    }

    pub fn is_opened(&self) -> bool {
        self.flags.lock().unwrap().opened
    }

    pub fn is_adsp_inited(&self) -> bool {
        self.flags.lock().unwrap().adsp_inited
    }

    pub fn is_adsp_ready(&self) -> bool {
        self.flags.lock().unwrap().adsp_ready
    }

    pub fn has_adsp_exception(&self) -> bool {
        self.flags.lock().unwrap().adsp_exception
    }

    /// Sets up the offload interrupter and tells the DSP where shared memory lives,
    /// or tears that down again.
    pub fn init_adsp(&self, enable: bool) -> Result<AdspMemoryInfo, OffloadError> {
        let mut streams = self.streams();
        let inited = self.flags.lock().unwrap().adsp_inited;
        info!("init adsp: {}", enable);
        if enable && inited {
            error!("adsp already initialized");
            return Err(OffloadError::AlreadyInitialized);
        }
        if !enable && !inited {
            error!("adsp already deinitialized");
            return Err(OffloadError::NotInitialized);
        }

        let info = if enable {
            self.setup_event_ring()?
        } else {
            AdspMemoryInfo {
                sram_version: self.config.sram_version.version(),
                ..AdspMemoryInfo::default()
            }
        };

        {
            let flags = self.flags.lock().unwrap();
            info!(
                "adsp_exception:{}, adsp_ready:{}",
                flags.adsp_exception, flags.adsp_ready
            );
        }
        let result = self.ipc.broadcast(MessageId::InitAdsp, &info);
        self.allocator.lock().unwrap().dump();

        match result {
            Ok(()) if enable => {
                self.flags.lock().unwrap().adsp_inited = true;
                if self.config.sram_version == ReservationModel::V3 {
                    let mut event_ring = self.event_ring.lock().unwrap();
                    if let Some(event_ring) = event_ring.as_mut() {
                        let mut allocator = self.allocator.lock().unwrap();
                        if let Err(err) = event_ring.power_down(&mut allocator, &*self.soc) {
                            error!("failed to back up interrupter: {}", err);
                        }
                    }
                }
                Ok(info)
            }
            _ => {
                self.flags.lock().unwrap().adsp_inited = false;
                streams.teardown(&self.stream_context());
                self.publish_streaming(&streams);
                self.free_event_ring();
                self.soc.bypass_pll(false);
                result.map(|()| info).map_err(OffloadError::from)
            }
        }
    }

    fn setup_event_ring(&self) -> Result<AdspMemoryInfo, OffloadError> {
        let mut event_ring = self.event_ring.lock().unwrap();
        let mut allocator = self.allocator.lock().unwrap();
        if let Some(stale) = event_ring.take() {
            warn!("freeing stale event ring");
            stale.free(&mut allocator);
        }

        if self.config.adv_lowpwr {
            self.soc.sram_power(true);
            allocator.set_sram_power(true);
        }

        let v3 = self.config.sram_version == ReservationModel::V3;
        let mut ring = EventRing::allocate(
            &mut allocator,
            self.config.ring.erst_entries,
            self.config.lowpwr_class(),
            v3,
            self.config.interrupter,
        )?;
        if v3 {
            ring.initialize_interrupter(&*self.host);
        }

        let memory = &self.config.memory;
        let info = AdspMemoryInfo {
            dram_region: MemoryRegion {
                phys: memory.dram.phys,
                size: memory.dram.size as u64,
            },
            sram_region: MemoryRegion {
                phys: memory.sram.phys,
                size: memory.sram.size as u64,
            },
            event_ring_addr: ring.ring_base(),
            erst_addr: ring.erst_base(),
            adv_lowpwr: self.config.adv_lowpwr,
            sram_version: self.config.sram_version.version(),
        };
        debug!(
            "ev_ring:{:#x} erst_table:{:#x}",
            info.event_ring_addr, info.erst_addr
        );
        *event_ring = Some(ring);
        Ok(info)
    }

    fn free_event_ring(&self) {
        let mut event_ring = self.event_ring.lock().unwrap();
        if let Some(ring) = event_ring.take() {
            ring.free(&mut self.allocator.lock().unwrap());
        }
    }

    /// Enables or disables one stream direction, depending on `params.enable`.
    pub fn enable_stream(&self, params: &StreamParams) -> Result<(), OffloadError> {
        let mut streams = self.streams();
        if !self.flags.lock().unwrap().adsp_inited {
            error!("adsp not initialized");
            return Err(OffloadError::NotInitialized);
        }
        params.validate()?;

        let ctx = self.stream_context();
        let result = if params.enable == 1 {
            streams.enable(&ctx, params)
        } else {
            streams.disable(&ctx, params.direction as u8)
        };
        self.publish_streaming(&streams);
        result?;
        info!(
            "streaming:{} playback:{:?} capture:{:?}",
            streams.any_active(),
            streams.state(0),
            streams.state(1)
        );
        Ok(())
    }

    pub fn disable_stream(&self, direction: u8) -> Result<(), OffloadError> {
        let mut streams = self.streams();
        if !self.flags.lock().unwrap().adsp_inited {
            error!("adsp not initialized");
            return Err(OffloadError::NotInitialized);
        }
        let result = streams.disable(&self.stream_context(), direction);
        self.publish_streaming(&streams);
        result.map_err(OffloadError::from)
    }

    pub fn is_offload_active(&self) -> bool {
        self.streams().any_active()
    }

    pub fn offload_mode(&self) -> OffloadMode {
        let streams = self.streams();
        if !streams.any_active() {
            return OffloadMode::None;
        }
        let in_sram = streams
            .active_classes()
            .any(|class| class == MemoryClass::Sram);
        debug!("streaming, advanced low power: {}", in_sram);
        if in_sram {
            OffloadMode::Sram
        } else {
            OffloadMode::Dram
        }
    }

    pub fn skip_urb(&self, urb: Urb) -> UrbDisposition {
        self.hid.skip_urb(urb)
    }

    pub fn connect(&self) {
        let mut flags = self.flags.lock().unwrap();
        *flags = DeviceFlags {
            connected: true,
            ..DeviceFlags::default()
        };
        info!("usb audio device connected");
    }

    pub fn disconnect(&self) {
        {
            let mut streams = self.streams();
            if let Err(err) = self.cleanup(&mut streams) {
                error!("unable to notify adsp of disconnect: {}", err);
            }
        }
        {
            let mut flags = self.flags.lock().unwrap();
            *flags = DeviceFlags::default();
        }
        for &direction in HidDirection::ALL.iter() {
            self.hid.detach(direction);
        }
        info!("usb audio device disconnected");
    }

    /// Checks whether the attached device can be offloaded and claims the control
    /// node for it.
    pub fn open(&self, devices: &[DeviceInfo]) -> Result<(), OffloadError> {
        let mut streams = self.streams();
        let flags = *self.flags.lock().unwrap();
        if !flags.connected {
            error!("no usb audio device connected");
            return Err(OffloadError::NotConnected);
        }
        if flags.opened {
            warn!("offload already opened");
            if let Err(err) = self.cleanup(&mut streams) {
                error!("unable to notify adsp: {}", err);
            }
        }

        let device = match devices {
            [] => return Err(OffloadError::NotConnected),
            [device] => device,
            _ => {
                info!("multiple devices, offload not supported");
                return Err(OffloadError::Unsupported("multiple devices"));
            }
        };
        info!(
            "single device {:04x}:{:04x}, audio:{}",
            device.vendor, device.product, device.is_audio
        );

        if !device.is_audio {
            return Err(OffloadError::Unsupported("not a usb audio device"));
        }
        if let Some(quirk) = self.config.quirk(device.vendor, device.product) {
            info!("{} is on the offload deny list", quirk.name);
            return Err(OffloadError::Unsupported("device quirk"));
        }
        if device.streaming_endpoints.iter().any(|&count| count > 1) {
            info!("streaming interface with multiple endpoints");
            return Err(OffloadError::Unsupported("multiple streaming endpoints"));
        }

        self.flags.lock().unwrap().opened = true;
        info!("single uac device, offload supported");
        Ok(())
    }

    /// Gives up the control node: the DSP is told to stop and every offload
    /// buffer is released.
    pub fn release(&self) -> Result<(), OffloadError> {
        let mut streams = self.streams();
        self.cleanup(&mut streams)?;
        Ok(())
    }

    fn cleanup(&self, streams: &mut StreamTable) -> Result<(), IpcError> {
        {
            let mut flags = self.flags.lock().unwrap();
            flags.adsp_inited = false;
            flags.opened = false;
        }
        let result = self.ipc.broadcast(MessageId::Disconnect, &());
        info!("disconnect sent to adsp: {:?}", result);
        self.memory_cleanup(streams);
        result
    }

    /// Frees URB buffers and the interrupter. SRAM is only powered off once no
    /// region is in use anymore.
    pub(crate) fn memory_cleanup(&self, streams: &mut StreamTable) {
        streams.teardown(&self.stream_context());
        self.publish_streaming(streams);
        self.free_event_ring();

        if self.config.sram_version == ReservationModel::V3 {
            let mut allocator = self.allocator.lock().unwrap();
            if allocator.counters().all_zero() {
                allocator.set_sram_power(false);
                self.soc.sram_power(false);
            } else {
                info!("sram still in use: {}", allocator.counters());
            }
        }
        self.soc.bypass_pll(false);
    }

    fn smc(&self, suspend: bool) -> Result<(), OffloadError> {
        if !self.config.smc_ctrl {
            return Ok(());
        }
        match self.soc.smc_call(suspend) {
            0 => Ok(()),
            status => {
                error!("smc {} failed: {}", if suspend { "suspend" } else { "resume" }, status);
                Err(OffloadError::Platform(status))
            }
        }
    }

    fn set_sram_power(&self, on: bool) {
        self.allocator.lock().unwrap().set_sram_power(on);
        self.soc.sram_power(on);
    }

    pub fn suspend(&self) -> Result<(), OffloadError> {
        if !self.is_connected() {
            return Ok(());
        }
        if !self.is_offload_active() {
            if self.config.sram_version == ReservationModel::V2 {
                self.set_sram_power(false);
            }
            return Ok(());
        }

        self.hid.start_offload();
        self.smc(true)
    }

    pub fn resume(&self) -> Result<(), OffloadError> {
        if !self.is_connected() {
            return Ok(());
        }
        if !self.is_offload_active() {
            if self.config.sram_version == ReservationModel::V2 {
                self.set_sram_power(true);
            }
            return Ok(());
        }

        self.hid.finish_offload();
        self.smc(false)
    }

    /// Entry point for everything the DSP sends on its own.
    pub fn handle_dsp_message(&self, bytes: &[u8]) -> Result<(), OffloadError> {
        match DspMessage::decode(bytes)? {
            DspMessage::HidPayload {
                direction,
                data,
                status,
                dequeue,
                last,
            } => self
                .hid
                .on_dsp_payload(direction, &data, status, dequeue, last),
            DspMessage::HidReleased { direction, dequeue } => {
                self.hid.on_dsp_released(direction, dequeue)
            }
            DspMessage::Event(event) => self.on_dsp_event(event),
        }
        Ok(())
    }

    pub fn on_dsp_event(&self, event: DspEvent) {
        match event {
            DspEvent::Stop => {
                let connected = {
                    let mut flags = self.flags.lock().unwrap();
                    flags.adsp_exception = true;
                    flags.adsp_ready = false;
                    flags.connected
                };
                warn!("adsp stopped");
                if connected {
                    self.host.clear_event_handler_busy(self.config.interrupter);
                    self.hid.mark_abnormal();
                }
            }
            DspEvent::Ready => {
                self.flags.lock().unwrap().adsp_ready = true;
                info!("adsp ready");
            }
        }
    }
}
