//! Enabling and disabling offloaded PCM streams.
//!
//! Each direction goes through `Idle -> Validating -> Allocating -> Announced ->
//! Active`, and back through `Disabling` to `Idle`. Everything an enable
//! allocates is unwound when a later step fails, so a failed request leaves the
//! allocator and the endpoint exactly as it found them.
use std::sync::Mutex;

use log::{debug, error, info, warn};

use crate::config::{OffloadConfig, ReservationModel, UrbConfig};
use crate::error::{AllocError, RingError, StreamError};
use crate::host::{EndpointInfo, Speed, Substream, SocControl, UsbHost};
use crate::ipc::{IpcTransport, MessageId, Scene, StreamMessage, StreamRequest};
use crate::memory::{BufferCategory, BufferHandle, MemoryClass, RegionAllocator};
use crate::xhci::{
    build_ring, expand_ring, free_ring, remove_segment, EventRing, EventRingState, Ring, RingKind,
    SEGMENT_SIZE, TRBS_PER_SEGMENT,
};

pub const MAX_BIT_RATE: u32 = 768_000;
pub const MAX_BIT_DEPTH: u32 = 32;
pub const MAX_CHANNELS: u32 = 2;
pub const MAX_CARDS: u32 = 32;

pub const PLAYBACK: u8 = 0;
pub const CAPTURE: u8 = 1;

const BUS_INTERVAL_FULL_SPEED: u32 = 1000;
const BUS_INTERVAL_HIGHSPEED_AND_ABOVE: u32 = 125;
const MAX_BINTERVAL_ISOC_EP: u32 = 16;

/// PCM sample formats, numbered like the ALSA `snd_pcm_format_t` values user
/// space passes in.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PcmFormat {
    S8 = 0,
    U8 = 1,
    S16Le = 2,
    S16Be = 3,
    U16Le = 4,
    U16Be = 5,
    S24Le = 6,
    S24Be = 7,
    U24Le = 8,
    U24Be = 9,
    S32Le = 10,
    S32Be = 11,
    U32Le = 12,
    U32Be = 13,
    S24_3Le = 32,
    S24_3Be = 33,
    U24_3Le = 34,
    U24_3Be = 35,
}

impl PcmFormat {
    pub fn from_raw(format: u32) -> Option<PcmFormat> {
        Some(match format {
            0 => Self::S8,
            1 => Self::U8,
            2 => Self::S16Le,
            3 => Self::S16Be,
            4 => Self::U16Le,
            5 => Self::U16Be,
            6 => Self::S24Le,
            7 => Self::S24Be,
            8 => Self::U24Le,
            9 => Self::U24Be,
            10 => Self::S32Le,
            11 => Self::S32Be,
            12 => Self::U32Le,
            13 => Self::U32Be,
            32 => Self::S24_3Le,
            33 => Self::S24_3Be,
            34 => Self::U24_3Le,
            35 => Self::U24_3Be,
            _ => return None,
        })
    }
}

/// A stream request as handed over by user space.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StreamParams {
    pub enable: u32,
    pub bit_rate: u32,
    pub bit_depth: u32,
    pub channels: u32,
    pub direction: u32,
    pub audio_format: u32,
    pub card: u32,
    pub device: u32,
    pub xhc_irq_period_ms: u32,
    pub xhc_urb_num: u32,
    pub pcm_size: u32,
    pub dram_size: u32,
    pub dram_cnt: u32,
    pub service_interval: Option<u32>,
}

impl StreamParams {
    /// Range checks that need no device state.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.enable > 1 {
            return Err(StreamError::InvalidParameter("enable"));
        }
        if self.bit_rate > MAX_BIT_RATE {
            return Err(StreamError::InvalidParameter("bit rate"));
        }
        if self.bit_depth > MAX_BIT_DEPTH {
            return Err(StreamError::InvalidParameter("bit depth"));
        }
        if self.channels > MAX_CHANNELS {
            return Err(StreamError::InvalidParameter("channel count"));
        }
        if self.direction > CAPTURE as u32 {
            return Err(StreamError::InvalidParameter("direction"));
        }
        if self.card >= MAX_CARDS {
            return Err(StreamError::InvalidParameter("card number"));
        }
        if PcmFormat::from_raw(self.audio_format).is_none() {
            return Err(StreamError::InvalidParameter("pcm format"));
        }
        Ok(())
    }

    pub fn is_capture(&self) -> bool {
        self.direction == CAPTURE as u32
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamState {
    Idle,
    Validating,
    Allocating,
    Announced,
    Active,
    Disabling,
}

/// Maps a requested service interval in microseconds onto the data interval
/// exponent of an isochronous endpoint.
pub fn data_interval_from_service_interval(
    speed: Speed,
    service_interval: u32,
) -> Result<u8, StreamError> {
    let invalid = StreamError::InvalidParameter("service interval");
    let bus_interval = if speed >= Speed::High {
        BUS_INTERVAL_HIGHSPEED_AND_ABOVE
    } else {
        BUS_INTERVAL_FULL_SPEED
    };

    if service_interval % bus_interval != 0 {
        return Err(invalid);
    }
    let mult = service_interval / bus_interval;
    if mult == 0 {
        return Err(invalid);
    }
    let binterval = mult.trailing_zeros() + 1;
    if binterval > MAX_BINTERVAL_ISOC_EP || mult >> binterval != 0 {
        return Err(invalid);
    }
    Ok((binterval - 1) as u8)
}

fn packets_per_second(speed: Speed, datainterval: u8) -> u64 {
    let base = if speed.is_full_or_slower() { 1000u64 } else { 8000 };
    base >> datainterval.min(63)
}

fn packs_per_ms(speed: Speed, datainterval: u8) -> u64 {
    if speed.is_full_or_slower() {
        1
    } else {
        8u64 >> datainterval.min(63)
    }
}

/// Checks that the DSP ring buffer can hold one PCM period. Everything is scaled
/// by ten to keep one decimal digit through the integer division.
pub fn check_ring_capacity(
    params: &StreamParams,
    speed: Speed,
    datainterval: u8,
) -> Result<(), StreamError> {
    let pps = packets_per_second(speed, datainterval);
    if pps == 0 {
        return Err(StreamError::InvalidParameter("data interval"));
    }

    let frame_bytes = (params.bit_depth as u64 * params.channels as u64) >> 3;
    let packet = 10 * (frame_bytes * params.bit_rate as u64) / pps;
    let ring_bytes = packet
        .checked_mul(packs_per_ms(speed, datainterval))
        .and_then(|bytes| bytes.checked_mul(params.dram_size as u64))
        .and_then(|bytes| bytes.checked_mul(params.dram_cnt as u64))
        .ok_or(StreamError::InvalidParameter("ring buffer size"))?;
    let pcm_bytes = params.pcm_size as u64 * 10;

    debug!(
        "10*pkt_sz:{} 10*ringbuf_sz:{} 10*pcm_sz:{}",
        packet, ring_bytes, pcm_bytes
    );
    if ring_bytes < pcm_bytes {
        return Err(StreamError::InsufficientRingCapacity {
            ring_bytes,
            pcm_bytes,
        });
    }
    Ok(())
}

/// How the URB buffer of one stream is carved up.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UrbGeometry {
    pub freqn: u64,
    pub freqmax: u64,
    pub maxsize: u64,
    pub packs_per_ms: u64,
    pub urb_packs: u64,
    pub nurbs: u64,
    pub urb_size: u64,
    /// Stride reserved per URB so every URB can start aligned.
    pub align_size: u64,
    pub align: u64,
}

impl UrbGeometry {
    pub fn compute(
        params: &StreamParams,
        speed: Speed,
        endpoint: &EndpointInfo,
        datainterval: u8,
        limits: &UrbConfig,
        align: u64,
    ) -> Result<UrbGeometry, StreamError> {
        let overflow = || StreamError::InvalidParameter("urb geometry");
        let align = align.max(1).next_power_of_two();
        let shift = datainterval.min(16) as u32;
        let frame_bytes = (params.bit_depth as u64 * params.channels as u64) >> 3;
        let rate = params.bit_rate as u64;

        let freqn = if speed.is_full_or_slower() {
            ((rate << 13) + 62) / 125
        } else {
            ((rate << 10) + 62) / 125
        };
        let mut freqmax = freqn + (freqn >> 1);
        let mut maxsize = (((freqmax << shift) + 0xffff) >> 16) * frame_bytes;

        let max_packet = endpoint.max_packet as u64;
        if max_packet != 0 && max_packet < maxsize {
            let (previous_maxsize, previous_freqmax) = (maxsize, freqmax);
            maxsize = max_packet;
            freqmax = if frame_bytes == 0 {
                0
            } else {
                (maxsize / frame_bytes) << (16 - shift)
            };
            info!(
                "maxsize:{}->{} freqmax:{}->{}",
                previous_maxsize, maxsize, previous_freqmax, freqmax
            );
        }

        let packs_per_ms = packs_per_ms(speed, datainterval);
        let irq_period = params.xhc_irq_period_ms as u64;
        let urb_num = params.xhc_urb_num as u64;
        let urb_packs = irq_period * packs_per_ms;
        let queued_packs = urb_packs.checked_mul(urb_num).ok_or_else(overflow)?;
        let nurbs = if params.is_capture() && queued_packs > TRBS_PER_SEGMENT as u64 {
            // The whole capture queue has to fit in one ring segment.
            TRBS_PER_SEGMENT as u64 / urb_packs
        } else {
            urb_num
        };

        // Max packs per URB only bounds the packet count the class driver itself
        // would use; the DSP packs URBs by IRQ period.
        let max_packs = if speed.is_full_or_slower() {
            limits.max_packs
        } else {
            limits.max_packs_hs
        };
        let max_packs_per_urb = (max_packs as u64 >> shift).max(1);
        debug!(
            "max packs per urb {}, packs per ms {}",
            max_packs_per_urb, packs_per_ms
        );

        let urb_size = maxsize.checked_mul(urb_packs).ok_or_else(overflow)?;
        let align_size = urb_size.checked_add(align - 1).ok_or_else(overflow)?;
        Ok(UrbGeometry {
            freqn,
            freqmax,
            maxsize,
            packs_per_ms,
            urb_packs,
            nurbs,
            urb_size,
            align_size,
            align,
        })
    }

    /// Bytes to allocate: every URB at its aligned stride, plus room for a second
    /// transfer ring segment when the ring needs one.
    pub fn total_size(&self, with_segment: bool) -> Option<u64> {
        let total = self.align_size.checked_mul(self.nurbs)?;
        if with_segment {
            total.checked_add(SEGMENT_SIZE as u64 + self.align - 1)
        } else {
            Some(total)
        }
    }

    /// Rounds `phys` up to the URB alignment.
    pub fn align_up(&self, phys: u64) -> u64 {
        (phys + self.align - 1) & !(self.align - 1)
    }
}

/// An enabled stream direction.
#[derive(Clone, Copy, Debug)]
pub struct StreamDescriptor {
    pub params: StreamParams,
    pub slot: u8,
    pub speed: Speed,
    pub data_endpoint: EndpointInfo,
    pub sync_endpoint: Option<EndpointInfo>,
    pub geometry: UrbGeometry,
    pub urb_buffer: BufferHandle,
    pub urb_start: u64,
    pub class: MemoryClass,
    /// Physical base of the second ring segment placed in the URB buffer.
    pub expanded_segment: Option<u64>,
    pub relocated: bool,
    pub vcore_held: bool,
}

/// Everything a stream transition touches besides the stream table itself.
pub struct StreamContext<'a> {
    pub config: &'a OffloadConfig,
    pub allocator: &'a Mutex<RegionAllocator>,
    pub event_ring: &'a Mutex<Option<EventRing>>,
    pub host: &'a dyn UsbHost,
    pub soc: &'a dyn SocControl,
    pub ipc: &'a IpcTransport,
}

/// What a half-finished enable has to give back.
#[derive(Default)]
struct Unwind {
    urb_buffer: Option<BufferHandle>,
    old_ring: Option<Ring>,
    expanded_segment: Option<u64>,
}

pub struct StreamTable {
    states: [StreamState; 2],
    streams: [Option<StreamDescriptor>; 2],
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTable {
    pub fn new() -> Self {
        Self {
            states: [StreamState::Idle; 2],
            streams: [None, None],
        }
    }

    pub fn state(&self, direction: u8) -> StreamState {
        self.states[(direction & 1) as usize]
    }

    pub fn descriptor(&self, direction: u8) -> Option<&StreamDescriptor> {
        self.streams[(direction & 1) as usize].as_ref()
    }

    pub fn is_active(&self, direction: u8) -> bool {
        self.state(direction) == StreamState::Active
    }

    pub fn any_active(&self) -> bool {
        self.is_active(PLAYBACK) || self.is_active(CAPTURE)
    }

    /// Memory class of every active stream's URB buffer.
    pub fn active_classes(&self) -> impl Iterator<Item = MemoryClass> + '_ {
        self.streams.iter().flatten().map(|stream| stream.class)
    }

    /// Settles directions a panicking caller left mid-transition: a direction
    /// that still holds its buffers is active, anything else is idle.
    pub fn abandon_transitions(&mut self) {
        for (state, stream) in self.states.iter_mut().zip(self.streams.iter()) {
            let settled = if stream.is_some() {
                StreamState::Active
            } else {
                StreamState::Idle
            };
            if *state != settled {
                warn!("stream left in {:?}, now {:?}", state, settled);
                *state = settled;
            }
        }
    }

    pub fn enable(&mut self, ctx: &StreamContext, params: &StreamParams) -> Result<(), StreamError> {
        if params.direction > CAPTURE as u32 {
            return Err(StreamError::InvalidParameter("direction"));
        }
        let direction = params.direction as u8;
        if self.states[direction as usize] != StreamState::Idle {
            error!("stream {} already enabled", direction);
            return Err(StreamError::AlreadyEnabled);
        }

        self.states[direction as usize] = StreamState::Validating;
        let result = self.try_enable(ctx, params, direction);
        if result.is_err() {
            self.states[direction as usize] = StreamState::Idle;
            self.power_down_if_idle(ctx);
        }
        ctx.soc.bypass_pll(self.any_active());
        result
    }

    /// Backs the event ring up and lets SRAM go once no stream needs it.
    fn power_down_if_idle(&self, ctx: &StreamContext) {
        if self.any_active() || ctx.config.sram_version != ReservationModel::V3 {
            return;
        }
        let mut event_ring = ctx.event_ring.lock().unwrap();
        if let Some(event_ring) = event_ring.as_mut() {
            let mut allocator = ctx.allocator.lock().unwrap();
            if let Err(err) = event_ring.power_down(&mut allocator, ctx.soc) {
                error!("failed to back up event ring: {}", err);
            }
        }
    }

    fn try_enable(
        &mut self,
        ctx: &StreamContext,
        params: &StreamParams,
        direction: u8,
    ) -> Result<(), StreamError> {
        info!(
            "enable dir:{} rate:{} ch:{} depth:{} period:{} urbs:{} card:{} pcm:{} dram:{}x{}",
            params.direction,
            params.bit_rate,
            params.channels,
            params.bit_depth,
            params.xhc_irq_period_ms,
            params.xhc_urb_num,
            params.card,
            params.device,
            params.dram_size,
            params.dram_cnt
        );
        params.validate()?;

        let substream = ctx
            .host
            .find_substream(params.card as u8, params.device as u8, direction)
            .filter(|substream| !substream.shutdown)
            .ok_or(StreamError::DeviceGone)?;
        let data_endpoint = substream.data.ok_or(StreamError::DeviceGone)?;
        let speed = ctx
            .host
            .device_speed(substream.slot)
            .ok_or(StreamError::DeviceGone)?;

        if let Some(service_interval) = params.service_interval {
            let datainterval = data_interval_from_service_interval(speed, service_interval)
                .map_err(|err| {
                    error!("invalid service interval {}", service_interval);
                    err
                })?;
            info!("data interval {}", datainterval);
        }
        check_ring_capacity(params, speed, substream.datainterval)?;

        {
            let mut event_ring = ctx.event_ring.lock().unwrap();
            let event_ring = event_ring.as_mut().ok_or(StreamError::NotInitialized)?;
            if event_ring.state() == EventRingState::BackedUp {
                let mut allocator = ctx.allocator.lock().unwrap();
                event_ring.power_up_and_restore(&mut allocator, ctx.soc)?;
            }
        }

        self.states[direction as usize] = StreamState::Allocating;
        let geometry = UrbGeometry::compute(
            params,
            speed,
            &data_endpoint,
            substream.datainterval,
            &ctx.config.urb,
            ctx.config.ring.urb_align,
        )?;
        info!(
            "urb geometry: maxsize:{} packs:{} nurbs:{} size:{} stride:{}",
            geometry.maxsize,
            geometry.urb_packs,
            geometry.nurbs,
            geometry.urb_size,
            geometry.align_size
        );
        if geometry.urb_size == 0 || geometry.nurbs == 0 {
            return Err(StreamError::InvalidParameter("urb geometry"));
        }

        let mut unwind = Unwind::default();
        let result = self.allocate_and_announce(
            ctx,
            params,
            direction,
            &substream,
            data_endpoint,
            speed,
            geometry,
            &mut unwind,
        );
        if let Err(err) = result {
            error!("enable stream {} failed: {}", direction, err);
            self.unwind(ctx, &substream, data_endpoint, unwind);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn allocate_and_announce(
        &mut self,
        ctx: &StreamContext,
        params: &StreamParams,
        direction: u8,
        substream: &Substream,
        data_endpoint: EndpointInfo,
        speed: Speed,
        geometry: UrbGeometry,
        unwind: &mut Unwind,
    ) -> Result<(), StreamError> {
        let class = ctx.config.stream_class(params.is_capture());
        let with_segment =
            speed > Speed::Full && params.xhc_irq_period_ms == ctx.config.ring.expand_irq_period_ms;
        let total = geometry
            .total_size(with_segment)
            .and_then(|total| usize::try_from(total).ok())
            .ok_or(StreamError::InvalidParameter("urb geometry"))?;

        let (urb_buffer, buffer) = {
            let mut allocator = ctx.allocator.lock().unwrap();
            let handle = allocator.allocate(
                total,
                SEGMENT_SIZE as u64,
                class,
                false,
                BufferCategory::Urb,
            )?;
            let buffer = allocator
                .buffer(handle)
                .copied()
                .ok_or(AllocError::NotAllocated)?;
            (handle, buffer)
        };
        unwind.urb_buffer = Some(urb_buffer);
        let placed = buffer.class.unwrap_or(class);

        if ctx.config.sram_version == ReservationModel::V3 {
            unwind.old_ring = Some(self.relocate_ring(ctx, substream, &data_endpoint, placed)?);
        }

        let mut urb_phys = buffer.phys;
        if with_segment {
            let segment_phys = geometry.align_up(buffer.phys);
            let segment_virt = buffer.virt + (segment_phys - buffer.phys);
            let mut inserted = false;
            ctx.host
                .with_transfer_ring(substream.slot, data_endpoint.index, &mut |ring| {
                    expand_ring(ring, segment_phys, segment_virt);
                    inserted = true;
                });
            if !inserted {
                return Err(RingError::NoRing.into());
            }
            unwind.expanded_segment = Some(segment_phys);
            urb_phys = buffer.phys + SEGMENT_SIZE as u64;
        }
        let urb_start = geometry.align_up(urb_phys);

        let mut transfer_ring = 0;
        ctx.host
            .with_transfer_ring(substream.slot, data_endpoint.index, &mut |ring| {
                transfer_ring = ring.first_phys();
            });

        for i in 0..geometry.nurbs {
            debug!(
                "urb({}) {}: phys {:#x} size {}",
                if params.is_capture() { "in" } else { "out" },
                i,
                urb_start + i * geometry.align_up(geometry.urb_size),
                geometry.urb_size
            );
        }

        self.states[direction as usize] = StreamState::Announced;
        let message = StreamMessage {
            request: StreamRequest::Start,
            direction,
            card: params.card as u8,
            device: params.device as u8,
            slot: substream.slot,
            speed: Some(speed),
            interrupter: ctx.config.interrupter,
            data_endpoint: Some(data_endpoint),
            sync_endpoint: substream.sync,
            transfer_ring,
            bit_rate: params.bit_rate,
            bit_depth: params.bit_depth,
            channels: params.channels,
            pcm_size: params.pcm_size,
            urb_start,
            urb_size: geometry.urb_size as u32,
            urb_num: geometry.nurbs as u32,
            urb_packs: geometry.urb_packs as u32,
        };
        ctx.ipc
            .send(Scene::for_direction(direction), MessageId::EnableStream, &message)?;

        // The DSP owns the new ring now; the one it replaced can go.
        if let Some(old_ring) = unwind.old_ring.take() {
            release_ring(ctx, old_ring);
        }

        let vcore_held = params.is_capture() && speed == Speed::High;
        if vcore_held {
            info!("request holding vcore");
            ctx.soc.hold_vcore(true);
        }

        self.streams[direction as usize] = Some(StreamDescriptor {
            params: *params,
            slot: substream.slot,
            speed,
            data_endpoint,
            sync_endpoint: substream.sync,
            geometry,
            urb_buffer,
            urb_start,
            class: placed,
            expanded_segment: unwind.expanded_segment,
            relocated: ctx.config.sram_version == ReservationModel::V3,
            vcore_held,
        });
        self.states[direction as usize] = StreamState::Active;
        info!("stream {} active, urbs at {:#x}", direction, urb_start);
        Ok(())
    }

    /// Moves the data endpoint onto a fresh one-segment ring in offload memory and
    /// returns the ring it replaced.
    fn relocate_ring(
        &self,
        ctx: &StreamContext,
        substream: &Substream,
        endpoint: &EndpointInfo,
        class: MemoryClass,
    ) -> Result<Ring, StreamError> {
        let ring = build_ring(
            &mut ctx.allocator.lock().unwrap(),
            1,
            1,
            RingKind::Isoch,
            endpoint.max_packet,
            class,
        )?;
        let handles: Vec<BufferHandle> = ring.segments().iter().filter_map(|s| s.buffer).collect();
        let phys = ring.first_phys();
        let placed = ring.class().unwrap_or(class);

        // The host may call back into the memory hooks while it reconfigures the
        // endpoint, so the allocator stays unlocked here.
        match ctx.host.replace_transfer_ring(substream.slot, endpoint.index, ring) {
            Ok(old) => {
                info!(
                    "slot {} ep {} relocated to {:#x} ({})",
                    substream.slot, endpoint.index, phys, placed
                );
                Ok(old)
            }
            Err(err) => {
                error!("failed to relocate transfer ring: {}", err);
                let mut allocator = ctx.allocator.lock().unwrap();
                for handle in handles {
                    if let Err(err) = allocator.free(handle) {
                        warn!("failed to free relocated segment: {}", err);
                    }
                }
                allocator.note_ring_freed(placed);
                Err(err.into())
            }
        }
    }

    fn unwind(
        &mut self,
        ctx: &StreamContext,
        substream: &Substream,
        endpoint: EndpointInfo,
        unwind: Unwind,
    ) {
        if let Some(segment_phys) = unwind.expanded_segment {
            remove_expanded_segment(ctx.host, substream.slot, endpoint.index, segment_phys);
        }
        if let Some(old_ring) = unwind.old_ring {
            match ctx
                .host
                .replace_transfer_ring(substream.slot, endpoint.index, old_ring)
            {
                Ok(new_ring) => release_ring(ctx, new_ring),
                Err(err) => error!("failed to restore transfer ring: {}", err),
            }
        }
        if let Some(handle) = unwind.urb_buffer {
            if let Err(err) = ctx.allocator.lock().unwrap().free(handle) {
                error!("failed to free urb buffer: {}", err);
            }
        }
    }

    pub fn disable(&mut self, ctx: &StreamContext, direction: u8) -> Result<(), StreamError> {
        if direction > CAPTURE {
            return Err(StreamError::InvalidParameter("direction"));
        }
        if self.states[direction as usize] == StreamState::Idle {
            error!("stream {} already disabled", direction);
            return Err(StreamError::AlreadyDisabled);
        }

        self.states[direction as usize] = StreamState::Disabling;
        if let Err(err) = ctx.ipc.send(
            Scene::for_direction(direction),
            MessageId::EnableStream,
            &StreamMessage::stop(direction),
        ) {
            error!("failed to announce stream {} stop: {}", direction, err);
        }

        self.release(ctx, direction);
        info!("stream {} idle", direction);

        self.power_down_if_idle(ctx);
        ctx.soc.bypass_pll(self.any_active());
        Ok(())
    }

    /// Gives back everything one direction holds and leaves it idle.
    fn release(&mut self, ctx: &StreamContext, direction: u8) {
        if let Some(stream) = self.streams[direction as usize].take() {
            if let Some(segment_phys) = stream.expanded_segment {
                remove_expanded_segment(
                    ctx.host,
                    stream.slot,
                    stream.data_endpoint.index,
                    segment_phys,
                );
            }
            if let Err(err) = ctx.allocator.lock().unwrap().free(stream.urb_buffer) {
                warn!("urb buffer of stream {} already freed: {}", direction, err);
            }
            if stream.vcore_held {
                info!("request releasing vcore");
                ctx.soc.hold_vcore(false);
            }
        }
        self.states[direction as usize] = StreamState::Idle;
    }

    /// Drops both directions without talking to the DSP.
    pub fn teardown(&mut self, ctx: &StreamContext) {
        for &direction in [PLAYBACK, CAPTURE].iter() {
            self.release(ctx, direction);
        }
    }
}

fn remove_expanded_segment(host: &dyn UsbHost, slot: u8, endpoint: u8, segment_phys: u64) {
    let mut removed = false;
    let found = host.with_transfer_ring(slot, endpoint, &mut |ring| {
        let index = ring
            .segments()
            .iter()
            .position(|segment| segment.buffer.is_none() && segment.phys == segment_phys);
        if let Some(index) = index {
            removed = remove_segment(ring, index).is_some();
        }
    });
    if !found || !removed {
        warn!(
            "slot {} ep {}: expanded segment {:#x} not found",
            slot, endpoint, segment_phys
        );
    }
}

fn release_ring(ctx: &StreamContext, ring: Ring) {
    if ring.is_native() {
        debug!("dropping native ring {:#x}", ring.first_phys());
    } else {
        free_ring(&mut ctx.allocator.lock().unwrap(), ring);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::EndpointType;

    fn endpoint(address: u8, max_packet: u16) -> EndpointInfo {
        EndpointInfo {
            address,
            index: 1,
            endpoint_type: EndpointType::Isoch,
            max_packet,
            interval: 1,
        }
    }

    fn playback() -> StreamParams {
        StreamParams {
            enable: 1,
            bit_rate: 48000,
            bit_depth: 16,
            channels: 2,
            direction: 0,
            audio_format: PcmFormat::S16Le as u32,
            xhc_irq_period_ms: 4,
            xhc_urb_num: 4,
            pcm_size: 1536,
            dram_size: 4,
            dram_cnt: 2,
            ..StreamParams::default()
        }
    }

    #[test]
    fn validation_limits() {
        assert!(playback().validate().is_ok());
        let cases: [(fn(&mut StreamParams), &str); 7] = [
            (|p| p.enable = 2, "enable"),
            (|p| p.bit_rate = 768_001, "bit rate"),
            (|p| p.bit_depth = 33, "bit depth"),
            (|p| p.channels = 3, "channel count"),
            (|p| p.direction = 2, "direction"),
            (|p| p.card = MAX_CARDS, "card number"),
            (|p| p.audio_format = 14, "pcm format"),
        ];
        for &(mutate, what) in cases.iter() {
            let mut params = playback();
            mutate(&mut params);
            assert_eq!(params.validate(), Err(StreamError::InvalidParameter(what)));
        }
    }

    #[test]
    fn service_interval_mapping() {
        assert_eq!(data_interval_from_service_interval(Speed::High, 125), Ok(0));
        assert_eq!(data_interval_from_service_interval(Speed::High, 1000), Ok(3));
        assert_eq!(data_interval_from_service_interval(Speed::Full, 2000), Ok(1));
        assert!(data_interval_from_service_interval(Speed::High, 100).is_err());
        assert!(data_interval_from_service_interval(Speed::High, 375).is_err());
        assert!(data_interval_from_service_interval(Speed::High, 0).is_err());
    }

    #[test]
    fn high_speed_playback_geometry() {
        let config = OffloadConfig::default();
        let geometry = UrbGeometry::compute(&playback(), Speed::High, &endpoint(0x01, 192), 0, &config.urb, 64).unwrap();
        assert_eq!(geometry.freqn, 393_216);
        assert_eq!(geometry.freqmax, 589_824);
        assert_eq!(geometry.maxsize, 36);
        assert_eq!(geometry.packs_per_ms, 8);
        assert_eq!(geometry.urb_packs, 32);
        assert_eq!(geometry.nurbs, 4);
        assert_eq!(geometry.urb_size, 1152);
        assert_eq!(geometry.align_size, 1215);
        assert_eq!(geometry.total_size(false), Some(4860));
        assert_eq!(geometry.total_size(true), Some(4860 + 4096 + 63));
    }

    #[test]
    fn capture_queue_fits_one_segment() {
        let config = OffloadConfig::default();
        let mut params = playback();
        params.direction = 1;
        params.xhc_irq_period_ms = 20;
        params.xhc_urb_num = 8;
        let geometry = UrbGeometry::compute(&params, Speed::High, &endpoint(0x82, 192), 0, &config.urb, 64).unwrap();
        assert_eq!(geometry.urb_packs, 160);
        assert_eq!(geometry.nurbs, 1);
    }

    #[test]
    fn max_packet_clamps_maxsize() {
        let config = OffloadConfig::default();
        let mut params = playback();
        params.bit_rate = 192_000;
        params.bit_depth = 32;
        let geometry = UrbGeometry::compute(&params, Speed::High, &endpoint(0x01, 64), 0, &config.urb, 64).unwrap();
        assert_eq!(geometry.maxsize, 64);
        assert_eq!(geometry.freqmax, 8 << 16);
    }

    #[test]
    fn full_speed_geometry() {
        let config = OffloadConfig::default();
        let geometry = UrbGeometry::compute(&playback(), Speed::Full, &endpoint(0x01, 512), 0, &config.urb, 64).unwrap();
        assert_eq!(geometry.freqn, 3_145_728);
        assert_eq!(geometry.maxsize, 72 * 4);
        assert_eq!(geometry.packs_per_ms, 1);
        assert_eq!(geometry.urb_packs, 4);
    }

    #[test]
    fn ring_capacity() {
        assert!(check_ring_capacity(&playback(), Speed::High, 0).is_ok());
        let mut params = playback();
        params.pcm_size = 1537;
        assert_eq!(
            check_ring_capacity(&params, Speed::High, 0),
            Err(StreamError::InsufficientRingCapacity {
                ring_bytes: 15360,
                pcm_bytes: 15370
            })
        );
    }

    #[test]
    fn full_speed_capacity_follows_interval() {
        let mut params = playback();
        params.pcm_size = 3000;
        // One packet every 2 ms doubles the packet size.
        assert!(check_ring_capacity(&params, Speed::Full, 1).is_ok());
        assert_eq!(
            check_ring_capacity(&params, Speed::Full, 0),
            Err(StreamError::InsufficientRingCapacity {
                ring_bytes: 15360,
                pcm_bytes: 30000
            })
        );
        assert_eq!(
            check_ring_capacity(&params, Speed::Full, 10),
            Err(StreamError::InvalidParameter("data interval"))
        );
    }
}
