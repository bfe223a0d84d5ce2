mod common;

use std::sync::atomic::Ordering;

use common::*;
use usb_offload::host::{EndpointInfo, EndpointType, Speed};
use usb_offload::ipc::{MessageId, Scene};
use usb_offload::memory::{BufferCategory, MemoryClass};
use usb_offload::stream::UrbGeometry;
use usb_offload::xhci::{EventRingState, TRBS_PER_SEGMENT};
use usb_offload::{IpcError, OffloadConfig, OffloadError, OffloadMode, StreamError, StreamState};

fn urb_buffers(fixture: &Fixture) -> usize {
    fixture.device.allocator().allocated_count(BufferCategory::Urb)
}

#[test]
fn playback_stream_goes_active() {
    let fixture = ready_fixture();
    assert_eq!(fixture.device.event_ring_state(), Some(EventRingState::BackedUp));
    assert!(!fixture.soc.sram_on.load(Ordering::SeqCst));

    fixture.device.enable_stream(&playback()).unwrap();

    assert_eq!(fixture.device.stream_state(0), StreamState::Active);
    assert_eq!(fixture.device.event_ring_state(), Some(EventRingState::Live));
    assert!(fixture.soc.sram_on.load(Ordering::SeqCst));
    assert!(fixture.soc.pll_bypass.load(Ordering::SeqCst));
    assert!(!fixture.soc.vcore.load(Ordering::SeqCst));
    assert!(fixture.device.is_offload_active());
    assert_eq!(fixture.device.offload_mode(), OffloadMode::Sram);

    // The data endpoint now runs on a one segment ring in SRAM.
    let (phys, segments, native) = fixture.host.ring_info(AUDIO_SLOT, PLAYBACK_EP);
    assert!(!native);
    assert_eq!(segments, 1);
    {
        let allocator = fixture.device.allocator();
        assert_eq!(allocator.class_of(phys), Some(MemoryClass::Sram));
        assert_eq!(allocator.counters().get(BufferCategory::Urb), 1);
        assert_eq!(allocator.counters().get(BufferCategory::TransferRing), 1);
    }

    assert_eq!(fixture.dsp.scenes(MessageId::EnableStream), vec![Scene::Download]);
    let message = fixture.dsp.last_payload(MessageId::EnableStream).unwrap();
    assert_eq!(message["request"], "Start");
    assert_eq!(message["urb_num"], 4);
    assert_eq!(message["urb_size"], 1152);
    assert_eq!(message["urb_packs"], 32);
    assert_eq!(message["transfer_ring"], phys);
    assert_ne!(message["urb_start"], 0);
}

#[test]
fn second_enable_is_rejected() {
    let fixture = ready_fixture();
    fixture.device.enable_stream(&playback()).unwrap();
    let ring = fixture.host.ring_info(AUDIO_SLOT, PLAYBACK_EP);
    let buffers = urb_buffers(&fixture);

    assert_eq!(
        fixture.device.enable_stream(&playback()),
        Err(OffloadError::Stream(StreamError::AlreadyEnabled))
    );
    assert_eq!(fixture.device.stream_state(0), StreamState::Active);
    assert_eq!(fixture.host.ring_info(AUDIO_SLOT, PLAYBACK_EP), ring);
    assert_eq!(urb_buffers(&fixture), buffers);
    assert_eq!(fixture.dsp.count(MessageId::EnableStream), 1);
}

#[test]
fn disable_of_idle_direction() {
    let fixture = ready_fixture();
    let transfer_rings = fixture
        .device
        .allocator()
        .allocated_count(BufferCategory::TransferRing);

    assert_eq!(
        fixture.device.disable_stream(0),
        Err(OffloadError::Stream(StreamError::AlreadyDisabled))
    );
    assert_eq!(urb_buffers(&fixture), 0);
    assert_eq!(
        fixture
            .device
            .allocator()
            .allocated_count(BufferCategory::TransferRing),
        transfer_rings
    );
    assert_eq!(fixture.dsp.count(MessageId::EnableStream), 0);
}

#[test]
fn bit_depth_out_of_range() {
    let fixture = ready_fixture();
    let mut params = playback();
    params.bit_depth = 33;

    assert_eq!(
        fixture.device.enable_stream(&params),
        Err(OffloadError::Stream(StreamError::InvalidParameter("bit depth")))
    );
    assert_eq!(urb_buffers(&fixture), 0);
    assert_eq!(fixture.device.stream_state(0), StreamState::Idle);
    assert_eq!(fixture.device.event_ring_state(), Some(EventRingState::BackedUp));
}

#[test]
fn ring_too_small_for_period() {
    let fixture = ready_fixture();
    let mut params = playback();
    params.pcm_size = 1537;

    match fixture.device.enable_stream(&params) {
        Err(OffloadError::Stream(StreamError::InsufficientRingCapacity { .. })) => (),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(urb_buffers(&fixture), 0);
}

#[test]
fn service_interval_is_checked() {
    let fixture = ready_fixture();
    let mut params = playback();
    params.service_interval = Some(100);
    assert_eq!(
        fixture.device.enable_stream(&params),
        Err(OffloadError::Stream(StreamError::InvalidParameter("service interval")))
    );

    params.service_interval = Some(125);
    fixture.device.enable_stream(&params).unwrap();
    assert_eq!(fixture.device.stream_state(0), StreamState::Active);
}

#[test]
fn enable_requires_initialized_dsp() {
    let fixture = fixture();
    fixture.device.connect();
    assert_eq!(
        fixture.device.enable_stream(&playback()),
        Err(OffloadError::NotInitialized)
    );
    assert_eq!(
        fixture.device.disable_stream(0),
        Err(OffloadError::NotInitialized)
    );
}

#[test]
fn missing_substream() {
    let fixture = ready_fixture();
    fixture.host.substreams.lock().unwrap().clear();
    assert_eq!(
        fixture.device.enable_stream(&playback()),
        Err(OffloadError::Stream(StreamError::DeviceGone))
    );
    assert_eq!(fixture.device.stream_state(0), StreamState::Idle);
}

#[test]
fn rejected_announce_unwinds() {
    let fixture = ready_fixture();
    fixture.dsp.status.store(-5, Ordering::SeqCst);

    assert_eq!(
        fixture.device.enable_stream(&playback()),
        Err(OffloadError::Stream(StreamError::Ipc(IpcError::RemoteRejected(-5))))
    );
    assert_eq!(fixture.device.stream_state(0), StreamState::Idle);
    assert!(!fixture.soc.pll_bypass.load(Ordering::SeqCst));
    assert_eq!(fixture.device.event_ring_state(), Some(EventRingState::BackedUp));
    assert!(!fixture.soc.sram_on.load(Ordering::SeqCst));

    // The previous ring is back on the endpoint and nothing is left allocated.
    assert_eq!(
        fixture.host.ring_info(AUDIO_SLOT, PLAYBACK_EP),
        (PLAYBACK_RING, 2, true)
    );
    let allocator = fixture.device.allocator();
    assert_eq!(allocator.allocated_count(BufferCategory::Urb), 0);
    assert_eq!(allocator.allocated_count(BufferCategory::TransferRing), 0);
    assert_eq!(allocator.counters().get(BufferCategory::Urb), 0);
    assert_eq!(allocator.counters().get(BufferCategory::TransferRing), 0);
}

#[test]
fn disable_releases_buffers_and_sram() {
    let fixture = ready_fixture();
    fixture.device.enable_stream(&playback()).unwrap();

    let mut params = playback();
    params.enable = 0;
    fixture.device.enable_stream(&params).unwrap();

    assert_eq!(fixture.device.stream_state(0), StreamState::Idle);
    assert_eq!(urb_buffers(&fixture), 0);
    assert_eq!(fixture.device.event_ring_state(), Some(EventRingState::BackedUp));
    assert!(!fixture.soc.sram_on.load(Ordering::SeqCst));
    assert!(!fixture.soc.pll_bypass.load(Ordering::SeqCst));
    assert_eq!(fixture.device.offload_mode(), OffloadMode::None);

    let stop = fixture.dsp.last_payload(MessageId::EnableStream).unwrap();
    assert_eq!(stop["request"], "Stop");

    // The relocated ring stays with the endpoint until the host frees it.
    let (_, _, native) = fixture.host.ring_info(AUDIO_SLOT, PLAYBACK_EP);
    assert!(!native);
}

#[test]
fn long_irq_period_expands_ring() {
    let fixture = ready_fixture();
    let mut params = playback();
    params.xhc_irq_period_ms = 20;

    fixture.device.enable_stream(&params).unwrap();
    let (_, segments, _) = fixture.host.ring_info(AUDIO_SLOT, PLAYBACK_EP);
    assert_eq!(segments, 2);

    fixture.device.disable_stream(0).unwrap();
    let (_, segments, _) = fixture.host.ring_info(AUDIO_SLOT, PLAYBACK_EP);
    assert_eq!(segments, 1);
    assert_eq!(urb_buffers(&fixture), 0);
}

#[test]
fn high_speed_capture_holds_vcore() {
    let fixture = ready_fixture();
    fixture.device.enable_stream(&capture()).unwrap();
    assert!(fixture.soc.vcore.load(Ordering::SeqCst));
    assert_eq!(fixture.dsp.scenes(MessageId::EnableStream), vec![Scene::Upload]);

    fixture.device.disable_stream(1).unwrap();
    assert!(!fixture.soc.vcore.load(Ordering::SeqCst));
}

#[test]
fn directions_are_independent() {
    let fixture = ready_fixture();
    fixture.device.enable_stream(&playback()).unwrap();
    fixture.device.enable_stream(&capture()).unwrap();
    assert_eq!(urb_buffers(&fixture), 2);

    fixture.device.disable_stream(0).unwrap();
    assert_eq!(fixture.device.stream_state(1), StreamState::Active);
    assert_eq!(fixture.device.event_ring_state(), Some(EventRingState::Live));
    assert!(fixture.soc.pll_bypass.load(Ordering::SeqCst));

    fixture.device.disable_stream(1).unwrap();
    assert_eq!(fixture.device.event_ring_state(), Some(EventRingState::BackedUp));
    assert_eq!(urb_buffers(&fixture), 0);
}

#[test]
fn dram_only_configuration() {
    let mut config = OffloadConfig::default();
    config.adv_lowpwr = false;
    let fixture = fixture_with(config, Speed::High);
    fixture.device.connect();
    fixture.device.init_adsp(true).unwrap();

    fixture.device.enable_stream(&playback()).unwrap();
    assert_eq!(fixture.device.offload_mode(), OffloadMode::Dram);
    assert!(fixture.device.allocator().counters().all_zero());
}

#[test]
fn oversized_ring_buffer_is_rejected() {
    let fixture = ready_fixture();
    let mut params = playback();
    params.dram_size = u32::MAX;
    params.dram_cnt = u32::MAX;

    assert_eq!(
        fixture.device.enable_stream(&params),
        Err(OffloadError::Stream(StreamError::InvalidParameter("ring buffer size")))
    );
    assert_eq!(fixture.device.stream_state(0), StreamState::Idle);
    assert_eq!(fixture.device.event_ring_state(), Some(EventRingState::BackedUp));

    fixture.device.enable_stream(&playback()).unwrap();
    fixture.device.disconnect();
    assert_eq!(fixture.device.stream_state(0), StreamState::Idle);
}

#[test]
fn oversized_capture_queue_is_rejected() {
    let fixture = ready_fixture();
    let mut params = capture();
    params.xhc_irq_period_ms = u32::MAX;
    params.xhc_urb_num = u32::MAX;

    assert_eq!(
        fixture.device.enable_stream(&params),
        Err(OffloadError::Stream(StreamError::InvalidParameter("urb geometry")))
    );
    assert_eq!(fixture.device.stream_state(1), StreamState::Idle);
    assert_eq!(urb_buffers(&fixture), 0);
    assert_eq!(fixture.device.event_ring_state(), Some(EventRingState::BackedUp));
    assert!(!fixture.soc.sram_on.load(Ordering::SeqCst));
    assert!(!fixture.soc.vcore.load(Ordering::SeqCst));

    fixture.device.enable_stream(&capture()).unwrap();
    assert_eq!(fixture.device.stream_state(1), StreamState::Active);
}

fn one_pack_geometry(direction: u32, urb_num: u32) -> UrbGeometry {
    let config = OffloadConfig::default();
    let mut params = playback();
    params.direction = direction;
    params.xhc_irq_period_ms = 1;
    params.xhc_urb_num = urb_num;
    let endpoint = EndpointInfo {
        address: 0x82,
        index: CAPTURE_EP,
        endpoint_type: EndpointType::Isoch,
        max_packet: 192,
        interval: 1,
    };
    UrbGeometry::compute(&params, Speed::Full, &endpoint, 0, &config.urb, 64).unwrap()
}

#[test]
fn capture_queue_fills_exactly_one_segment() {
    let geometry = one_pack_geometry(1, TRBS_PER_SEGMENT as u32);
    assert_eq!(geometry.urb_packs, 1);
    assert_eq!(geometry.nurbs, TRBS_PER_SEGMENT as u64);
}

#[test]
fn capture_queue_past_one_segment_is_cut() {
    let geometry = one_pack_geometry(1, TRBS_PER_SEGMENT as u32 + 1);
    assert_eq!(geometry.nurbs, TRBS_PER_SEGMENT as u64);

    // Playback keeps every URB it asked for.
    let geometry = one_pack_geometry(0, TRBS_PER_SEGMENT as u32 + 1);
    assert_eq!(geometry.nurbs, TRBS_PER_SEGMENT as u64 + 1);
}
