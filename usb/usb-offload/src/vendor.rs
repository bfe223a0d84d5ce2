//! Memory hooks the host controller driver calls instead of its own allocator, so
//! that the structures the DSP reads live in memory it can reach.
use std::sync::atomic::Ordering;

use log::{debug, error, info, warn};

use crate::config::ReservationModel;
use crate::device::OffloadDevice;
use crate::error::AllocError;
use crate::host::EndpointType;
use crate::memory::{BufferCategory, MemoryBuffer, MemoryClass};
use crate::xhci::{build_ring, free_ring, Ring, RingKind};

/// 256 device context base addresses of 8 bytes each.
pub const DCBAA_SIZE: usize = 256 * 8;
const CONTEXT_ALIGN: u64 = 64;

impl OffloadDevice {
    pub fn alloc_dcbaa(&self) -> Result<MemoryBuffer, AllocError> {
        let mut dcbaa = self.dcbaa.lock().unwrap();
        let mut allocator = self.allocator.lock().unwrap();
        if let Some(handle) = dcbaa.take() {
            if let Err(err) = allocator.free(handle) {
                warn!("failed to free previous dcbaa: {}", err);
            }
        }

        let handle = allocator
            .allocate(
                DCBAA_SIZE,
                CONTEXT_ALIGN,
                MemoryClass::Dram,
                true,
                BufferCategory::Dcbaa,
            )
            .map_err(|err| {
                error!("failed to allocate dcbaa: {}", err);
                err
            })?;
        let buffer = allocator
            .buffer(handle)
            .copied()
            .ok_or(AllocError::NotAllocated)?;
        *dcbaa = Some(handle);
        debug!("dcbaa phys:{:#x} size:{}", buffer.phys, DCBAA_SIZE);
        Ok(buffer)
    }

    /// Releases the DCBAA and with it everything the offload engine still holds.
    pub fn free_dcbaa(&self) {
        let mut streams = self.streams();
        let handle = self.dcbaa.lock().unwrap().take();
        match handle {
            Some(handle) => {
                if let Err(err) = self.allocator.lock().unwrap().free(handle) {
                    error!("failed to free dcbaa: {}", err);
                }
            }
            None => error!("dcbaa has not been allocated"),
        }
        self.memory_cleanup(&mut streams);
    }

    pub fn alloc_container_ctx(&self, size: usize) -> Result<MemoryBuffer, AllocError> {
        let mut allocator = self.allocator.lock().unwrap();
        let handle = allocator
            .allocate(
                size,
                CONTEXT_ALIGN,
                MemoryClass::Dram,
                true,
                BufferCategory::DeviceContext,
            )
            .map_err(|err| {
                error!("failed to allocate context of {} bytes: {}", size, err);
                err
            })?;
        let buffer = allocator
            .buffer(handle)
            .copied()
            .ok_or(AllocError::NotAllocated)?;
        debug!(
            "ctx{} phys:{:#x} size:{}",
            handle.slot, buffer.phys, buffer.size
        );
        Ok(buffer)
    }

    pub fn free_container_ctx(&self, phys: u64) -> Result<(), AllocError> {
        let mut allocator = self.allocator.lock().unwrap();
        match allocator.find_by_phys(BufferCategory::DeviceContext, phys) {
            Some(handle) => allocator.free(handle),
            None => {
                debug!("no context at {:#x} to free", phys);
                Err(AllocError::NotAllocated)
            }
        }
    }

    /// Transfer ring for a newly configured endpoint. `None` leaves the allocation
    /// to the host controller driver.
    pub fn alloc_transfer_ring(
        &self,
        endpoint_type: EndpointType,
        is_in: bool,
        max_packet: u16,
    ) -> Result<Option<Ring>, AllocError> {
        if endpoint_type != EndpointType::Isoch {
            return Ok(None);
        }
        if self.config.sram_version == ReservationModel::V3 {
            // Native memory until a stream relocates it, so idle endpoints do not
            // occupy SRAM.
            return Ok(None);
        }

        let class = self.config.stream_class(is_in);
        let mut allocator = self.allocator.lock().unwrap();
        if self.config.adv_lowpwr && !allocator.sram_powered() {
            self.soc.sram_power(true);
            allocator.set_sram_power(true);
        }
        let ring = build_ring(&mut allocator, 1, 1, RingKind::Isoch, max_packet, class)?;
        info!(
            "transfer ring {:#x} for {} endpoint in {:?}",
            ring.first_phys(),
            if is_in { "in" } else { "out" },
            ring.class()
        );
        Ok(Some(ring))
    }

    /// Takes back a transfer ring the host controller driver is done with. Rings
    /// the allocator does not own are simply dropped.
    pub fn free_transfer_ring(&self, ring: Ring) {
        if ring.is_native() {
            debug!("phys {:#x} isn't managed", ring.first_phys());
            return;
        }
        free_ring(&mut self.allocator.lock().unwrap(), ring);
    }

    pub fn is_streaming(&self) -> bool {
        let streaming = self.streaming.load(Ordering::SeqCst);
        debug!("is_streaming: {}", streaming);
        streaming
    }
}
