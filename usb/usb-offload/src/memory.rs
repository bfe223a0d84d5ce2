//! Buffer bookkeeping over the memory shared with the DSP.
//!
//! Two reserved windows back every allocation: a large DRAM carve-out and a small
//! SRAM bank that can be powered off. The allocator only hands out address ranges;
//! the structures living there are owned by the ring and event modules.
use std::fmt;

use log::{debug, info, warn};

use crate::config::{CounterCaps, MemoryConfig, OffloadConfig, PoolConfig, WindowConfig};
use crate::error::AllocError;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MemoryClass {
    Dram,
    Sram,
}

impl fmt::Display for MemoryClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Dram => write!(f, "dram"),
            Self::Sram => write!(f, "sram"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BufferCategory {
    Dcbaa,
    DeviceContext,
    TransferRing,
    Erst,
    EventRing,
    Urb,
}

impl BufferCategory {
    const ALL: [BufferCategory; 6] = [
        Self::Dcbaa,
        Self::DeviceContext,
        Self::TransferRing,
        Self::Erst,
        Self::EventRing,
        Self::Urb,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn capacity(self, pools: &PoolConfig) -> usize {
        match self {
            Self::Dcbaa => pools.dcbaa,
            Self::DeviceContext => pools.device_contexts,
            Self::TransferRing => pools.transfer_segments,
            Self::Erst => pools.erst,
            Self::EventRing => pools.event_ring,
            Self::Urb => pools.urb,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MemoryBuffer {
    pub phys: u64,
    pub virt: u64,
    pub size: usize,
    pub class: Option<MemoryClass>,
    pub reserved: bool,
    pub allocated: bool,
}

/// Names one slot of one pool. Only valid while the slot stays allocated.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BufferHandle {
    pub category: BufferCategory,
    pub slot: usize,
}

/// Use counters of the reserved regions. SRAM may only be released by device
/// teardown once all of them are back to zero.
#[derive(Clone, Copy, Debug)]
pub struct RegionUseCounters {
    erst: u8,
    event_ring: u8,
    transfer_ring: u8,
    urb: u8,
    caps: CounterCaps,
}

impl RegionUseCounters {
    pub fn new(caps: CounterCaps) -> Self {
        Self {
            erst: 0,
            event_ring: 0,
            transfer_ring: 0,
            urb: 0,
            caps,
        }
    }

    fn slot(&mut self, category: BufferCategory) -> Option<(&mut u8, u8)> {
        match category {
            BufferCategory::Erst => Some((&mut self.erst, self.caps.erst)),
            BufferCategory::EventRing => Some((&mut self.event_ring, self.caps.event_ring)),
            BufferCategory::TransferRing => {
                Some((&mut self.transfer_ring, self.caps.transfer_ring))
            }
            BufferCategory::Urb => Some((&mut self.urb, self.caps.urb)),
            BufferCategory::Dcbaa | BufferCategory::DeviceContext => None,
        }
    }

    pub fn increment(&mut self, category: BufferCategory) {
        if let Some((count, cap)) = self.slot(category) {
            if *count < cap {
                *count += 1;
            } else {
                warn!("{:?} region counter saturated at {}", category, cap);
            }
        }
    }

    pub fn decrement(&mut self, category: BufferCategory) {
        if let Some((count, _)) = self.slot(category) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn get(&self, category: BufferCategory) -> u8 {
        match category {
            BufferCategory::Erst => self.erst,
            BufferCategory::EventRing => self.event_ring,
            BufferCategory::TransferRing => self.transfer_ring,
            BufferCategory::Urb => self.urb,
            BufferCategory::Dcbaa | BufferCategory::DeviceContext => 0,
        }
    }

    pub fn all_zero(&self) -> bool {
        self.erst == 0 && self.event_ring == 0 && self.transfer_ring == 0 && self.urb == 0
    }
}

impl fmt::Display for RegionUseCounters {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "erst:{} ev:{} tr:{} urb:{}",
            self.erst, self.event_ring, self.transfer_ring, self.urb
        )
    }
}

/// A reserved physical window. `used` holds (offset, length) extents sorted by offset.
struct Window {
    class: MemoryClass,
    phys: u64,
    virt: u64,
    size: u64,
    used: Vec<(u64, u64)>,
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

impl Window {
    fn new(class: MemoryClass, config: &WindowConfig) -> Self {
        Self {
            class,
            phys: config.phys,
            virt: config.virt,
            size: config.size as u64,
            used: Vec::new(),
        }
    }

    /// First fit over the gaps between used extents. Alignment applies to the
    /// physical address.
    fn place(&mut self, size: usize, align: u64) -> Result<u64, AllocError> {
        let len = size as u64;
        if len == 0 || len > self.size {
            return Err(AllocError::SizeTooLarge(size));
        }

        let mut cursor = 0;
        let mut insert_at = self.used.len();
        for (i, &(offset, used_len)) in self.used.iter().enumerate() {
            let start = align_up(self.phys + cursor, align) - self.phys;
            if start + len <= offset {
                insert_at = i;
                break;
            }
            cursor = offset + used_len;
        }

        let start = align_up(self.phys + cursor, align) - self.phys;
        if insert_at == self.used.len() && start + len > self.size {
            return Err(AllocError::OutOfMemory(size));
        }

        self.used.insert(insert_at, (start, len));
        Ok(start)
    }

    fn release(&mut self, phys: u64) {
        let offset = phys - self.phys;
        self.used.retain(|&(start, _)| start != offset);
    }

    fn contains(&self, phys: u64) -> bool {
        phys >= self.phys && phys < self.phys + self.size
    }
}

pub struct RegionAllocator {
    dram: Window,
    sram: Window,
    /// Low-power memory may be used at all.
    sram_enabled: bool,
    sram_powered: bool,
    pools: Vec<Vec<MemoryBuffer>>,
    counters: RegionUseCounters,
}

impl RegionAllocator {
    pub fn new(config: &OffloadConfig) -> Self {
        Self::with_layout(&config.memory, &config.pools, config.counters, config.adv_lowpwr)
    }

    pub fn with_layout(
        memory: &MemoryConfig,
        pools: &PoolConfig,
        caps: CounterCaps,
        sram_enabled: bool,
    ) -> Self {
        let pools = BufferCategory::ALL
            .iter()
            .map(|category| vec![MemoryBuffer::default(); category.capacity(pools)])
            .collect();

        Self {
            dram: Window::new(MemoryClass::Dram, &memory.dram),
            sram: Window::new(MemoryClass::Sram, &memory.sram),
            sram_enabled,
            sram_powered: true,
            pools,
            counters: RegionUseCounters::new(caps),
        }
    }

    fn counted(category: BufferCategory) -> bool {
        // Transfer rings span several segments, the ring builder counts them once.
        matches!(
            category,
            BufferCategory::Erst | BufferCategory::EventRing | BufferCategory::Urb
        )
    }

    fn window_mut(&mut self, class: MemoryClass) -> &mut Window {
        match class {
            MemoryClass::Dram => &mut self.dram,
            MemoryClass::Sram => &mut self.sram,
        }
    }

    pub fn sram_available(&self) -> bool {
        self.sram_enabled && self.sram_powered
    }

    pub fn allocate(
        &mut self,
        size: usize,
        align: u64,
        class: MemoryClass,
        reserve: bool,
        category: BufferCategory,
    ) -> Result<BufferHandle, AllocError> {
        let slot = self.pools[category.index()]
            .iter()
            .position(|buffer| !buffer.allocated)
            .ok_or(AllocError::OutOfSlots)?;

        let class = if class == MemoryClass::Sram && !self.sram_available() {
            info!("sram unavailable, placing {:?} buffer in dram", category);
            MemoryClass::Dram
        } else {
            class
        };

        let align = align.max(1).next_power_of_two();
        let window = self.window_mut(class);
        let offset = window.place(size, align)?;
        let buffer = MemoryBuffer {
            phys: window.phys + offset,
            virt: window.virt + offset,
            size,
            class: Some(window.class),
            reserved: reserve,
            allocated: true,
        };
        self.pools[category.index()][slot] = buffer;

        if class == MemoryClass::Sram && Self::counted(category) {
            self.counters.increment(category);
        }

        debug!(
            "alloc {:?}[{}] {} phys:{:#x} virt:{:#x} size:{:#x} ({})",
            category, slot, class, buffer.phys, buffer.virt, size, self.counters
        );
        Ok(BufferHandle { category, slot })
    }

    pub fn free(&mut self, handle: BufferHandle) -> Result<(), AllocError> {
        let buffer = self
            .pools
            .get(handle.category.index())
            .and_then(|pool| pool.get(handle.slot))
            .copied()
            .filter(|buffer| buffer.allocated)
            .ok_or(AllocError::NotAllocated)?;

        let class = buffer.class.unwrap_or(MemoryClass::Dram);
        self.window_mut(class).release(buffer.phys);
        self.pools[handle.category.index()][handle.slot] = MemoryBuffer::default();

        if class == MemoryClass::Sram && Self::counted(handle.category) {
            self.counters.decrement(handle.category);
        }

        debug!(
            "free {:?}[{}] phys:{:#x} ({})",
            handle.category, handle.slot, buffer.phys, self.counters
        );
        Ok(())
    }

    pub fn buffer(&self, handle: BufferHandle) -> Option<&MemoryBuffer> {
        self.pools
            .get(handle.category.index())?
            .get(handle.slot)
            .filter(|buffer| buffer.allocated)
    }

    pub fn find_by_phys(&self, category: BufferCategory, phys: u64) -> Option<BufferHandle> {
        self.pools[category.index()]
            .iter()
            .position(|buffer| buffer.allocated && buffer.phys == phys)
            .map(|slot| BufferHandle { category, slot })
    }

    /// Memory class a physical address falls into, if any.
    pub fn class_of(&self, phys: u64) -> Option<MemoryClass> {
        if self.sram.contains(phys) {
            Some(MemoryClass::Sram)
        } else if self.dram.contains(phys) {
            Some(MemoryClass::Dram)
        } else {
            None
        }
    }

    pub fn allocated_count(&self, category: BufferCategory) -> usize {
        self.pools[category.index()]
            .iter()
            .filter(|buffer| buffer.allocated)
            .count()
    }

    pub fn counters(&self) -> &RegionUseCounters {
        &self.counters
    }

    pub fn note_ring_built(&mut self, class: MemoryClass) {
        if class == MemoryClass::Sram {
            self.counters.increment(BufferCategory::TransferRing);
        }
    }

    pub fn note_ring_freed(&mut self, class: MemoryClass) {
        if class == MemoryClass::Sram {
            self.counters.decrement(BufferCategory::TransferRing);
        }
    }

    pub fn set_sram_power(&mut self, on: bool) {
        if self.sram_powered != on {
            info!("sram power {}", if on { "on" } else { "off" });
        }
        self.sram_powered = on;
    }

    pub fn sram_powered(&self) -> bool {
        self.sram_powered
    }

    pub fn dump(&self) {
        for category in BufferCategory::ALL.iter() {
            for (slot, buffer) in self.pools[category.index()].iter().enumerate() {
                if buffer.allocated {
                    debug!(
                        "{:?}[{}] phys:{:#x} virt:{:#x} size:{:#x} class:{:?} reserved:{}",
                        category,
                        slot,
                        buffer.phys,
                        buffer.virt,
                        buffer.size,
                        buffer.class,
                        buffer.reserved
                    );
                }
            }
        }
        debug!("region counters {}", self.counters);
    }
}
