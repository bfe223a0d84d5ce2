use log::{debug, error, info};

use super::ring::{build_ring, expand_ring, free_ring, Ring, RingKind, TRBS_PER_SEGMENT};
use super::trb::Trb;
use crate::error::AllocError;
use crate::host::{InterrupterSetup, SocControl, UsbHost};
use crate::memory::{BufferCategory, BufferHandle, MemoryClass, RegionAllocator};

pub const ERST_ENTRY_SIZE: usize = 16;

/// Event Ring Segment Table entry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EventRingSte {
    pub address: u64,
    pub size: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventRingState {
    Live,
    /// Contents saved off SRAM, which may now be unpowered.
    BackedUp,
}

struct Backup {
    table: Vec<EventRingSte>,
    segments: Vec<Box<[Trb]>>,
}

/// The event ring of the offload interrupter and its segment table.
pub struct EventRing {
    ring: Ring,
    table: Vec<EventRingSte>,
    table_buffer: BufferHandle,
    table_phys: u64,
    entries_in_use: usize,
    state: EventRingState,
    backup: Option<Backup>,
    interrupter: u8,
}

impl EventRing {
    /// Builds a one-segment event ring and a table with room for `erst_entries`
    /// segments. Backup storage is reserved up front when `with_backup` is set.
    pub fn allocate(
        allocator: &mut RegionAllocator,
        erst_entries: usize,
        class: MemoryClass,
        with_backup: bool,
        interrupter: u8,
    ) -> Result<EventRing, AllocError> {
        let ring = build_ring(allocator, 1, 1, RingKind::Event, 0, class)?;

        let table_buffer = match allocator.allocate(
            ERST_ENTRY_SIZE * erst_entries.max(1),
            64,
            class,
            true,
            BufferCategory::Erst,
        ) {
            Ok(handle) => handle,
            Err(err) => {
                error!("failed to allocate event ring segment table: {}", err);
                free_ring(allocator, ring);
                return Err(err);
            }
        };
        let table_phys = allocator
            .buffer(table_buffer)
            .map(|buffer| buffer.phys)
            .unwrap_or_default();

        let backup = if with_backup {
            Some(Backup {
                table: vec![EventRingSte::default(); erst_entries.max(1)],
                segments: Vec::with_capacity(erst_entries.max(1)),
            })
        } else {
            None
        };

        let mut event_ring = EventRing {
            ring,
            table: vec![EventRingSte::default(); erst_entries.max(1)],
            table_buffer,
            table_phys,
            entries_in_use: 0,
            state: EventRingState::Live,
            backup,
            interrupter,
        };
        event_ring.write_entry(0, 0);
        event_ring.entries_in_use = 1;

        info!(
            "event ring {:#x}, erst {:#x} with {} entries",
            event_ring.ring_base(),
            table_phys,
            event_ring.table.len()
        );
        Ok(event_ring)
    }

    fn write_entry(&mut self, entry: usize, segment: usize) {
        self.table[entry] = EventRingSte {
            address: self.ring.segments()[segment].phys,
            size: TRBS_PER_SEGMENT as u16,
        };
        debug!(
            "erst entry {}: seg_addr {:#x} seg_size {}",
            entry, self.table[entry].address, self.table[entry].size
        );
    }

    pub fn state(&self) -> EventRingState {
        self.state
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn entries(&self) -> &[EventRingSte] {
        &self.table
    }

    pub fn entries_in_use(&self) -> usize {
        self.entries_in_use
    }

    pub fn erst_base(&self) -> u64 {
        self.table_phys
    }

    pub fn ring_base(&self) -> u64 {
        self.ring.first_phys()
    }

    pub fn erdp(&self) -> u64 {
        self.ring.phys_of(self.ring.dequeue()) & 0xFFFF_FFFF_FFFF_FFF0
    }

    /// Writes one entry per event ring segment and hands the table to the
    /// interrupter.
    pub fn initialize_interrupter(&mut self, host: &dyn UsbHost) {
        if self.state != EventRingState::Live {
            error!("interrupter {} setup on a backed up event ring", self.interrupter);
            return;
        }

        let order = self.ring.cycle_order();
        for (entry, &segment) in order.iter().enumerate().take(self.table.len()) {
            self.write_entry(entry, segment);
        }
        self.entries_in_use = order.len().min(self.table.len());

        host.program_interrupter(InterrupterSetup {
            interrupter: self.interrupter,
            erst_size: self.entries_in_use as u16,
            erst_base: self.table_phys,
            erdp: self.erdp(),
        });
        host.clear_event_handler_busy(self.interrupter);
    }

    /// Writes entries for segments added since the last update. Existing entries
    /// are left untouched.
    pub fn update_erst(&mut self) -> Result<(), AllocError> {
        let count = self.ring.segment_count();
        if count > self.table.len() {
            error!(
                "event ring has {} segments, erst only {} entries",
                count,
                self.table.len()
            );
            return Err(AllocError::OutOfSlots);
        }

        let order = self.ring.cycle_order();
        for entry in self.entries_in_use..count {
            self.write_entry(entry, order[entry]);
        }
        self.entries_in_use = count;
        Ok(())
    }

    /// Adds a caller-supplied segment to the event ring.
    pub fn expand(&mut self, phys: u64, virt: u64) -> Result<usize, AllocError> {
        if self.ring.segment_count() >= self.table.len() {
            return Err(AllocError::OutOfSlots);
        }
        let index = expand_ring(&mut self.ring, phys, virt);
        self.update_erst()?;
        Ok(index)
    }

    /// Saves the table and ring, then powers the SRAM bank off.
    pub fn power_down(
        &mut self,
        allocator: &mut RegionAllocator,
        soc: &dyn SocControl,
    ) -> Result<(), AllocError> {
        if self.state == EventRingState::BackedUp {
            return Ok(());
        }
        let backup = self.backup.as_mut().ok_or(AllocError::NotAllocated)?;

        backup.table.clear();
        backup.table.extend_from_slice(&self.table);
        backup.segments.clear();
        for segment in self.ring.segments() {
            backup.segments.push(segment.trbs.clone());
        }

        // Whatever sits in SRAM does not survive the power cycle.
        if self.ring.class() == Some(MemoryClass::Sram) {
            for segment in self.ring.segments_mut() {
                for trb in segment.trbs.iter_mut() {
                    *trb = Trb::default();
                }
            }
        }
        if allocator.class_of(self.table_phys) == Some(MemoryClass::Sram) {
            for entry in self.table.iter_mut() {
                *entry = EventRingSte::default();
            }
        }

        allocator.set_sram_power(false);
        soc.sram_power(false);
        self.state = EventRingState::BackedUp;
        debug!("event ring backed up, {} segment(s)", self.ring.segment_count());
        Ok(())
    }

    /// Powers SRAM back on and restores the saved table and ring.
    pub fn power_up_and_restore(
        &mut self,
        allocator: &mut RegionAllocator,
        soc: &dyn SocControl,
    ) -> Result<(), AllocError> {
        if self.state == EventRingState::Live {
            return Ok(());
        }
        let backup = self.backup.as_ref().ok_or(AllocError::NotAllocated)?;

        soc.sram_power(true);
        allocator.set_sram_power(true);

        self.table.copy_from_slice(&backup.table);
        for (segment, saved) in self.ring.segments_mut().iter_mut().zip(backup.segments.iter()) {
            segment.trbs.copy_from_slice(saved);
        }
        self.state = EventRingState::Live;
        debug!("event ring restored");
        Ok(())
    }

    pub fn free(self, allocator: &mut RegionAllocator) {
        if let Err(err) = allocator.free(self.table_buffer) {
            error!("failed to free event ring segment table: {}", err);
        }
        free_ring(allocator, self.ring);
    }
}
