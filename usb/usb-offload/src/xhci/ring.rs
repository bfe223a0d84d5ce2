use log::{debug, error, trace};

use super::trb::{Trb, TRB_SIZE};
use crate::error::{AllocError, RingError};
use crate::memory::{BufferCategory, BufferHandle, MemoryClass, RegionAllocator};

pub const TRBS_PER_SEGMENT: usize = 256;
pub const SEGMENT_SIZE: usize = TRBS_PER_SEGMENT * TRB_SIZE;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RingKind {
    Control,
    Bulk,
    Isoch,
    Interrupt,
    Command,
    Event,
}

pub struct RingSegment {
    pub trbs: Box<[Trb]>,
    pub phys: u64,
    pub virt: u64,
    /// Index of the following segment in the cycle.
    pub next: usize,
    /// Set when the segment memory came from the region allocator.
    pub buffer: Option<BufferHandle>,
}

impl RingSegment {
    fn new(phys: u64, virt: u64, buffer: Option<BufferHandle>) -> Self {
        Self {
            trbs: vec![Trb::default(); TRBS_PER_SEGMENT].into_boxed_slice(),
            phys,
            virt,
            next: 0,
            buffer,
        }
    }

    fn contains(&self, phys: u64) -> bool {
        phys >= self.phys && phys < self.phys + SEGMENT_SIZE as u64
    }

    fn link_trb(&mut self) -> &mut Trb {
        &mut self.trbs[TRBS_PER_SEGMENT - 1]
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RingPosition {
    pub segment: usize,
    pub slot: usize,
}

impl RingPosition {
    const START: RingPosition = RingPosition {
        segment: 0,
        slot: 0,
    };
}

pub struct Ring {
    segments: Vec<RingSegment>,
    kind: RingKind,
    enqueue: RingPosition,
    dequeue: RingPosition,
    cycle: bool,
    initial_cycle: bool,
    pub max_packet: u16,
    pub bounce_buf_len: usize,
    /// Memory the builder placed the ring in; `None` for rings owned by the host.
    class: Option<MemoryClass>,
}

impl Ring {
    fn from_segments(
        segments: Vec<RingSegment>,
        cycle_state: u32,
        kind: RingKind,
        max_packet: u16,
        class: Option<MemoryClass>,
    ) -> Self {
        let mut ring = Ring {
            segments,
            kind,
            enqueue: RingPosition::START,
            dequeue: RingPosition::START,
            cycle: cycle_state != 0,
            initial_cycle: cycle_state != 0,
            max_packet,
            bounce_buf_len: max_packet as usize,
            class,
        };
        let count = ring.segments.len();
        for (i, segment) in ring.segments.iter_mut().enumerate() {
            segment.next = (i + 1) % count;
        }
        ring.write_links();
        ring
    }

    /// A ring in memory the host controller driver allocated itself, laid out as
    /// `segment_count` consecutive segments from `phys`.
    pub fn native(segment_count: usize, cycle_state: u32, kind: RingKind, max_packet: u16, phys: u64) -> Ring {
        let segments = (0..segment_count.max(1))
            .map(|i| {
                let offset = (i * SEGMENT_SIZE) as u64;
                RingSegment::new(phys + offset, phys + offset, None)
            })
            .collect();
        Self::from_segments(segments, cycle_state, kind, max_packet, None)
    }

    fn has_links(&self) -> bool {
        self.kind != RingKind::Event
    }

    fn last_segment(&self) -> usize {
        self.segments
            .iter()
            .position(|segment| segment.next == 0)
            .unwrap_or(0)
    }

    /// Clears every TRB, then writes the link TRBs along the cycle with the toggle
    /// bit on the segment that wraps back to the first one.
    fn write_links(&mut self) {
        let initial_cycle = self.initial_cycle;
        for segment in self.segments.iter_mut() {
            for trb in segment.trbs.iter_mut() {
                *trb = Trb::default();
            }
        }
        if self.has_links() {
            let last = self.last_segment();
            for i in 0..self.segments.len() {
                let next = self.segments[i].next;
                let next_phys = self.segments[next].phys;
                self.segments[i].link_trb().link(next_phys, i == last, false);
            }
        }
        // Producer owns a TRB once its cycle bit matches; a zero cycle state must
        // therefore start with every bit set.
        if !initial_cycle {
            for segment in self.segments.iter_mut() {
                for trb in segment.trbs.iter_mut() {
                    trb.set_cycle(true);
                }
            }
        }
    }

    pub fn kind(&self) -> RingKind {
        self.kind
    }

    pub fn class(&self) -> Option<MemoryClass> {
        self.class
    }

    pub fn is_native(&self) -> bool {
        self.class.is_none()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[RingSegment] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut [RingSegment] {
        &mut self.segments
    }

    /// Segment indices in link order, starting at the first segment.
    pub fn cycle_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.segments.len());
        let mut i = 0;
        loop {
            order.push(i);
            i = self.segments[i].next;
            if i == 0 || order.len() > self.segments.len() {
                break;
            }
        }
        order
    }

    pub fn is_closed(&self) -> bool {
        let order = self.cycle_order();
        order.len() == self.segments.len() && self.segments[*order.last().unwrap_or(&0)].next == 0
    }

    pub fn cycle(&self) -> bool {
        self.cycle
    }

    pub fn enqueue(&self) -> RingPosition {
        self.enqueue
    }

    pub fn dequeue(&self) -> RingPosition {
        self.dequeue
    }

    pub fn first_phys(&self) -> u64 {
        self.segments[0].phys
    }

    pub fn phys_of(&self, position: RingPosition) -> u64 {
        self.segments[position.segment].phys + (position.slot * TRB_SIZE) as u64
    }

    pub fn position_of(&self, phys: u64) -> Option<RingPosition> {
        if phys % TRB_SIZE as u64 != 0 {
            return None;
        }
        self.segments
            .iter()
            .position(|segment| segment.contains(phys))
            .map(|segment| RingPosition {
                segment,
                slot: ((phys - self.segments[segment].phys) as usize) / TRB_SIZE,
            })
    }

    /// Enqueue pointer with the cycle state in bit 0, the format of a dequeue
    /// pointer register or a Set TR Dequeue Pointer command.
    pub fn register(&self) -> u64 {
        self.phys_of(self.enqueue) | self.cycle as u64
    }

    /// Moves the enqueue pointer to a position reported by the other side of the
    /// ring. Bit 0 of `pointer` carries the cycle state; the ring is left empty.
    pub fn relocate_enqueue(&mut self, pointer: u64) -> Result<(), RingError> {
        let phys = pointer & !0xF;
        let position = self
            .position_of(phys)
            .ok_or(RingError::RelocationFailed(phys))?;
        let mut cycle = pointer & 1 != 0;
        let position = if self.has_links() && position.slot == TRBS_PER_SEGMENT - 1 {
            // The link TRB is never a valid stopping point.
            let segment = &self.segments[position.segment];
            if segment.trbs[position.slot].toggle() {
                cycle = !cycle;
            }
            RingPosition {
                segment: segment.next,
                slot: 0,
            }
        } else {
            position
        };
        self.enqueue = position;
        self.dequeue = position;
        self.cycle = cycle;
        debug!("relocated {:?} ring enqueue to {:#x}", self.kind, self.register());
        Ok(())
    }

    /// Zeroes the ring and restores link TRBs and pointers.
    pub fn reinitialize(&mut self, cycle_state: u32) {
        self.initial_cycle = cycle_state != 0;
        self.cycle = self.initial_cycle;
        self.enqueue = RingPosition::START;
        self.dequeue = RingPosition::START;
        self.write_links();
    }

    pub fn next(&mut self) -> (&mut Trb, bool) {
        let mut position;
        let mut cycle;
        loop {
            position = self.enqueue;
            cycle = self.cycle;
            let next_segment = self.segments[position.segment].next;

            if self.has_links() && position.slot == TRBS_PER_SEGMENT - 1 {
                let link = self.segments[position.segment].link_trb();
                link.set_cycle(cycle);
                if link.toggle() {
                    trace!("{:?} ring wrapped", self.kind);
                    self.cycle = !self.cycle;
                }
                self.enqueue = RingPosition {
                    segment: next_segment,
                    slot: 0,
                };
                continue;
            }

            if position.slot + 1 < TRBS_PER_SEGMENT {
                self.enqueue.slot += 1;
            } else {
                // Event rings have no link TRBs and wrap after the last segment.
                if next_segment == 0 {
                    self.cycle = !self.cycle;
                }
                self.enqueue = RingPosition {
                    segment: next_segment,
                    slot: 0,
                };
            }
            break;
        }

        (
            &mut self.segments[position.segment].trbs[position.slot],
            cycle,
        )
    }
}

/// Builds a ring of `segment_count` one-segment buffers linked in allocation order.
pub fn build_ring(
    allocator: &mut RegionAllocator,
    segment_count: usize,
    cycle_state: u32,
    kind: RingKind,
    max_packet: u16,
    class: MemoryClass,
) -> Result<Ring, AllocError> {
    let category = if kind == RingKind::Event {
        BufferCategory::EventRing
    } else {
        BufferCategory::TransferRing
    };

    let mut segments: Vec<RingSegment> = Vec::with_capacity(segment_count);
    for _ in 0..segment_count.max(1) {
        let allocated = allocator
            .allocate(SEGMENT_SIZE, SEGMENT_SIZE as u64, class, true, category)
            .and_then(|handle| {
                allocator
                    .buffer(handle)
                    .copied()
                    .map(|buffer| (handle, buffer))
                    .ok_or(AllocError::NotAllocated)
            });
        match allocated {
            Ok((handle, buffer)) => {
                segments.push(RingSegment::new(buffer.phys, buffer.virt, Some(handle)))
            }
            Err(err) => {
                error!(
                    "failed to allocate segment {} of {:?} ring: {}",
                    segments.len(),
                    kind,
                    err
                );
                for segment in segments {
                    if let Some(handle) = segment.buffer {
                        let _ = allocator.free(handle);
                    }
                }
                return Err(err);
            }
        }
    }

    let placed = segments
        .first()
        .and_then(|segment| allocator.class_of(segment.phys))
        .unwrap_or(class);
    if kind != RingKind::Event {
        allocator.note_ring_built(placed);
    }

    let ring = Ring::from_segments(segments, cycle_state, kind, max_packet, Some(placed));
    debug!(
        "built {:?} ring: {} segment(s) at {:#x} in {}",
        kind,
        ring.segment_count(),
        ring.first_phys(),
        placed
    );
    Ok(ring)
}

/// Inserts a caller-supplied segment right after the enqueue segment and returns its
/// index.
pub fn expand_ring(ring: &mut Ring, phys: u64, virt: u64) -> usize {
    let after = ring.enqueue.segment;
    let index = ring.segments.len();
    let mut segment = RingSegment::new(phys, virt, None);
    segment.next = ring.segments[after].next;
    // Not yet owned by the producer.
    let cycle = !ring.cycle;
    for trb in segment.trbs.iter_mut() {
        trb.set_cycle(cycle);
    }

    if ring.has_links() {
        let next_phys = ring.segments[segment.next].phys;
        let moved_toggle = ring.segments[after].link_trb().toggle();
        segment.link_trb().link(next_phys, moved_toggle, cycle);

        let link = ring.segments[after].link_trb();
        link.relink(phys);
        link.set_toggle(false);
    }

    ring.segments.push(segment);
    ring.segments[after].next = index;
    debug!(
        "expanded {:?} ring after segment {} with {:#x}, {} segments",
        ring.kind,
        after,
        phys,
        ring.segments.len()
    );
    index
}

/// Unlinks a previously inserted segment. The first segment cannot be removed.
pub fn remove_segment(ring: &mut Ring, index: usize) -> Option<RingSegment> {
    if index == 0 || index >= ring.segments.len() {
        return None;
    }
    let prev = ring.segments.iter().position(|segment| segment.next == index)?;
    let next = ring.segments[index].next;

    if ring.has_links() {
        let toggle = ring.segments[index].link_trb().toggle();
        let next_phys = ring.segments[next].phys;
        let link = ring.segments[prev].link_trb();
        link.relink(next_phys);
        if toggle {
            link.set_toggle(true);
        }
    }
    ring.segments[prev].next = next;

    for pointer in [&mut ring.enqueue, &mut ring.dequeue].iter_mut() {
        if pointer.segment == index {
            **pointer = RingPosition {
                segment: next,
                slot: 0,
            };
        }
    }

    let removed = ring.segments.remove(index);
    let shift = |i: usize| if i > index { i - 1 } else { i };
    for segment in ring.segments.iter_mut() {
        segment.next = shift(segment.next);
    }
    ring.enqueue.segment = shift(ring.enqueue.segment);
    ring.dequeue.segment = shift(ring.dequeue.segment);

    debug!(
        "removed segment {:#x} from {:?} ring, {} segments",
        removed.phys,
        ring.kind,
        ring.segments.len()
    );
    Some(removed)
}

/// Returns allocator-owned segments to the allocator. Caller-supplied segments stay
/// with their owner.
pub fn free_ring(allocator: &mut RegionAllocator, ring: Ring) {
    for segment in ring.segments.iter() {
        if let Some(handle) = segment.buffer {
            if let Err(err) = allocator.free(handle) {
                error!("failed to free ring segment {:#x}: {}", segment.phys, err);
            }
        }
    }
    if let (Some(class), true) = (ring.class, ring.kind != RingKind::Event) {
        allocator.note_ring_freed(class);
    }
}
