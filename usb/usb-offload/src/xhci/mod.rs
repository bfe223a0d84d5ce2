//! XHCI data structures shared between the host controller and the DSP: TRBs,
//! transfer rings, the offload event ring and endpoint commands.

mod command;
mod event;
mod ring;
mod trb;

pub use self::command::{issue_command, CommandCompletion, EndpointCommand};
pub use self::event::{EventRing, EventRingState, EventRingSte, ERST_ENTRY_SIZE};
pub use self::ring::{
    build_ring, expand_ring, free_ring, remove_segment, Ring, RingKind, RingPosition,
    RingSegment, SEGMENT_SIZE, TRBS_PER_SEGMENT,
};
pub use self::trb::{Trb, TrbCompletionCode, TrbType, TRB_SIZE};
