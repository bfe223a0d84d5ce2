use std::fmt;

/// TRB types the offload engine writes or inspects.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TrbType {
    Reserved = 0,
    Normal = 1,
    Isoch = 5,
    Link = 6,
    NoOp = 8,
    StopEndpoint = 15,
    SetTrDequeuePointer = 16,
    Transfer = 32,
    CommandCompletion = 33,
}

/// Completion codes an endpoint command can finish with.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TrbCompletionCode {
    Invalid = 0x00,
    Success = 0x01,
    Trb = 0x05,
    SlotNotEnabled = 0x0B,
    EndpointNotEnabled = 0x0C,
    Parameter = 0x11,
    ContextState = 0x13,
    CommandRingStopped = 0x18,
    CommandAborted = 0x19,
    Stopped = 0x1A,
}

/// A Transfer Request Block as laid out in ring memory.
#[repr(C)]
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct Trb {
    pub data_low: u32,
    pub data_high: u32,
    pub status: u32,
    pub control: u32,
}

pub const TRB_SIZE: usize = 16;

pub const TRB_CONTROL_CYCLE_BIT: u32 = 1 << 0;
pub const TRB_CONTROL_TOGGLE_BIT: u32 = 1 << 1;

pub const TRB_CONTROL_TRB_TYPE_SHIFT: u8 = 10;
pub const TRB_CONTROL_TRB_TYPE_MASK: u32 = 0x0000_FC00;

impl Trb {
    pub fn set(&mut self, data: u64, status: u32, control: u32) {
        self.data_low = data as u32;
        self.data_high = (data >> 32) as u32;
        self.status = status;
        self.control = control;
    }

    pub fn reserved(&mut self, cycle: bool) {
        self.set(0, 0, ((TrbType::Reserved as u32) << TRB_CONTROL_TRB_TYPE_SHIFT) | (cycle as u32));
    }

    pub fn read_data(&self) -> u64 {
        (self.data_low as u64) | ((self.data_high as u64) << 32)
    }

    pub fn trb_type(&self) -> u8 {
        ((self.control & TRB_CONTROL_TRB_TYPE_MASK) >> TRB_CONTROL_TRB_TYPE_SHIFT) as u8
    }

    pub fn is_link(&self) -> bool {
        self.trb_type() == TrbType::Link as u8
    }

    pub fn cycle(&self) -> bool {
        self.control & TRB_CONTROL_CYCLE_BIT != 0
    }

    pub fn set_cycle(&mut self, cycle: bool) {
        if cycle {
            self.control |= TRB_CONTROL_CYCLE_BIT;
        } else {
            self.control &= !TRB_CONTROL_CYCLE_BIT;
        }
    }

    pub fn toggle(&self) -> bool {
        self.is_link() && self.control & TRB_CONTROL_TOGGLE_BIT != 0
    }

    pub fn set_toggle(&mut self, toggle: bool) {
        if toggle {
            self.control |= TRB_CONTROL_TOGGLE_BIT;
        } else {
            self.control &= !TRB_CONTROL_TOGGLE_BIT;
        }
    }

    pub fn link(&mut self, address: u64, toggle: bool, cycle: bool) {
        self.set(
            address,
            0,
            ((TrbType::Link as u32) << TRB_CONTROL_TRB_TYPE_SHIFT) | ((toggle as u32) << 1) | (cycle as u32),
        );
    }

    /// Re-points a link TRB without touching its cycle or toggle bits.
    pub fn relink(&mut self, address: u64) {
        self.data_low = address as u32;
        self.data_high = (address >> 32) as u32;
    }

    /// Little-endian image of the TRB, the way the controller and the DSP read it.
    pub fn to_bytes(&self) -> [u8; TRB_SIZE] {
        let mut bytes = [0; TRB_SIZE];
        bytes[0..4].copy_from_slice(&self.data_low.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.data_high.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.status.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.control.to_le_bytes());
        bytes
    }
}

impl fmt::Debug for Trb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Trb {{ data: {:>016X}, status: {:>08X}, control: {:>08X} }}",
            self.read_data(),
            self.status,
            self.control
        )
    }
}
