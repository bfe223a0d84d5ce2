//! USB audio and HID offload to an audio DSP
//!
//! This crate lets a low-power audio DSP drive isochronous USB audio streams and a
//! HID interrupt endpoint pair while the application processor sleeps. It places
//! the XHCI structures the DSP touches (transfer rings, the offload event ring and
//! its segment table, URB buffers) in reserved DRAM or SRAM windows, tells the DSP
//! where everything lives, and hands endpoints back and forth between the host
//! controller driver and the DSP.
//!
//! The embedding driver supplies the USB host stack through [`host::UsbHost`], the
//! SoC platform through [`host::SocControl`] and the DSP mailbox through
//! [`ipc::DspLink`], then drives everything through [`OffloadDevice`].

pub mod config;
pub mod device;
pub mod error;
pub mod hid;
pub mod host;
pub mod ipc;
pub mod memory;
pub mod stream;
pub mod timeout;
pub mod vendor;
pub mod xhci;

pub use crate::config::OffloadConfig;
pub use crate::device::{OffloadDevice, OffloadMode};
pub use crate::error::{AllocError, IpcError, OffloadError, RingError, StreamError};
pub use crate::hid::{HidFlags, UrbDisposition};
pub use crate::stream::{StreamParams, StreamState};
