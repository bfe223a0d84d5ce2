use thiserror::Error;

use crate::xhci::TrbCompletionCode;

// Linux errno values, which is what the offload control node reports to user space.
const EPERM: i32 = 1;
const EIO: i32 = 5;
const ENOMEM: i32 = 12;
const EFAULT: i32 = 14;
const EBUSY: i32 = 16;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;
const ETIMEDOUT: i32 = 110;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum AllocError {
    #[error("no free buffer descriptor left in the pool")]
    OutOfSlots,

    #[error("requested size {0} does not fit the memory window")]
    SizeTooLarge(usize),

    #[error("no free extent of {0} bytes left in the memory window")]
    OutOfMemory(usize),

    #[error("buffer is not allocated")]
    NotAllocated,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum IpcError {
    #[error("timed out waiting for the DSP acknowledgement")]
    Timeout,

    #[error("DSP rejected the message with status {0}")]
    RemoteRejected(i32),

    #[error("IPC transport is down")]
    TransportDown,

    #[error("failed to encode the message payload")]
    Encode,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum RingError {
    #[error("ring position {0:#x} does not belong to the ring")]
    RelocationFailed(u64),

    #[error("endpoint command did not complete in time")]
    CommandTimeout,

    #[error("endpoint command failed with completion code {0:?}")]
    CommandFailed(TrbCompletionCode),

    #[error("endpoint has no transfer ring")]
    NoRing,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum StreamError {
    #[error("invalid stream parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("ring buffer of {ring_bytes} bytes (x10) cannot hold a PCM period of {pcm_bytes} bytes (x10)")]
    InsufficientRingCapacity { ring_bytes: u64, pcm_bytes: u64 },

    #[error("stream already enabled")]
    AlreadyEnabled,

    #[error("stream already disabled")]
    AlreadyDisabled,

    #[error("USB audio device is gone")]
    DeviceGone,

    #[error("DSP has not been initialized")]
    NotInitialized,

    #[error("allocation failed: {0}")]
    Alloc(#[from] AllocError),

    #[error("IPC failed: {0}")]
    Ipc(#[from] IpcError),

    #[error("ring operation failed: {0}")]
    Ring(#[from] RingError),
}

/// Errors crossing the offload control surface.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum OffloadError {
    #[error("DSP already initialized")]
    AlreadyInitialized,

    #[error("DSP not initialized")]
    NotInitialized,

    #[error("no USB audio device connected")]
    NotConnected,

    #[error("device not supported for offload: {0}")]
    Unsupported(&'static str),

    #[error("secure monitor call returned {0}")]
    Platform(i32),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Ring(#[from] RingError),
}

impl OffloadError {
    /// The negative status reported at the control boundary.
    pub fn status(&self) -> i32 {
        let errno = match self {
            Self::AlreadyInitialized => EBUSY,
            Self::NotInitialized => EFAULT,
            Self::NotConnected => ENODEV,
            Self::Unsupported(_) => ENODEV,
            Self::Platform(status) if *status < 0 => return *status,
            Self::Platform(_) => EIO,
            Self::Stream(err) => match err {
                StreamError::InvalidParameter(_) => EINVAL,
                StreamError::InsufficientRingCapacity { .. } => EFAULT,
                StreamError::AlreadyEnabled | StreamError::AlreadyDisabled => EBUSY,
                StreamError::DeviceGone => ENODEV,
                StreamError::NotInitialized => EFAULT,
                StreamError::Alloc(_) => ENOMEM,
                StreamError::Ipc(err) => return Self::Ipc(*err).status(),
                StreamError::Ring(err) => return Self::Ring(*err).status(),
            },
            Self::Alloc(_) => ENOMEM,
            Self::Ipc(IpcError::Timeout) => ETIMEDOUT,
            Self::Ipc(IpcError::RemoteRejected(status)) if *status < 0 => return *status,
            Self::Ipc(_) => EIO,
            Self::Ring(RingError::CommandTimeout) => ETIMEDOUT,
            Self::Ring(RingError::NoRing) => EPERM,
            Self::Ring(_) => EIO,
        };
        -errno
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(OffloadError::AlreadyInitialized.status(), -EBUSY);
        assert_eq!(
            OffloadError::from(StreamError::InvalidParameter("bit depth")).status(),
            -EINVAL
        );
        assert_eq!(
            OffloadError::from(StreamError::Alloc(AllocError::OutOfSlots)).status(),
            -ENOMEM
        );
        assert_eq!(OffloadError::from(IpcError::RemoteRejected(-71)).status(), -71);
        assert_eq!(OffloadError::from(IpcError::RemoteRejected(3)).status(), -EIO);
        assert_eq!(
            OffloadError::from(StreamError::Ipc(IpcError::Timeout)).status(),
            -ETIMEDOUT
        );
    }
}
