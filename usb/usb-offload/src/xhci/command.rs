use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{trace, warn};

use super::trb::{Trb, TrbCompletionCode, TrbType};
use crate::error::RingError;
use crate::host::UsbHost;
use crate::timeout::Timeout;

/// Endpoint commands the offload engine needs while taking an endpoint away from
/// the controller driver or handing it back.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointCommand {
    StopEndpoint { slot: u8, endpoint: u8, suspend: bool },
    /// `pointer` carries the dequeue cycle state in bit 0.
    SetTrDequeue { slot: u8, endpoint: u8, pointer: u64 },
}

impl EndpointCommand {
    pub fn slot(&self) -> u8 {
        match *self {
            Self::StopEndpoint { slot, .. } | Self::SetTrDequeue { slot, .. } => slot,
        }
    }

    pub fn endpoint(&self) -> u8 {
        match *self {
            Self::StopEndpoint { endpoint, .. } | Self::SetTrDequeue { endpoint, .. } => endpoint,
        }
    }

    /// Command TRB for the command ring. Endpoint indices are converted to DCI.
    pub fn to_trb(&self, cycle: bool) -> Trb {
        let mut trb = Trb::default();
        match *self {
            Self::StopEndpoint {
                slot,
                endpoint,
                suspend,
            } => trb.set(
                0,
                0,
                (u32::from(slot) << 24)
                    | (u32::from(suspend) << 23)
                    | ((u32::from(endpoint + 1) & 0x1F) << 16)
                    | ((TrbType::StopEndpoint as u32) << 10)
                    | u32::from(cycle),
            ),
            Self::SetTrDequeue {
                slot,
                endpoint,
                pointer,
            } => trb.set(
                pointer & 0xFFFF_FFFF_FFFF_FFF1,
                0,
                (u32::from(slot) << 24)
                    | ((u32::from(endpoint + 1) & 0x1F) << 16)
                    | ((TrbType::SetTrDequeuePointer as u32) << 10)
                    | u32::from(cycle),
            ),
        }
        trb
    }
}

/// One-shot completion signalled by the controller's command completion event.
#[derive(Clone, Default)]
pub struct CommandCompletion {
    inner: Arc<(Mutex<Option<TrbCompletionCode>>, Condvar)>,
}

impl CommandCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self, code: TrbCompletionCode) {
        let (code_slot, condvar) = &*self.inner;
        *code_slot.lock().unwrap() = Some(code);
        condvar.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        self.inner.0.lock().unwrap().is_some()
    }

    pub fn wait(&self, duration: Duration) -> Result<TrbCompletionCode, RingError> {
        let timeout = Timeout::new(duration);
        let (code_slot, condvar) = &*self.inner;
        let mut code = code_slot.lock().unwrap();
        loop {
            if let Some(code) = *code {
                return Ok(code);
            }
            if timeout.expired() {
                return Err(RingError::CommandTimeout);
            }
            code = condvar.wait_timeout(code, timeout.remaining()).unwrap().0;
        }
    }
}

/// Submits `command` and waits for its completion.
pub fn issue_command(
    host: &dyn UsbHost,
    command: EndpointCommand,
    duration: Duration,
) -> Result<(), RingError> {
    let completion = CommandCompletion::new();
    trace!("issuing {:?}", command);
    host.submit_command(command, completion.clone());

    match completion.wait(duration)? {
        TrbCompletionCode::Success => Ok(()),
        // Stopping an endpoint that is already stopped leaves it where we want it.
        TrbCompletionCode::ContextState
            if matches!(command, EndpointCommand::StopEndpoint { .. }) =>
        {
            warn!("{:?}: endpoint already stopped", command);
            Ok(())
        }
        code => Err(RingError::CommandFailed(code)),
    }
}
