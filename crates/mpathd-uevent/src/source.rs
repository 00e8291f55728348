use std::time::Duration;

use anyhow::Result;

use crate::event::RawUevent;

/// Outcome of waiting for the next notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollStatus {
    /// Data is ready; `recv` will not block.
    Ready,
    /// The timeout elapsed with nothing to read.
    TimedOut,
    /// The wait was interrupted by a signal; callers should retry.
    Interrupted,
}

/// Abstracts the kernel event source the listener drains.
///
/// Implementations must deliver notifications in emission order per
/// device. Errors returned from either method are fatal to the listener.
pub trait UeventSource {
    /// Wait up to `timeout` for the next notification.
    fn poll(&mut self, timeout: Duration) -> Result<PollStatus>;

    /// Receive the next notification. Called only after `poll` reported
    /// [`PollStatus::Ready`]; `Ok(None)` means the datagram was unusable
    /// or filtered out and should be skipped.
    fn recv(&mut self) -> Result<Option<RawUevent>>;
}
