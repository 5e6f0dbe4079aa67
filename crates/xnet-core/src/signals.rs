//! Termination signals delivered through a `signalfd`.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use nix::sys::signal::{SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use crate::error::XnetError;

/// Blocks `SIGINT` and `SIGQUIT` on the calling thread and exposes them as a
/// readable descriptor. The previous signal mask is restored on drop.
///
/// Threads spawned while the watch is alive inherit the blocked mask, so the
/// signals are only ever consumed through the descriptor.
pub(crate) struct SignalWatch {
    fd: SignalFd,
    previous: SigSet,
}

impl SignalWatch {
    pub(crate) fn new() -> Result<Self, XnetError> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGQUIT);

        let previous = mask
            .thread_swap_mask(SigmaskHow::SIG_BLOCK)
            .map_err(|source| XnetError::Create {
                what: "signal mask",
                source,
            })?;

        let fd = match SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        {
            Ok(fd) => fd,
            Err(source) => {
                let _ = previous.thread_set_mask();
                return Err(XnetError::Create {
                    what: "signalfd",
                    source,
                });
            }
        };

        Ok(Self { fd, previous })
    }

    /// Consume pending signals and report whether a termination signal was among them.
    pub(crate) fn termination_requested(&mut self) -> bool {
        let mut terminate = false;
        loop {
            match self.fd.read_signal() {
                Ok(Some(info)) => {
                    let signal = i32::try_from(info.ssi_signo)
                        .ok()
                        .and_then(|signo| Signal::try_from(signo).ok());
                    match signal {
                        Some(Signal::SIGINT | Signal::SIGQUIT) => {
                            tracing::info!(?signal, "Termination signal received");
                            terminate = true;
                        }
                        other => tracing::debug!(signal = ?other, "Ignoring signal"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Failed to read signalfd: {e}");
                    break;
                }
            }
        }
        terminate
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for SignalWatch {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for SignalWatch {
    fn drop(&mut self) {
        if let Err(e) = self.previous.thread_set_mask() {
            tracing::warn!("Failed to restore signal mask: {e}");
        }
    }
}
