//! Per-connection idle-timeout tracking backed by a monotonic `timerfd`.
//!
//! A session timer is always armed relative to now, recurring with the idle
//! interval. A zero interval leaves the timer disarmed: the session never
//! expires.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use parking_lot::Mutex;

use crate::connection::SessionId;
use crate::error::XnetError;

/// Idle-timeout state of one connection.
pub struct Session {
    id: SessionId,
    timer: TimerFd,
    interval: Duration,
    deadline: Mutex<Option<Instant>>,
}

impl Session {
    /// Create a session and arm its timer for `interval` from now.
    pub fn new(id: SessionId, interval: Duration) -> Result<Self, XnetError> {
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(|source| XnetError::Create {
            what: "session timer",
            source,
        })?;

        let session = Self {
            id,
            timer,
            interval,
            deadline: Mutex::new(None),
        };
        session.rearm()?;
        Ok(session)
    }

    /// Session identifier, unique for the lifetime of the server.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Configured idle interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Instant at which the timer next fires, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    /// Raw descriptor of the timer, used to route readiness events.
    pub fn timer_fd(&self) -> RawFd {
        self.timer.as_fd().as_raw_fd()
    }

    /// Re-arm the timer for a full interval from now.
    ///
    /// Resetting the timer also clears any expiration that has not been
    /// acknowledged yet.
    pub fn rearm(&self) -> Result<(), XnetError> {
        let mut deadline = self.deadline.lock();
        if self.interval.is_zero() {
            *deadline = None;
            return Ok(());
        }

        let spec = TimeSpec::from_duration(self.interval);
        self.timer
            .set(
                Expiration::IntervalDelayed(spec, spec),
                TimerSetTimeFlags::empty(),
            )
            .map_err(|source| XnetError::Timer { op: "arm", source })?;
        *deadline = Some(Instant::now() + self.interval);
        Ok(())
    }

    /// Consume pending expirations.
    ///
    /// Returns `false` if nothing has expired, which happens when the timer
    /// was re-armed after its readiness event was reported.
    pub fn acknowledge(&self) -> Result<bool, XnetError> {
        match self.timer.wait() {
            Ok(()) => {
                let mut deadline = self.deadline.lock();
                if deadline.is_some() {
                    *deadline = Some(Instant::now() + self.interval);
                }
                Ok(true)
            }
            Err(Errno::EAGAIN) => Ok(false),
            Err(source) => Err(XnetError::Timer {
                op: "acknowledge",
                source,
            }),
        }
    }
}

impl AsFd for Session {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.timer.as_fd()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("timer_fd", &self.timer_fd())
            .field("interval", &self.interval)
            .finish()
    }
}
