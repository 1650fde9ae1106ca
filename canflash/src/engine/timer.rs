//! Timeout policy and the engine's single timer slot.

use std::{
    fmt,
    time::{Duration, Instant},
};

/// Per-phase timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeoutPolicy {
    /// Version query and pending link bring-up.
    pub receive: Duration,
    /// Erase acknowledgement.
    pub erase: Duration,
    /// Each chunk acknowledgement.
    pub upload: Duration,
    /// Confirm acknowledgement.
    pub confirm: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            receive: Duration::from_secs(5),
            erase: Duration::from_secs(5),
            upload: Duration::from_secs(5),
            confirm: Duration::from_secs(30),
        }
    }
}

impl TimeoutPolicy {
    /// Timeout for `purpose`.
    pub fn for_purpose(&self, purpose: TimerPurpose) -> Duration {
        match purpose {
            TimerPurpose::Connect | TimerPurpose::Version => self.receive,
            TimerPurpose::Erase => self.erase,
            TimerPurpose::Upload => self.upload,
            TimerPurpose::Confirm => self.confirm,
        }
    }
}

/// What an armed timer guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerPurpose {
    /// Pending link bring-up.
    Connect,
    /// Erase acknowledgement.
    Erase,
    /// Chunk acknowledgement.
    Upload,
    /// Confirm acknowledgement.
    Confirm,
    /// Version response.
    Version,
}

/// Identifies one arming of the timer. Expiries carrying an older token
/// are stale and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

impl TimerToken {
    /// Raw token value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The currently armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimer {
    /// Token delivered back on expiry.
    pub token: TimerToken,
    /// When it fires.
    pub deadline: Instant,
    /// What it guards.
    pub purpose: TimerPurpose,
}

/// At most one armed timer. Re-arming replaces the previous one.
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    armed: Option<ArmedTimer>,
    next: u64,
}

impl TimerSlot {
    pub(crate) fn arm(&mut self, purpose: TimerPurpose, timeout: Duration) -> ArmedTimer {
        self.next += 1;
        let timer = ArmedTimer {
            token: TimerToken(self.next),
            deadline: Instant::now() + timeout,
            purpose,
        };
        self.armed = Some(timer);
        timer
    }

    pub(crate) fn cancel(&mut self) {
        self.armed = None;
    }

    /// Take the timer if `token` is the one currently armed.
    pub(crate) fn fire(&mut self, token: TimerToken) -> Option<ArmedTimer> {
        if self.armed.is_some_and(|t| t.token == token) {
            self.armed.take()
        } else {
            None
        }
    }

    pub(crate) fn armed(&self) -> Option<&ArmedTimer> {
        self.armed.as_ref()
    }
}
