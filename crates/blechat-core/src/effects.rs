//! Effects emitted by the state machines
//!
//! A state machine never performs I/O. It returns effects in the order they
//! must be executed, and the runtime carries them out.

use std::time::Duration;

use crate::types::{Generation, ServiceKind};

/// Deferred actions a session may have pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    ConnectionTimeout,
    RetryBackoff,
    SettleDelay,
    ScanWindow,
    Rebind(ServiceKind),
}

/// A timer tagged with the generation that armed it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub kind: TimerKind,
    pub generation: Generation,
}

impl TimerToken {
    pub fn new(kind: TimerKind, generation: Generation) -> Self {
        Self { kind, generation }
    }
}

/// One step of work for the runtime
///
/// `C` is the radio command type of the session and `N` its notice type.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect<C, N> {
    /// Issue a command to the radio
    Radio(C),
    /// Issue a command whose answers belong to an earlier attempt
    ///
    /// Anything the radio reports in reply is tagged with `generation`
    /// instead of the session's current one.
    RadioFor { command: C, generation: Generation },
    /// Arm a timer, replacing any pending timer of the same kind
    StartTimer { timer: TimerToken, after: Duration },
    CancelTimer(TimerKind),
    /// Report something to the owner of the session
    Notify(N),
}

impl<C, N> Effect<C, N> {
    pub fn start_timer(kind: TimerKind, generation: Generation, after: Duration) -> Self {
        Effect::StartTimer {
            timer: TimerToken::new(kind, generation),
            after,
        }
    }

    pub fn radio(&self) -> Option<&C> {
        match self {
            Effect::Radio(command) | Effect::RadioFor { command, .. } => Some(command),
            _ => None,
        }
    }

    pub fn notice(&self) -> Option<&N> {
        match self {
            Effect::Notify(notice) => Some(notice),
            _ => None,
        }
    }
}
