//! Lock-aware connection timers
//!
//! A [`Timer`] lives inside connection state and is only touched under the
//! socket lock. Arming it may spawn a sleeper task; the sleeper wakes, takes
//! the lock and asks the timer whether it really expired. Re-arming to a
//! later deadline reuses the running sleeper, re-arming earlier starts a
//! new one and the old sleeper notices its generation is stale.

use std::sync::Weak;
use std::time::Instant;

use crate::socket::{ConnHandle, Shared};

/// What a timer does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    /// Retransmit the send with this sequence number
    Resend(u16),
    /// Flush a delayed ST_STATE
    SendState,
    /// Nothing received for the idle period
    Idle,
    /// Wake blocked readers so they observe the deadline
    ReadDeadline,
    /// Wake blocked writers so they observe the deadline
    WriteDeadline,
}

/// Result of a sleeper checking in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerPoll {
    /// Sleeper was superseded or the timer stopped
    Stale,
    /// Timer was pushed back; sleep until this instant
    Pending(Instant),
    /// Deadline reached, run the action
    Expired,
}

#[derive(Debug, Default)]
pub(crate) struct Timer {
    deadline: Option<Instant>,
    sleeping_until: Option<Instant>,
    generation: u64,
}

impl Timer {
    /// Arm for `deadline`. Returns the generation of a sleeper that must be
    /// spawned, or None when the current sleeper wakes early enough.
    pub(crate) fn reset(&mut self, deadline: Instant) -> Option<u64> {
        self.deadline = Some(deadline);
        match self.sleeping_until {
            Some(wake) if wake <= deadline => None,
            _ => {
                self.generation += 1;
                self.sleeping_until = Some(deadline);
                Some(self.generation)
            }
        }
    }

    pub(crate) fn stop(&mut self) {
        self.deadline = None;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub(crate) fn poll(&mut self, generation: u64, now: Instant) -> TimerPoll {
        if generation != self.generation {
            return TimerPoll::Stale;
        }
        match self.deadline {
            None => {
                self.sleeping_until = None;
                TimerPoll::Stale
            }
            Some(deadline) if now < deadline => {
                self.sleeping_until = Some(deadline);
                TimerPoll::Pending(deadline)
            }
            Some(_) => {
                self.deadline = None;
                self.sleeping_until = None;
                TimerPoll::Expired
            }
        }
    }
}

/// Spawn a sleeper for a connection timer on its socket's runtime. A
/// connection whose socket is gone has nothing left to time.
pub(crate) fn spawn(
    shared: Weak<Shared>,
    conn: ConnHandle,
    kind: TimerKind,
    generation: u64,
    deadline: Instant,
) {
    let Some(runtime) = shared.upgrade().map(|socket| socket.runtime.clone()) else {
        tracing::trace!("Socket gone, not scheduling uTP timer {:?}", kind);
        return;
    };
    runtime.spawn(run(shared, conn, kind, generation, deadline));
}

async fn run(
    shared: Weak<Shared>,
    conn: ConnHandle,
    kind: TimerKind,
    generation: u64,
    mut deadline: Instant,
) {
    loop {
        tokio::time::sleep_until(deadline.into()).await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match shared.fire_timer(conn, kind, generation) {
            Some(next) => deadline = next,
            None => return,
        }
    }
}
