use std::time::Instant;

use crate::{Message, TestConfig};

/// Events that drive a session state machine.
///
/// Received messages, timer ticks and application requests all arrive as
/// events, so a session is only ever mutated through its dispatch entry point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Begin the join handshake (remote unit).
    Start { now: Instant },

    /// A decoded message from the radio.
    Received { now: Instant, msg: Message },

    /// Periodic liveness check. Also drives `PING` cadence and `REQ`
    /// retransmission on the remote unit.
    Keepalive { now: Instant },

    /// Periodic check of time-scheduled test transitions, `unix` is the wall
    /// clock in epoch seconds.
    Schedule { now: Instant, unix: u64 },

    /// Application request to run a test on a connected unit (station).
    RequestTest { config: TestConfig },

    /// Application request to cancel whatever test the unit is running
    /// (station).
    CancelTest,

    /// Confirm a freshly accepted test configuration (remote unit, internal).
    Prepare,

    /// Test-specific progress to report to the station (remote unit).
    Progress { payload: String },

    /// The running test finished (remote unit).
    Complete,

    /// The running test aborted locally (remote unit).
    Abort { reason: String },

    /// Drop the session or connection on application request.
    Disconnect,

    /// The subsystem is being torn down.
    Shutdown,
}

/// Outcomes a session reports upward besides its state, drained by the
/// runtime after each dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Report {
    /// No keepalive traffic within the timeout, the session was dropped.
    TimedOut,
    /// The remote unit exhausted its `REQ` attempts.
    ConnectFailed,
    /// The remote unit restarted its handshake (station).
    Rejoined,
    /// `PREPR` confirmed the start time.
    Prepared { start_time: u64 },
    /// `BEGIN` was sent or received.
    Started(TestConfig),
    /// `UPD` payload.
    Progress(String),
    /// `DONE` was sent or received.
    Completed,
    /// `FAIL` was sent or received.
    Failed(String),
    /// A pending or running test was cancelled.
    Cancelled,
    /// A `TEST` was refused by the remote unit.
    Rejected(String),
}
