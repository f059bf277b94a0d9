//! Per-peer session state machines.
//!
//! A station holds one [`StationSession`] per remote unit, a remote unit holds
//! a single [`UnitSession`] bound to its station. Both are sans-IO: handling an
//! [`Event`] queues outbound [`Message`]s and [`Report`]s in a
//! [`SessionContext`] which the runtime drains afterwards.

mod station;
mod unit;

pub use station::{State as StationState, StationMachine, StationSession};
pub use unit::{State as UnitState, UnitMachine, UnitSession};

use std::{collections::VecDeque, fmt::Display, time::Instant};

use crate::{Address, Event, Message, Position, Report, TestState};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

/// Side data owned by the runtime and lent to a session for each dispatch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SessionContext {
    send_queue: VecDeque<Message>,
    report_queue: VecDeque<Report>,
    /// Own position (remote unit) or the peer's last reported one (station).
    pub position: Option<Position>,
}
impl SessionContext {
    pub(crate) fn transmit(&mut self, msg: Message) {
        self.send_queue.push_back(msg);
    }
    pub(crate) fn report(&mut self, report: Report) {
        self.report_queue.push_back(report);
    }
    pub fn poll_transmit(&mut self) -> Option<Message> {
        self.send_queue.pop_front()
    }
    pub fn poll_report(&mut self) -> Option<Report> {
        self.report_queue.pop_front()
    }
}

/// Point-in-time view of a session for upward consumers.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSummary {
    pub address: Option<Address>,
    pub connection: ConnectionState,
    /// `None` unless connected.
    pub test: Option<TestState>,
    pub position: Option<Position>,
    pub rssi: Option<i16>,
    pub snr: Option<i16>,
    pub last_heard: Option<Instant>,
}

/// What the runtime needs from either session flavour.
pub trait Session {
    /// The peer this session talks to, if known.
    fn peer(&self) -> Option<Address>;

    fn handle(&mut self, event: &Event);

    fn connection_state(&self) -> ConnectionState;

    fn test_state(&self) -> Option<TestState>;

    fn summary(&self) -> SessionSummary;

    fn poll_transmit(&mut self) -> Option<Message>;

    fn poll_report(&mut self) -> Option<Report>;
}
