use std::time::Instant;

use statig::{
    Response,
    prelude::{InitializedStateMachine, IntoStateMachineExt as _},
    state_machine,
};
use tracing::{debug, info, trace, warn};

use crate::{
    Address, Config, Event, Message, MessageKind, Position, Report, SessionError, TestConfig,
    TestState,
    session::{ConnectionState, Session, SessionContext, SessionSummary},
};

/// Station-side view of one remote unit.
#[derive(Debug)]
pub struct StationSession {
    machine: InitializedStateMachine<StationMachine>,
    context: SessionContext,
    rssi: Option<i16>,
    snr: Option<i16>,
    last_heard: Option<Instant>,
}

impl StationSession {
    /// Creates the session for a unit whose join request was just received
    /// and answers it with `CON`.
    #[must_use]
    pub fn accept(config: Config, request: &Message, now: Instant) -> Self {
        let mut context = SessionContext::default();
        let machine = StationMachine {
            config,
            peer: request.sender,
            last_ping: None,
        }
        .uninitialized_state_machine()
        .init_with_context(&mut context);
        let mut session = Self {
            machine,
            context,
            rssi: None,
            snr: None,
            last_heard: None,
        };
        session.handle(&Event::Received {
            now,
            msg: request.clone(),
        });
        session
    }

    #[must_use]
    pub fn state(&self) -> &State {
        self.machine.state()
    }

    /// A closed session has been dropped and must be replaced, not reused.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.state(), State::Disconnected {})
    }

    /// Sends `TEST` to the unit.
    ///
    /// # Errors
    ///
    /// If the unit is not connected or already has a test.
    pub fn request_test(&mut self, config: TestConfig) -> Result<(), SessionError> {
        match self.test_state() {
            None => Err(SessionError::NotConnected(self.machine.peer)),
            Some(TestState::Idle) => {
                self.handle(&Event::RequestTest { config });
                Ok(())
            }
            Some(_) => Err(SessionError::TestInProgress(self.machine.peer)),
        }
    }

    /// Sends `CANC` whatever the local view of the unit's test phase.
    ///
    /// # Errors
    ///
    /// If the unit is not connected.
    pub fn cancel_test(&mut self) -> Result<(), SessionError> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(SessionError::NotConnected(self.machine.peer));
        }
        self.handle(&Event::CancelTest);
        Ok(())
    }
}

impl Session for StationSession {
    fn peer(&self) -> Option<Address> {
        Some(self.machine.peer)
    }

    fn handle(&mut self, event: &Event) {
        if let Event::Received { now, msg } = event {
            if msg.sender != self.machine.peer {
                debug!(address = %self.machine.peer, "ignoring message from {}", msg.sender);
                return;
            }
            if msg.receiver != self.machine.config.address && !msg.receiver.is_broadcast() {
                debug!(address = %self.machine.peer, "ignoring message for {}", msg.receiver);
                return;
            }
            self.rssi = msg.rssi;
            self.snr = msg.snr;
            self.last_heard = Some(*now);
        }
        self.machine.handle_with_context(event, &mut self.context);
    }

    fn connection_state(&self) -> ConnectionState {
        match self.state() {
            State::Disconnected {} => ConnectionState::Disconnected,
            State::Connecting { .. } => ConnectionState::Connecting,
            State::Idle {}
            | State::Configured { .. }
            | State::Prepared { .. }
            | State::Running { .. } => ConnectionState::Connected,
        }
    }

    fn test_state(&self) -> Option<TestState> {
        match self.state() {
            State::Disconnected {} | State::Connecting { .. } => None,
            State::Idle {} => Some(TestState::Idle),
            State::Configured { .. } => Some(TestState::Configured),
            State::Prepared { .. } => Some(TestState::Prepared),
            State::Running { .. } => Some(TestState::Running),
        }
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            address: Some(self.machine.peer),
            connection: self.connection_state(),
            test: self.test_state(),
            position: self.context.position,
            rssi: self.rssi,
            snr: self.snr,
            last_heard: self.last_heard,
        }
    }

    fn poll_transmit(&mut self) -> Option<Message> {
        self.context.poll_transmit()
    }

    fn poll_report(&mut self) -> Option<Report> {
        self.context.poll_report()
    }
}

#[derive(Debug, Clone)]
pub struct StationMachine {
    pub config: Config,
    pub peer: Address,
    last_ping: Option<Instant>,
}

impl StationMachine {
    fn send(&self, context: &mut SessionContext, kind: MessageKind, body: Option<String>) {
        let mut msg = Message::new(self.config.address, self.peer, kind);
        msg.body = body;
        trace!(address = %self.peer, "queueing {msg}");
        context.transmit(msg);
    }

    fn confirm(&self, context: &mut SessionContext) {
        self.send(
            context,
            MessageKind::Con,
            Some(self.config.address.to_string()),
        );
    }

    fn record_ping(&mut self, context: &mut SessionContext, now: Instant, msg: &Message) {
        self.last_ping = Some(now);
        if let Some(position) = msg.body.as_deref().and_then(Position::from_body) {
            context.position = Some(position);
        }
        self.send(context, MessageKind::Pingr, None);
    }

    fn expired(&self, now: Instant) -> bool {
        self.last_ping
            .is_none_or(|at| now.saturating_duration_since(at) >= self.config.ping_timeout)
    }

    fn rejoin(&mut self, context: &mut SessionContext, now: Instant) -> Response<State> {
        info!(address = %self.peer, "unit restarted its handshake");
        context.report(Report::Rejoined);
        self.last_ping = None;
        self.confirm(context);
        Response::Transition(State::connecting(now + self.config.ping_timeout))
    }

    fn on_connected_message(
        &mut self,
        context: &mut SessionContext,
        now: Instant,
        msg: &Message,
    ) -> Response<State> {
        match msg.kind {
            MessageKind::Ping => {
                self.record_ping(context, now, msg);
                Response::Handled
            }
            MessageKind::Req => self.rejoin(context, now),
            MessageKind::Upd => {
                let payload = msg.body.clone().unwrap_or_default();
                debug!(address = %self.peer, "progress: {payload}");
                context.report(Report::Progress(payload));
                Response::Handled
            }
            MessageKind::Done => {
                info!(address = %self.peer, "test done");
                context.report(Report::Completed);
                Response::Transition(State::idle())
            }
            MessageKind::Fail => {
                let reason = msg.body.clone().unwrap_or_default();
                warn!(address = %self.peer, "test failed: {reason}");
                context.report(Report::Failed(reason));
                Response::Transition(State::idle())
            }
            MessageKind::Cancd => {
                info!(address = %self.peer, "cancellation confirmed");
                context.report(Report::Cancelled);
                Response::Transition(State::idle())
            }
            MessageKind::Ack | MessageKind::Con => {
                debug!(address = %self.peer, "duplicate {}", msg.kind);
                Response::Handled
            }
            MessageKind::Prepr | MessageKind::Begin => {
                debug!(address = %self.peer, "stale {}, no test pending", msg.kind);
                Response::Handled
            }
            MessageKind::Pingr | MessageKind::Test | MessageKind::Canc => {
                warn!(address = %self.peer, "unexpected {} from a unit", msg.kind);
                Response::Handled
            }
        }
    }

    fn start(&self, context: &mut SessionContext, config: TestConfig) -> Response<State> {
        info!(address = %self.peer, %config, "test started");
        context.report(Report::Started(config));
        Response::Transition(State::running(config))
    }
}

#[state_machine(
    initial = "State::disconnected()",
    after_transition = "Self::after_transition",
    state(derive(Clone, Debug, PartialEq, Eq)),
    superstate(derive(Debug))
)]
impl StationMachine {
    fn after_transition(&mut self, prev: &State, next: &State) {
        trace!(
            address = %self.peer,
            "after transitioning from `{:?}` to `{:?}`",
            prev, next
        );
    }

    #[state]
    fn disconnected(&mut self, context: &mut SessionContext, event: &Event) -> Response<State> {
        match event {
            Event::Received { now, msg } if msg.kind == MessageKind::Req => {
                info!(address = %self.peer, "join request, confirming");
                self.confirm(context);
                Response::Transition(State::connecting(*now + self.config.ping_timeout))
            }
            _ => Response::Handled,
        }
    }

    #[state]
    fn connecting(
        &mut self,
        context: &mut SessionContext,
        event: &Event,
        expires_at: &Instant,
    ) -> Response<State> {
        match event {
            Event::Received { now, msg } => match msg.kind {
                MessageKind::Ack => {
                    info!(address = %self.peer, "connected");
                    self.last_ping = Some(*now);
                    Response::Transition(State::idle())
                }
                MessageKind::Ping => {
                    info!(address = %self.peer, "PING before ACK, treating as acknowledged");
                    self.record_ping(context, *now, msg);
                    Response::Transition(State::idle())
                }
                MessageKind::Req => {
                    debug!(address = %self.peer, "repeated join request");
                    self.confirm(context);
                    Response::Transition(State::connecting(*now + self.config.ping_timeout))
                }
                _ => {
                    debug!(address = %self.peer, "ignoring {} while connecting", msg.kind);
                    Response::Handled
                }
            },
            Event::Keepalive { now } if now >= expires_at => {
                warn!(address = %self.peer, "join never acknowledged, dropping session");
                context.report(Report::TimedOut);
                Response::Transition(State::disconnected())
            }
            Event::Disconnect | Event::Shutdown => Response::Transition(State::disconnected()),
            _ => Response::Handled,
        }
    }

    #[superstate]
    fn connected(&mut self, context: &mut SessionContext, event: &Event) -> Response<State> {
        match event {
            Event::Keepalive { now } if self.expired(*now) => {
                warn!(
                    address = %self.peer,
                    timeout = ?self.config.ping_timeout,
                    "no PING within timeout, disconnecting"
                );
                context.report(Report::TimedOut);
                Response::Transition(State::disconnected())
            }
            Event::Received { now, msg } => self.on_connected_message(context, *now, msg),
            Event::CancelTest => {
                info!(address = %self.peer, "cancelling test");
                self.send(context, MessageKind::Canc, None);
                Response::Transition(State::idle())
            }
            Event::RequestTest { config } => {
                warn!(address = %self.peer, %config, "test already in progress, not sending");
                Response::Handled
            }
            Event::Disconnect | Event::Shutdown => {
                info!(address = %self.peer, "session closed");
                Response::Transition(State::disconnected())
            }
            _ => Response::Handled,
        }
    }

    #[state(superstate = "connected")]
    fn idle(&mut self, context: &mut SessionContext, event: &Event) -> Response<State> {
        match event {
            Event::RequestTest { config } => {
                info!(address = %self.peer, %config, "sending test configuration");
                self.send(context, MessageKind::Test, Some(config.to_string()));
                Response::Transition(State::configured(*config))
            }
            _ => Response::Super,
        }
    }

    #[state(superstate = "connected")]
    fn configured(
        &mut self,
        context: &mut SessionContext,
        event: &Event,
        config: &TestConfig,
    ) -> Response<State> {
        match event {
            Event::Received { msg, .. } if msg.kind == MessageKind::Prepr => {
                let confirmed = msg.body.as_deref().and_then(|b| b.trim().parse::<u64>().ok());
                if confirmed != Some(config.start_time) {
                    warn!(
                        address = %self.peer,
                        "PREPR start time {confirmed:?} differs from requested {}",
                        config.start_time
                    );
                }
                info!(address = %self.peer, start_time = config.start_time, "test prepared");
                context.report(Report::Prepared {
                    start_time: confirmed.unwrap_or(config.start_time),
                });
                Response::Transition(State::prepared(*config))
            }
            Event::Received { msg, .. } if msg.kind == MessageKind::Begin => {
                self.start(context, *config)
            }
            _ => Response::Super,
        }
    }

    #[state(superstate = "connected")]
    fn prepared(
        &mut self,
        context: &mut SessionContext,
        event: &Event,
        config: &TestConfig,
    ) -> Response<State> {
        match event {
            Event::Received { msg, .. } if msg.kind == MessageKind::Begin => {
                self.start(context, *config)
            }
            _ => Response::Super,
        }
    }

    #[state(superstate = "connected")]
    fn running(
        #[expect(unused_variables, reason = "needed to store in state")] config: &TestConfig,
    ) -> Response<State> {
        Response::Super
    }
}
