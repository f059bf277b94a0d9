use std::time::Instant;

use statig::{
    Response,
    prelude::{InitializedStateMachine, IntoStateMachineExt as _},
    state_machine,
};
use tracing::{debug, info, trace, warn};

use crate::{
    Address, Config, Event, Message, MessageKind, Position, Report, TestConfig, TestState,
    session::{ConnectionState, Session, SessionContext, SessionSummary},
};

/// A remote unit's single connection to its station.
#[derive(Debug)]
pub struct UnitSession {
    machine: InitializedStateMachine<UnitMachine>,
    context: SessionContext,
    rssi: Option<i16>,
    snr: Option<i16>,
    last_heard: Option<Instant>,
}

impl UnitSession {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let mut context = SessionContext::default();
        let machine = UnitMachine {
            config,
            station: None,
            last_ping_sent: None,
            last_pingr: None,
        }
        .uninitialized_state_machine()
        .init_with_context(&mut context);
        Self {
            machine,
            context,
            rssi: None,
            snr: None,
            last_heard: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> &State {
        self.machine.state()
    }

    /// The station this unit is bound to, once `CON` has been accepted.
    #[must_use]
    pub fn station(&self) -> Option<Address> {
        self.machine.station
    }

    /// Position sent in subsequent `PING` bodies.
    pub fn set_position(&mut self, position: Position) {
        self.context.position = Some(position);
    }

    /// The accepted test, while one is pending or running.
    #[must_use]
    pub fn active_test(&self) -> Option<TestConfig> {
        match self.state() {
            State::Configured { config } | State::Prepared { config } | State::Running { config } => {
                Some(*config)
            }
            _ => None,
        }
    }

    /// One timer tick: liveness and `PING`/`REQ` cadence, then the start
    /// time of a prepared test.
    pub fn tick(&mut self, now: Instant, unix: u64) {
        self.handle(&Event::Keepalive { now });
        self.handle(&Event::Schedule { now, unix });
    }
}

impl Session for UnitSession {
    fn peer(&self) -> Option<Address> {
        self.machine.station
    }

    fn handle(&mut self, event: &Event) {
        if let Event::Received { now, msg } = event {
            if msg.receiver != self.machine.config.address {
                debug!("ignoring message for {}", msg.receiver);
                return;
            }
            if self.machine.station.is_none_or(|station| station == msg.sender) {
                self.rssi = msg.rssi;
                self.snr = msg.snr;
                self.last_heard = Some(*now);
            }
        }
        self.machine.handle_with_context(event, &mut self.context);

        // an accepted configuration is confirmed straight away
        if matches!(self.state(), State::Configured { .. }) {
            self.machine
                .handle_with_context(&Event::Prepare, &mut self.context);
        }
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
            address: self.machine.station,
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
pub struct UnitMachine {
    pub config: Config,
    station: Option<Address>,
    last_ping_sent: Option<Instant>,
    last_pingr: Option<Instant>,
}

impl UnitMachine {
    fn send(&self, context: &mut SessionContext, kind: MessageKind, body: Option<String>) {
        let Some(station) = self.station else {
            warn!("no station bound, dropping {kind}");
            return;
        };
        let mut msg = Message::new(self.config.address, station, kind);
        msg.body = body;
        trace!("queueing {msg}");
        context.transmit(msg);
    }

    fn is_station(&self, msg: &Message) -> bool {
        self.station == Some(msg.sender)
    }

    /// Broadcasts `REQ` and waits for a `CON`.
    fn join(&mut self, context: &mut SessionContext, now: Instant) -> Response<State> {
        self.station = None;
        self.last_ping_sent = None;
        self.last_pingr = None;
        context.transmit(Message::new(
            self.config.address,
            Address::BROADCAST,
            MessageKind::Req,
        ));
        Response::Transition(State::connecting(1, now + self.config.connect_backoff(1)))
    }

    fn ping(&mut self, context: &mut SessionContext, now: Instant) {
        let body = context.position.map(|p| p.to_body());
        self.send(context, MessageKind::Ping, body);
        self.last_ping_sent = Some(now);
    }

    fn cancel(&mut self, context: &mut SessionContext, now: Instant) -> Response<State> {
        info!("test cancelled by station");
        self.send(context, MessageKind::Cancd, None);
        self.ping(context, now);
        context.report(Report::Cancelled);
        Response::Transition(State::idle())
    }

    fn cancel_requested(&self, event: &Event) -> Option<Instant> {
        match event {
            Event::Received { now, msg } if msg.kind == MessageKind::Canc && self.is_station(msg) => {
                Some(*now)
            }
            _ => None,
        }
    }
}

#[state_machine(
    initial = "State::disconnected()",
    after_transition = "Self::after_transition",
    state(derive(Clone, Debug, PartialEq, Eq)),
    superstate(derive(Debug))
)]
impl UnitMachine {
    fn after_transition(&mut self, prev: &State, next: &State) {
        trace!("after transitioning from `{:?}` to `{:?}`", prev, next);
    }

    #[state]
    fn disconnected(&mut self, context: &mut SessionContext, event: &Event) -> Response<State> {
        match event {
            Event::Start { now } => {
                info!(address = %self.config.address, "requesting connection");
                self.join(context, *now)
            }
            _ => Response::Handled,
        }
    }

    #[state]
    fn connecting(
        &mut self,
        context: &mut SessionContext,
        event: &Event,
        attempt: &u32,
        retry_at: &Instant,
    ) -> Response<State> {
        match event {
            Event::Received { now, msg } if msg.kind == MessageKind::Con => {
                let confirmed = msg.body.as_deref().and_then(|b| b.parse::<Address>().ok());
                if confirmed != Some(msg.sender) {
                    warn!(sender = %msg.sender, "CON body {:?} does not name its sender", msg.body);
                    return Response::Handled;
                }
                info!(station = %msg.sender, "connected");
                self.station = Some(msg.sender);
                self.last_ping_sent = Some(*now);
                self.last_pingr = Some(*now);
                self.send(context, MessageKind::Ack, None);
                Response::Transition(State::idle())
            }
            Event::Keepalive { now } if now >= retry_at => {
                if self
                    .config
                    .max_connect_attempts
                    .is_some_and(|max| *attempt >= max)
                {
                    warn!(attempts = *attempt, "no station answered, giving up");
                    context.report(Report::ConnectFailed);
                    return Response::Transition(State::disconnected());
                }
                let attempt = attempt.saturating_add(1);
                debug!(attempt, "retransmitting REQ");
                context.transmit(Message::new(
                    self.config.address,
                    Address::BROADCAST,
                    MessageKind::Req,
                ));
                Response::Transition(State::connecting(
                    attempt,
                    *now + self.config.connect_backoff(attempt),
                ))
            }
            Event::Disconnect | Event::Shutdown => Response::Transition(State::disconnected()),
            _ => Response::Handled,
        }
    }

    #[superstate]
    fn connected(&mut self, context: &mut SessionContext, event: &Event) -> Response<State> {
        match event {
            Event::Keepalive { now } => {
                if self.last_pingr.is_none_or(|at| {
                    now.saturating_duration_since(at) >= self.config.ping_timeout
                }) {
                    warn!(
                        timeout = ?self.config.ping_timeout,
                        "no PINGR from station, rejoining"
                    );
                    context.report(Report::TimedOut);
                    return self.join(context, *now);
                }
                if self.last_ping_sent.is_none_or(|at| {
                    now.saturating_duration_since(at) >= self.config.ping_interval
                }) {
                    self.ping(context, *now);
                }
                Response::Handled
            }
            Event::Received { now, msg } if self.is_station(msg) => match msg.kind {
                MessageKind::Pingr => {
                    self.last_pingr = Some(*now);
                    Response::Handled
                }
                MessageKind::Con => {
                    debug!("repeated CON, acknowledging again");
                    self.send(context, MessageKind::Ack, None);
                    Response::Handled
                }
                MessageKind::Test => {
                    warn!("TEST while another test is pending");
                    self.send(
                        context,
                        MessageKind::Fail,
                        Some("test already in progress".to_string()),
                    );
                    Response::Handled
                }
                kind => {
                    debug!("ignoring {kind} from station");
                    Response::Handled
                }
            },
            Event::Received { msg, .. } => {
                debug!(sender = %msg.sender, "ignoring {} from unbound sender", msg.kind);
                Response::Handled
            }
            Event::Progress { .. } | Event::Complete | Event::Abort { .. } => {
                warn!("no test running, ignoring local test event");
                Response::Handled
            }
            Event::Disconnect | Event::Shutdown => {
                info!("disconnecting");
                self.station = None;
                Response::Transition(State::disconnected())
            }
            _ => Response::Handled,
        }
    }

    #[state(superstate = "connected")]
    fn idle(&mut self, context: &mut SessionContext, event: &Event) -> Response<State> {
        match event {
            Event::Received { msg, .. }
                if msg.kind == MessageKind::Test && self.is_station(msg) =>
            {
                match self.config.test_policy.accept(msg.body.as_deref()) {
                    Ok(config) => {
                        info!(%config, "test configured");
                        Response::Transition(State::configured(config))
                    }
                    Err(e) => {
                        warn!("rejecting test: {e}");
                        self.send(context, MessageKind::Fail, Some(e.to_string()));
                        context.report(Report::Rejected(e.to_string()));
                        Response::Handled
                    }
                }
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
        if let Some(now) = self.cancel_requested(event) {
            return self.cancel(context, now);
        }
        match event {
            Event::Prepare => {
                debug!(start_time = config.start_time, "confirming preparation");
                self.send(
                    context,
                    MessageKind::Prepr,
                    Some(config.start_time.to_string()),
                );
                context.report(Report::Prepared {
                    start_time: config.start_time,
                });
                Response::Transition(State::prepared(*config))
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
        if let Some(now) = self.cancel_requested(event) {
            return self.cancel(context, now);
        }
        match event {
            Event::Schedule { unix, .. } if *unix >= config.start_time => {
                info!(%config, "start time reached, beginning test");
                self.send(context, MessageKind::Begin, None);
                context.report(Report::Started(*config));
                Response::Transition(State::running(*config))
            }
            _ => Response::Super,
        }
    }

    #[state(superstate = "connected")]
    fn running(
        &mut self,
        context: &mut SessionContext,
        event: &Event,
        config: &TestConfig,
    ) -> Response<State> {
        if let Some(now) = self.cancel_requested(event) {
            return self.cancel(context, now);
        }
        match event {
            Event::Progress { payload } => {
                self.send(context, MessageKind::Upd, Some(payload.clone()));
                Response::Handled
            }
            Event::Complete => {
                info!(%config, "test done");
                self.send(context, MessageKind::Done, None);
                context.report(Report::Completed);
                Response::Transition(State::idle())
            }
            Event::Abort { reason } => {
                warn!(%config, "test failed: {reason}");
                self.send(context, MessageKind::Fail, Some(reason.clone()));
                context.report(Report::Failed(reason.clone()));
                Response::Transition(State::idle())
            }
            _ => Response::Super,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::TestPolicy;

    const STATION: u16 = 10;
    const UNIT: u16 = 5;

    fn addr(n: u16) -> Address {
        Address::new(n).unwrap()
    }

    fn config() -> Config {
        Config::new(addr(UNIT)).with_ping_interval(Duration::from_secs(1))
    }

    fn from_station(kind: MessageKind) -> Message {
        Message::new(addr(STATION), addr(UNIT), kind)
    }

    fn received(now: Instant, msg: Message) -> Event {
        Event::Received { now, msg }
    }

    fn drain(session: &mut UnitSession) -> Vec<String> {
        std::iter::from_fn(|| session.poll_transmit())
            .map(|m| m.encode())
            .collect()
    }

    fn reports(session: &mut UnitSession) -> Vec<Report> {
        std::iter::from_fn(|| session.poll_report()).collect()
    }

    fn connected(config: Config, t0: Instant) -> UnitSession {
        let mut session = UnitSession::new(config);
        session.handle(&Event::Start { now: t0 });
        session.handle(&received(t0, from_station(MessageKind::Con).with_body("10")));
        drain(&mut session);
        session
    }

    #[test]
    fn handshake() {
        let t0 = Instant::now();
        let mut session = UnitSession::new(config());
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);

        session.handle(&Event::Start { now: t0 });
        assert_eq!(session.connection_state(), ConnectionState::Connecting);
        assert_eq!(drain(&mut session), ["0,3,REQ"]);

        session.handle(&received(t0, from_station(MessageKind::Con).with_body("10")));
        assert_eq!(session.connection_state(), ConnectionState::Connected);
        assert_eq!(session.station(), Some(addr(STATION)));
        assert_eq!(drain(&mut session), ["10,3,ACK"]);
    }

    #[test]
    fn con_must_name_its_sender() {
        let t0 = Instant::now();
        let mut session = UnitSession::new(config());
        session.handle(&Event::Start { now: t0 });
        drain(&mut session);
        session.handle(&received(t0, from_station(MessageKind::Con).with_body("11")));
        assert_eq!(session.connection_state(), ConnectionState::Connecting);
        assert!(drain(&mut session).is_empty());
    }

    #[test]
    fn retransmits_req_with_backoff() {
        let t0 = Instant::now();
        let at = |millis: u64| t0 + Duration::from_millis(millis);
        let mut session = UnitSession::new(config());
        session.handle(&Event::Start { now: t0 });
        drain(&mut session);

        session.handle(&Event::Keepalive { now: at(500) });
        assert!(drain(&mut session).is_empty());
        session.handle(&Event::Keepalive { now: at(1000) });
        assert_eq!(drain(&mut session), ["0,3,REQ"]);
        // second retry waits twice as long
        session.handle(&Event::Keepalive { now: at(2000) });
        assert!(drain(&mut session).is_empty());
        session.handle(&Event::Keepalive { now: at(3000) });
        assert_eq!(drain(&mut session), ["0,3,REQ"]);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let t0 = Instant::now();
        let mut session = UnitSession::new(config().with_max_connect_attempts(Some(2)));
        session.handle(&Event::Start { now: t0 });
        for secs in 1..=10 {
            session.handle(&Event::Keepalive {
                now: t0 + Duration::from_secs(secs),
            });
        }
        assert_eq!(drain(&mut session), ["0,3,REQ", "0,3,REQ"]);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(reports(&mut session), [Report::ConnectFailed]);
    }

    #[test]
    fn pings_on_interval_with_position() {
        let t0 = Instant::now();
        let mut session = connected(config(), t0);
        session.set_position(Position {
            latitude: 1.5,
            longitude: -2.25,
        });
        session.handle(&Event::Keepalive {
            now: t0 + Duration::from_millis(500),
        });
        assert!(drain(&mut session).is_empty());
        session.handle(&Event::Keepalive {
            now: t0 + Duration::from_secs(1),
        });
        assert_eq!(drain(&mut session), ["10,23,PING:1.500000,-2.250000"]);
    }

    #[test]
    fn rejoins_when_station_goes_quiet() {
        let t0 = Instant::now();
        let mut session = connected(config(), t0);
        for secs in 1..=2 {
            session.handle(&Event::Keepalive {
                now: t0 + Duration::from_secs(secs),
            });
        }
        assert_eq!(session.connection_state(), ConnectionState::Connected);
        session.handle(&Event::Keepalive {
            now: t0 + Duration::from_secs(3),
        });
        assert_eq!(session.connection_state(), ConnectionState::Connecting);
        assert_eq!(session.station(), None);
        assert_eq!(drain(&mut session).last().map(String::as_str), Some("0,3,REQ"));
        assert_eq!(reports(&mut session), [Report::TimedOut]);
    }

    #[test]
    fn pingr_keeps_connection_alive() {
        let t0 = Instant::now();
        let mut session = connected(config(), t0);
        for secs in 1..=10 {
            let now = t0 + Duration::from_secs(secs);
            session.handle(&Event::Keepalive { now });
            session.handle(&received(now, from_station(MessageKind::Pingr)));
        }
        assert_eq!(session.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn test_happy_path() {
        let t0 = Instant::now();
        let mut session = connected(config(), t0);

        session.handle(&received(t0, from_station(MessageKind::Test).with_body("0.1.1000")));
        assert_eq!(session.test_state(), Some(TestState::Prepared));
        assert_eq!(session.active_test(), Some(TestConfig::new(0, 1, 1000)));
        assert_eq!(drain(&mut session), ["10,10,PREPR:1000"]);

        session.tick(t0, 999);
        assert_eq!(session.test_state(), Some(TestState::Prepared));
        session.tick(t0, 1000);
        assert_eq!(session.test_state(), Some(TestState::Running));
        assert_eq!(drain(&mut session), ["10,5,BEGIN"]);

        session.handle(&Event::Progress {
            payload: "42%".to_string(),
        });
        session.handle(&Event::Complete);
        assert_eq!(session.test_state(), Some(TestState::Idle));
        assert_eq!(drain(&mut session), ["10,7,UPD:42%", "10,4,DONE"]);
        assert_eq!(
            reports(&mut session),
            [
                Report::Prepared { start_time: 1000 },
                Report::Started(TestConfig::new(0, 1, 1000)),
                Report::Completed,
            ]
        );
    }

    #[test]
    fn rejects_invalid_configuration() {
        let t0 = Instant::now();
        let mut session = connected(config(), t0);
        session.handle(&received(t0, from_station(MessageKind::Test).with_body("99.1.abc")));
        assert_eq!(session.test_state(), Some(TestState::Idle));
        let sent = drain(&mut session);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("10,"));
        assert!(sent[0].contains(",FAIL:"));
        assert!(matches!(reports(&mut session).as_slice(), [Report::Rejected(_)]));
    }

    #[test]
    fn rejects_configuration_outside_policy() {
        let t0 = Instant::now();
        let policy = TestPolicy {
            configuration_ids: 0..=3,
            roles: 0..=1,
        };
        let mut session = connected(config().with_test_policy(policy), t0);
        session.handle(&received(t0, from_station(MessageKind::Test).with_body("99.1.5")));
        assert_eq!(session.test_state(), Some(TestState::Idle));
        assert_eq!(
            drain(&mut session),
            ["10,47,FAIL:configuration id 99 outside accepted range"]
        );
    }

    #[test]
    fn busy_unit_refuses_second_test() {
        let t0 = Instant::now();
        let mut session = connected(config(), t0);
        session.handle(&received(t0, from_station(MessageKind::Test).with_body("0.1.1000")));
        drain(&mut session);
        session.handle(&received(t0, from_station(MessageKind::Test).with_body("1.1.1000")));
        assert_eq!(session.active_test(), Some(TestConfig::new(0, 1, 1000)));
        assert_eq!(drain(&mut session), ["10,29,FAIL:test already in progress"]);
    }

    #[test]
    fn cancel_while_running() {
        let t0 = Instant::now();
        let mut session = connected(config(), t0);
        session.handle(&received(t0, from_station(MessageKind::Test).with_body("0.1.0")));
        session.tick(t0, 1);
        assert_eq!(session.test_state(), Some(TestState::Running));
        drain(&mut session);
        reports(&mut session);

        session.handle(&received(t0, from_station(MessageKind::Canc)));
        assert_eq!(session.test_state(), Some(TestState::Idle));
        assert_eq!(drain(&mut session), ["10,5,CANCD", "10,4,PING"]);
        assert_eq!(reports(&mut session), [Report::Cancelled]);
    }

    #[test]
    fn cancel_without_test_is_ignored() {
        let t0 = Instant::now();
        let mut session = connected(config(), t0);
        session.handle(&received(t0, from_station(MessageKind::Canc)));
        assert_eq!(session.test_state(), Some(TestState::Idle));
        assert!(drain(&mut session).is_empty());
    }

    #[test]
    fn abort_reports_failure() {
        let t0 = Instant::now();
        let mut session = connected(config(), t0);
        session.handle(&received(t0, from_station(MessageKind::Test).with_body("0.1.0")));
        session.tick(t0, 0);
        drain(&mut session);
        session.handle(&Event::Abort {
            reason: "exit status 2".to_string(),
        });
        assert_eq!(drain(&mut session), ["10,18,FAIL:exit status 2"]);
        assert_eq!(session.test_state(), Some(TestState::Idle));
    }

    #[test]
    fn ignores_other_stations() {
        let t0 = Instant::now();
        let mut session = connected(config(), t0);
        session.handle(&received(
            t0,
            Message::new(addr(11), addr(UNIT), MessageKind::Test).with_body("0.1.0"),
        ));
        assert_eq!(session.test_state(), Some(TestState::Idle));
        assert!(drain(&mut session).is_empty());
    }
}
