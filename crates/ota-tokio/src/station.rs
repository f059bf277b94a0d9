use std::sync::Arc;

use ota_core::{
    Address, Config, ConnectionState, Event, Message, MessageKind, Session, SessionError,
    SessionSummary, StationSession, TestConfig,
};
use tokio::{
    select,
    sync::{broadcast, mpsc},
    task::JoinSet,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    LineSource, SessionEvent, SessionRegistry, Transport, TransportError,
    dispatcher::{Links, OUTBOX_CAPACITY, monotonic_now, write_loop},
};

/// The coordinating station: one session per remote unit that has joined.
///
/// ```no_run
/// use ota_core::{Address, Config};
/// use ota_tokio::{LineTransport, Station};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let station = Station::new(Config::new(Address::new(10)?));
///     let handle = station.handle();
///     let socket = tokio::net::TcpStream::connect("127.0.0.1:7000").await?;
///     let tasks = station.run(LineTransport::new(socket))?;
///
///     println!("{:?}", handle.list_sessions().await);
///     handle.shutdown();
///     tasks.join_all().await;
///     Ok(())
/// }
/// ```
pub struct Station {
    shared: Arc<Shared>,
    outbox: mpsc::Receiver<Message>,
}

/// Upward interface to a running [`Station`]. Cheap to clone.
#[derive(Clone)]
pub struct StationHandle {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    registry: SessionRegistry<StationSession>,
    links: Links,
    cancel: CancellationToken,
}

impl Station {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (outbox_tx, outbox) = mpsc::channel(OUTBOX_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                registry: SessionRegistry::new(),
                links: Links::new(outbox_tx),
                cancel: CancellationToken::new(),
            }),
            outbox,
        }
    }

    #[must_use]
    pub fn handle(&self) -> StationHandle {
        StationHandle {
            shared: self.shared.clone(),
        }
    }

    /// Starts the reader, tick and writer workers on `transport`.
    ///
    /// The returned tasks end after [`StationHandle::shutdown`], or with an
    /// error once the transport fails.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid.
    pub fn run<T: Transport>(self, transport: T) -> anyhow::Result<JoinSet<anyhow::Result<()>>> {
        self.shared.config.validate()?;
        info!(address = %self.shared.config.address, "station starting");

        let (source, sink) = transport.split();
        let mut handles = JoinSet::new();

        let spacing = self.shared.config.send_spacing;
        let cancel = self.shared.cancel.clone();
        let outbox = self.outbox;
        let shared = self.shared.clone();
        handles.spawn(async move {
            if let Err(e) = write_loop(sink, outbox, spacing, cancel).await {
                shared.transport_failed(&e);
                return Err(e.into());
            }
            Ok(())
        });

        let shared = self.shared.clone();
        handles.spawn(async move { shared.read_loop(source).await });

        let shared = self.shared;
        handles.spawn(async move { shared.tick_loop().await });

        Ok(handles)
    }
}

impl Shared {
    async fn read_loop(&self, mut source: impl LineSource) -> anyhow::Result<()> {
        let result = loop {
            let received = select! {
                () = self.cancel.cancelled() => break Ok(()),
                received = source.receive_line() => received,
            };
            match received {
                Ok(Some(line)) => self.on_line(&line).await,
                Ok(None) => break Err(TransportError::Closed),
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = &result {
            self.transport_failed(e);
        }
        self.close_all().await;
        info!("station stopped");
        result.map_err(anyhow::Error::from)
    }

    async fn tick_loop(&self) -> anyhow::Result<()> {
        let mut ticks = interval(self.config.tick);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                () = self.cancel.cancelled() => break,
                _ = ticks.tick() => self.on_tick().await,
            }
        }
        Ok(())
    }

    fn transport_failed(&self, e: &TransportError) {
        error!("transport failed: {e}");
        self.links.publish(SessionEvent::TransportFailed(e.to_string()));
        self.cancel.cancel();
    }

    async fn on_line(&self, line: &str) {
        let msg = match Message::decode(line, self.config.address) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping line: {e}");
                return;
            }
        };
        debug!("received {msg}");
        self.links.publish(SessionEvent::MessageReceived(msg.clone()));

        let now = monotonic_now();
        let address = msg.sender;
        loop {
            let (session, created) = if msg.kind == MessageKind::Req {
                self.registry
                    .get_or_create(address, || {
                        StationSession::accept(self.config.clone(), &msg, now)
                    })
                    .await
            } else if let Some(session) = self.registry.get(address).await {
                (session, false)
            } else {
                debug!(%address, "no session, ignoring {}", msg.kind);
                return;
            };

            let mut guard = session.lock().await;
            if created {
                info!(%address, "new session");
                self.links
                    .flush(address, &mut *guard, ConnectionState::Disconnected, None)
                    .await;
                return;
            }
            if guard.is_closed() {
                // closed and removed while we waited for the lock
                continue;
            }
            self.links
                .dispatch(
                    address,
                    &mut *guard,
                    &Event::Received {
                        now,
                        msg: msg.clone(),
                    },
                )
                .await;
            if guard.is_closed() {
                self.registry.remove_if_same(address, &session).await;
            }
            return;
        }
    }

    async fn on_tick(&self) {
        let now = monotonic_now();
        for (address, session) in self.registry.snapshot().await {
            let mut guard = session.lock().await;
            if guard.is_closed() {
                continue;
            }
            self.links
                .dispatch(address, &mut *guard, &Event::Keepalive { now })
                .await;
            if guard.is_closed() && self.registry.remove_if_same(address, &session).await {
                info!(%address, "session expired");
            }
        }
    }

    async fn close_all(&self) {
        for (address, session) in self.registry.snapshot().await {
            let mut guard = session.lock().await;
            self.links
                .dispatch(address, &mut *guard, &Event::Shutdown)
                .await;
            self.registry.remove_if_same(address, &session).await;
        }
    }

    async fn with_session<R>(
        &self,
        address: Address,
        f: impl FnOnce(&mut StationSession) -> Result<R, SessionError>,
    ) -> Result<R, SessionError> {
        let session = self
            .registry
            .get(address)
            .await
            .ok_or(SessionError::UnknownSession(address))?;
        let mut guard = session.lock().await;
        if guard.is_closed() {
            return Err(SessionError::UnknownSession(address));
        }

        let connection = guard.connection_state();
        let test = guard.test_state();
        let result = f(&mut *guard);
        self.links.flush(address, &mut *guard, connection, test).await;
        if guard.is_closed() {
            self.registry.remove_if_same(address, &session).await;
        }
        result
    }
}

impl StationHandle {
    /// Summaries of all live sessions, ordered by address.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();
        self.shared
            .registry
            .for_each(|_, session| {
                if !session.is_closed() {
                    summaries.push(session.summary());
                }
            })
            .await;
        summaries
    }

    pub async fn session(&self, address: Address) -> Option<SessionSummary> {
        let session = self.shared.registry.get(address).await?;
        let guard = session.lock().await;
        (!guard.is_closed()).then(|| guard.summary())
    }

    /// Sends `TEST` to a connected, idle unit.
    ///
    /// # Errors
    ///
    /// If there is no such session, it is not connected, or it already has a
    /// test.
    pub async fn request_test(
        &self,
        address: Address,
        config: TestConfig,
    ) -> Result<(), SessionError> {
        self.shared
            .with_session(address, |session| session.request_test(config))
            .await
    }

    /// Sends `CANC` without waiting for any confirmation.
    ///
    /// # Errors
    ///
    /// If there is no such session or it is not connected.
    pub async fn cancel_test(&self, address: Address) -> Result<(), SessionError> {
        self.shared
            .with_session(address, StationSession::cancel_test)
            .await
    }

    /// Drops the session locally. The unit notices through its own keepalive.
    ///
    /// # Errors
    ///
    /// If there is no such session.
    pub async fn disconnect(&self, address: Address) -> Result<(), SessionError> {
        info!(%address, "disconnecting");
        self.shared
            .with_session(address, |session| {
                session.handle(&Event::Disconnect);
                Ok(())
            })
            .await
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.links.subscribe()
    }

    /// Stops all workers. Every session receives a final shutdown event.
    pub fn shutdown(&self) {
        info!("station shutting down");
        self.shared.cancel.cancel();
    }

    /// Resolves once the station has been shut down or lost its transport.
    pub async fn stopped(&self) {
        self.shared.cancel.cancelled().await;
    }

    #[must_use]
    pub fn address(&self) -> Address {
        self.shared.config.address
    }
}
