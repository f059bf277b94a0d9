use std::sync::Arc;

use ota_core::{
    Address, Config, Event, Message, Position, Session, SessionSummary, TestConfig, UnitSession,
};
use tokio::{
    select,
    sync::{Mutex, broadcast, mpsc},
    task::JoinSet,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    LineSource, SessionEvent, Transport, TransportError,
    dispatcher::{Links, OUTBOX_CAPACITY, monotonic_now, unix_now, write_loop},
};

/// A remote unit: joins a station and runs the tests it is assigned.
pub struct Unit {
    shared: Arc<Shared>,
    outbox: mpsc::Receiver<Message>,
}

/// Upward interface to a running [`Unit`], used by whatever executes the
/// tests. Cheap to clone.
#[derive(Clone)]
pub struct UnitHandle {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    session: Mutex<UnitSession>,
    links: Links,
    cancel: CancellationToken,
}

impl Unit {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (outbox_tx, outbox) = mpsc::channel(OUTBOX_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(UnitSession::new(config.clone())),
                config,
                links: Links::new(outbox_tx),
                cancel: CancellationToken::new(),
            }),
            outbox,
        }
    }

    #[must_use]
    pub fn handle(&self) -> UnitHandle {
        UnitHandle {
            shared: self.shared.clone(),
        }
    }

    /// Starts joining and spawns the reader, tick and writer workers.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid.
    pub fn run<T: Transport>(self, transport: T) -> anyhow::Result<JoinSet<anyhow::Result<()>>> {
        self.shared.config.validate()?;
        info!(address = %self.shared.config.address, "remote unit starting");

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
        handles.spawn(async move {
            shared
                .dispatch(&Event::Start {
                    now: monotonic_now(),
                })
                .await;
            shared.tick_loop().await
        });

        Ok(handles)
    }
}

impl Shared {
    async fn dispatch(&self, event: &Event) {
        let mut session = self.session.lock().await;
        self.links
            .dispatch(self.config.address, &mut *session, event)
            .await;
    }

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
        self.dispatch(&Event::Shutdown).await;
        info!("remote unit stopped");
        result.map_err(anyhow::Error::from)
    }

    async fn tick_loop(&self) -> anyhow::Result<()> {
        let mut ticks = interval(self.config.tick);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                () = self.cancel.cancelled() => break,
                _ = ticks.tick() => {
                    let now = monotonic_now();
                    let mut session = self.session.lock().await;
                    for event in [Event::Keepalive { now }, Event::Schedule { now, unix: unix_now() }] {
                        self.links.dispatch(self.config.address, &mut *session, &event).await;
                    }
                }
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
        self.dispatch(&Event::Received {
            now: monotonic_now(),
            msg,
        })
        .await;
    }
}

impl UnitHandle {
    pub async fn summary(&self) -> SessionSummary {
        self.shared.session.lock().await.summary()
    }

    /// The test currently configured, prepared or running.
    pub async fn active_test(&self) -> Option<TestConfig> {
        self.shared.session.lock().await.active_test()
    }

    /// Sends `UPD` while a test is running, ignored otherwise.
    pub async fn report_progress(&self, payload: impl Into<String>) {
        self.shared
            .dispatch(&Event::Progress {
                payload: payload.into(),
            })
            .await;
    }

    /// Sends `DONE` and returns to idle.
    pub async fn complete_test(&self) {
        self.shared.dispatch(&Event::Complete).await;
    }

    /// Sends `FAIL:<reason>` and returns to idle.
    pub async fn fail_test(&self, reason: impl Into<String>) {
        self.shared
            .dispatch(&Event::Abort {
                reason: reason.into(),
            })
            .await;
    }

    /// Position carried by subsequent `PING`s.
    pub async fn report_position(&self, position: Position) {
        self.shared.session.lock().await.set_position(position);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.links.subscribe()
    }

    pub fn shutdown(&self) {
        info!("remote unit shutting down");
        self.shared.cancel.cancel();
    }

    /// Resolves once the unit has been shut down or lost its transport.
    pub async fn stopped(&self) {
        self.shared.cancel.cancelled().await;
    }

    #[must_use]
    pub fn address(&self) -> Address {
        self.shared.config.address
    }
}
