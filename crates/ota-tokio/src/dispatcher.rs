//! Plumbing shared by the station and remote-unit runtimes.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ota_core::{Address, ConnectionState, Event, Message, Report, Session, TestState};
use tokio::{
    select,
    sync::{broadcast, mpsc},
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::{LineSink, TransportError};

pub(crate) const OUTBOX_CAPACITY: usize = 1024;
pub(crate) const EVENT_CAPACITY: usize = 1024;

/// Notification published to upward consumers.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Every successfully decoded inbound message, before it is dispatched.
    MessageReceived(Message),
    /// `address` is always the remote unit the session is about.
    ConnectionStateChanged {
        address: Address,
        state: ConnectionState,
    },
    TestStateChanged {
        address: Address,
        state: Option<TestState>,
    },
    Report {
        address: Address,
        report: Report,
    },
    /// The transport failed, the runtime has stopped.
    TransportFailed(String),
}

/// Where a session's output goes after each dispatch.
#[derive(Clone, Debug)]
pub(crate) struct Links {
    outbox: mpsc::Sender<Message>,
    events: broadcast::Sender<SessionEvent>,
}

impl Links {
    pub(crate) fn new(outbox: mpsc::Sender<Message>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { outbox, events }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Hands `event` to the session, then forwards whatever it produced.
    pub(crate) async fn dispatch<S: Session>(&self, address: Address, session: &mut S, event: &Event) {
        let connection = session.connection_state();
        let test = session.test_state();
        session.handle(event);
        self.flush(address, session, connection, test).await;
    }

    /// Queues pending transmissions and publishes state changes relative to
    /// `connection`/`test` and any reports.
    pub(crate) async fn flush<S: Session>(
        &self,
        address: Address,
        session: &mut S,
        connection: ConnectionState,
        test: Option<TestState>,
    ) {
        while let Some(msg) = session.poll_transmit() {
            if self.outbox.send(msg).await.is_err() {
                debug!(%address, "writer gone, dropping outbound message");
            }
        }

        let now = session.connection_state();
        if now != connection {
            self.publish(SessionEvent::ConnectionStateChanged {
                address,
                state: now,
            });
        }
        let now = session.test_state();
        if now != test {
            self.publish(SessionEvent::TestStateChanged {
                address,
                state: now,
            });
        }
        while let Some(report) = session.poll_report() {
            self.publish(SessionEvent::Report { address, report });
        }
    }
}

/// The single writer to the transport.
///
/// Oversize messages are dropped. Consecutive writes are at least `spacing`
/// apart. Ends when cancelled or when every sender is gone.
pub(crate) async fn write_loop<K: LineSink>(
    mut sink: K,
    mut outbox: mpsc::Receiver<Message>,
    spacing: Duration,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let mut last_write: Option<Instant> = None;
    loop {
        let msg = select! {
            biased;

            () = cancel.cancelled() => break,
            msg = outbox.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        if msg.exceeds_radio_limit() {
            error!(
                receiver = %msg.receiver,
                "dropping {} message, payload of {} bytes exceeds the radio limit",
                msg.kind,
                msg.payload().len()
            );
            continue;
        }
        if let Some(last) = last_write {
            sleep_until(last + spacing).await;
        }

        trace!("sending {msg}");
        sink.send_line(&msg.encode()).await?;
        last_write = Some(Instant::now());
    }

    debug!("writer stopping");
    sink.close().await
}

/// Wall clock in epoch seconds, for test start times.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Monotonic time as seen by the session machines. Follows tokio's clock so
/// that paused time applies.
pub(crate) fn monotonic_now() -> std::time::Instant {
    Instant::now().into_std()
}
