#![allow(dead_code)]

use std::time::Duration;

use ota_core::Address;
use ota_tokio::{LineTransport, SessionEvent};
use tokio::{
    io::{
        AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, DuplexStream, Lines, ReadHalf,
        WriteHalf, duplex,
    },
    sync::broadcast,
    time::timeout,
};

pub const WAIT: Duration = Duration::from_secs(60);

pub fn addr(n: u16) -> Address {
    Address::new(n).unwrap()
}

/// The far end of the radio link, as seen by the device under test.
pub struct Radio {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl Radio {
    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    pub async fn expect(&mut self) -> String {
        timeout(WAIT, self.lines.next_line())
            .await
            .expect("no line from device")
            .unwrap()
            .expect("device closed the link")
    }

    /// Reads lines until one equals `wanted`, returning the ones skipped.
    pub async fn expect_eventually(&mut self, wanted: &str) -> Vec<String> {
        let mut skipped = Vec::new();
        loop {
            let line = self.expect().await;
            if line == wanted {
                return skipped;
            }
            skipped.push(line);
        }
    }
}

pub fn link() -> (LineTransport<DuplexStream>, Radio) {
    let (local, remote) = duplex(4096);
    let (read, writer) = tokio::io::split(remote);
    (
        LineTransport::new(local),
        Radio {
            lines: BufReader::new(read).lines(),
            writer,
        },
    )
}

/// Waits for the first event matching `pred`.
pub async fn next_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not published")
}
