//! Line-oriented transports.
//!
//! The dispatcher only ever sees whole lines: [`LineSource`] yields received
//! lines, [`LineSink`] writes one line per outbound message. A [`Transport`]
//! is split into both halves once so that reading and writing never contend.
//!
//! - [`LineTransport`]: plain newline-delimited text over any byte stream,
//!   e.g. a TCP bridge or [`tokio::io::duplex`] in tests.
//! - [`AtModem`]: the AT command framing of the LoRa modem, `AT+SEND=` out
//!   and `+RCV=` in.
//! - [`open_serial`]: an [`AtModem`] on a serial port (`serial` feature).

use async_trait::async_trait;
use tokio::io::{
    AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader, Lines, ReadHalf,
    WriteHalf,
};
use tracing::{debug, info, trace, warn};

use crate::TransportError;

#[async_trait]
pub trait LineSource: Send {
    /// Next received line without its terminator, `None` at end of stream.
    async fn receive_line(&mut self) -> Result<Option<String>, TransportError>;
}

#[async_trait]
pub trait LineSink: Send {
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Releases the underlying channel.
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub trait Transport: Send {
    type Source: LineSource + 'static;
    type Sink: LineSink + 'static;

    fn split(self) -> (Self::Source, Self::Sink);
}

pub struct LineReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin + Send> LineReader<R> {
    pub fn new(io: R) -> Self {
        Self {
            lines: BufReader::new(io).lines(),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> LineSource for LineReader<R> {
    async fn receive_line(&mut self) -> Result<Option<String>, TransportError> {
        let line = self.lines.next_line().await?;
        Ok(line.map(|mut l| {
            if l.ends_with('\r') {
                l.pop();
            }
            l
        }))
    }
}

pub struct LineWriter<W> {
    io: W,
}

impl<W: AsyncWrite + Unpin + Send> LineWriter<W> {
    pub fn new(io: W) -> Self {
        Self { io }
    }

    async fn write_raw(&mut self, raw: &str) -> Result<(), TransportError> {
        self.io.write_all(raw.as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> LineSink for LineWriter<W> {
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        trace!("writing line: {line}");
        self.write_raw(&format!("{line}\n")).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.io.shutdown().await?;
        Ok(())
    }
}

/// Newline-delimited lines in both directions, no modem framing.
pub struct LineTransport<T> {
    io: T,
}

impl<T> LineTransport<T> {
    pub fn new(io: T) -> Self {
        Self { io }
    }
}

impl<T: AsyncRead + AsyncWrite + Send + 'static> Transport for LineTransport<T> {
    type Source = LineReader<ReadHalf<T>>;
    type Sink = LineWriter<WriteHalf<T>>;

    fn split(self) -> (Self::Source, Self::Sink) {
        let (read, write) = tokio::io::split(self.io);
        (LineReader::new(read), LineWriter::new(write))
    }
}

/// LoRa modem speaking AT commands.
///
/// Outbound lines are wrapped as `AT+SEND=<line>\r\n`. Of the modem output only
/// `+RCV=<line>` frames are passed on, command echoes and `OK` replies are
/// swallowed.
pub struct AtModem<T> {
    io: T,
}

impl<T> AtModem<T> {
    pub fn new(io: T) -> Self {
        Self { io }
    }
}

impl<T: AsyncRead + AsyncWrite + Send + 'static> Transport for AtModem<T> {
    type Source = AtSource<ReadHalf<T>>;
    type Sink = AtSink<WriteHalf<T>>;

    fn split(self) -> (Self::Source, Self::Sink) {
        let (read, write) = tokio::io::split(self.io);
        (
            AtSource {
                inner: LineReader::new(read),
            },
            AtSink {
                inner: LineWriter::new(write),
            },
        )
    }
}

pub struct AtSource<R> {
    inner: LineReader<R>,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> LineSource for AtSource<R> {
    async fn receive_line(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            let Some(line) = self.inner.receive_line().await? else {
                return Ok(None);
            };
            let line = line.trim();
            if let Some(frame) = line.strip_prefix("+RCV=") {
                return Ok(Some(frame.to_string()));
            }
            match line {
                "" | "OK" | "+OK" => trace!("modem: {line:?}"),
                "+READY" => info!("modem ready"),
                _ if line.starts_with("+ERR=") => warn!("modem reported {line}"),
                _ => debug!("ignoring modem output: {line}"),
            }
        }
    }
}

pub struct AtSink<W> {
    inner: LineWriter<W>,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> LineSink for AtSink<W> {
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        trace!("modem command: AT+SEND={line}");
        self.inner.write_raw(&format!("AT+SEND={line}\r\n")).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

/// Opens the modem on a serial port.
///
/// # Errors
///
/// If the port cannot be opened.
#[cfg(feature = "serial")]
pub fn open_serial(
    port: &str,
    baud_rate: u32,
) -> Result<AtModem<tokio_serial::SerialStream>, TransportError> {
    use tokio_serial::SerialPortBuilderExt as _;

    info!(port, baud_rate, "opening serial port");
    let stream = tokio_serial::new(port, baud_rate)
        .open_native_async()
        .map_err(|e| TransportError::Modem(format!("cannot open {port}: {e}")))?;
    Ok(AtModem::new(stream))
}
