use std::{fmt::Display, str::FromStr};

use tracing::trace;

use crate::{Address, ParseError};

/// Largest payload (`kind[:body]`) the radio modem accepts in one frame.
pub const MAX_PAYLOAD_LEN: usize = 240;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Join request, broadcast by a unit.
    Req,
    /// Join confirmed, body is the station address.
    Con,
    /// Join acknowledged by the unit.
    Ack,
    /// Keepalive probe from the unit, optional `lat,lon` body.
    Ping,
    /// Keepalive reply from the station.
    Pingr,
    /// Test configuration `configId.role.startTime`.
    Test,
    /// Test preparation confirmed, body is the start time.
    Prepr,
    /// Test started.
    Begin,
    /// Test progress, opaque body.
    Upd,
    /// Test completed.
    Done,
    /// Test rejected or aborted, opaque reason.
    Fail,
    /// Cancel a pending or running test.
    Canc,
    /// Cancellation performed.
    Cancd,
}

impl MessageKind {
    pub const ALL: [Self; 13] = [
        Self::Req,
        Self::Con,
        Self::Ack,
        Self::Ping,
        Self::Pingr,
        Self::Test,
        Self::Prepr,
        Self::Begin,
        Self::Upd,
        Self::Done,
        Self::Fail,
        Self::Canc,
        Self::Cancd,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Req => "REQ",
            Self::Con => "CON",
            Self::Ack => "ACK",
            Self::Ping => "PING",
            Self::Pingr => "PINGR",
            Self::Test => "TEST",
            Self::Prepr => "PREPR",
            Self::Begin => "BEGIN",
            Self::Upd => "UPD",
            Self::Done => "DONE",
            Self::Fail => "FAIL",
            Self::Canc => "CANC",
            Self::Cancd => "CANCD",
        }
    }
}

impl FromStr for MessageKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseError::UnknownKind(s.to_string()))
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One over-the-air message.
///
/// `rssi` and `snr` are only ever set on received messages. `None` means the
/// radio did not report a value, which is distinct from `Some(0)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub sender: Address,
    pub receiver: Address,
    pub kind: MessageKind,
    pub body: Option<String>,
    pub rssi: Option<i16>,
    pub snr: Option<i16>,
}

impl Message {
    #[must_use]
    pub fn new(sender: Address, receiver: Address, kind: MessageKind) -> Self {
        Self {
            sender,
            receiver,
            kind,
            body: None,
            rssi: None,
            snr: None,
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn with_signal(mut self, rssi: Option<i16>, snr: Option<i16>) -> Self {
        self.rssi = rssi;
        self.snr = snr;
        self
    }

    /// The `kind[:body]` part of the wire form.
    #[must_use]
    pub fn payload(&self) -> String {
        match &self.body {
            Some(body) => format!("{}:{body}", self.kind),
            None => self.kind.as_str().to_string(),
        }
    }

    #[must_use]
    pub fn exceeds_radio_limit(&self) -> bool {
        self.payload().len() > MAX_PAYLOAD_LEN
    }

    /// Outbound wire form: `<receiver>,<length>,<kind>[:<body>]`.
    ///
    /// The length is always recomputed from the payload.
    #[must_use]
    pub fn encode(&self) -> String {
        let payload = self.payload();
        format!("{},{},{payload}", self.receiver, payload.len())
    }

    /// Inbound wire form as delivered by the radio on the receiving side:
    /// `<sender>,<length>,<kind>[:<body>],<rssi>,<snr>`. Missing signal values
    /// are left empty.
    #[must_use]
    pub fn encode_received(&self) -> String {
        let payload = self.payload();
        let rssi = self.rssi.map(|v| v.to_string()).unwrap_or_default();
        let snr = self.snr.map(|v| v.to_string()).unwrap_or_default();
        format!("{},{},{payload},{rssi},{snr}", self.sender, payload.len())
    }

    /// Decodes an inbound line received by the device at `local`.
    ///
    /// The declared length delimits the payload, so bodies may contain commas.
    /// The trailing `,<rssi>,<snr>` pair is optional and each value may be
    /// empty.
    ///
    /// # Errors
    ///
    /// [`ParseError::MalformedMessage`] for structural problems including a
    /// declared length that does not match the payload,
    /// [`ParseError::UnknownKind`] for unrecognised kinds.
    pub fn decode(line: &str, local: Address) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let malformed = |reason: &str| ParseError::MalformedMessage(format!("{reason}: `{line}`"));

        let (sender, rest) = line
            .split_once(',')
            .ok_or_else(|| malformed("missing sender"))?;
        let sender: Address = sender
            .parse()
            .map_err(|_| malformed("invalid sender address"))?;
        if sender.is_broadcast() {
            return Err(malformed("broadcast sender"));
        }

        let (declared, rest) = rest
            .split_once(',')
            .ok_or_else(|| malformed("missing length"))?;
        let declared: usize = declared
            .trim()
            .parse()
            .map_err(|_| malformed("invalid length"))?;
        if !rest.is_char_boundary(declared) {
            return Err(malformed("declared length does not match payload"));
        }
        let (payload, trailer) = rest.split_at(declared);

        let (rssi, snr) = if trailer.is_empty() {
            (None, None)
        } else {
            let signal = trailer
                .strip_prefix(',')
                .ok_or_else(|| malformed("declared length does not match payload"))?;
            let (rssi, snr) = signal
                .split_once(',')
                .ok_or_else(|| malformed("incomplete signal quality"))?;
            (
                parse_signal(rssi).ok_or_else(|| malformed("invalid rssi"))?,
                parse_signal(snr).ok_or_else(|| malformed("invalid snr"))?,
            )
        };

        let (kind, body) = match payload.split_once(':') {
            Some((kind, body)) => (kind, Some(body.to_string())),
            None => (payload, None),
        };
        let kind = kind.parse()?;

        let msg = Self {
            sender,
            receiver: local,
            kind,
            body,
            rssi,
            snr,
        };
        trace!("decoded {msg}");

        Ok(msg)
    }
}

/// `Some(None)` for an empty field, `None` if the field is not a number.
fn parse_signal(field: &str) -> Option<Option<i16>> {
    let field = field.trim();
    if field.is_empty() {
        return Some(None);
    }
    field.parse().ok().map(Some)
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}: {}", self.sender, self.receiver, self.payload())?;
        if self.rssi.is_some() || self.snr.is_some() {
            write!(f, " (rssi {:?}, snr {:?})", self.rssi, self.snr)?;
        }
        Ok(())
    }
}
