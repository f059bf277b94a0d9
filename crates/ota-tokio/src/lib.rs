//! Tokio runtime for the OTA session protocol.
//!
//! Wraps the sans-IO sessions of `ota-core` in three workers per device: a
//! reader that decodes lines from the [`Transport`] and dispatches them to the
//! right session, a tick that drives keepalive and scheduled test starts, and
//! a single writer that serializes outbound messages back onto the transport.
//!
//! - [`Station`] holds one session per remote unit in a [`SessionRegistry`]
//!   and is controlled through a [`StationHandle`].
//! - [`Unit`] holds the remote unit's single session and is controlled through
//!   a [`UnitHandle`], typically by a [`ProcedureRunner`].
//!
//! Both publish [`SessionEvent`]s to any number of subscribers.

mod dispatcher;
mod error;
mod registry;
mod runner;
mod settings;
mod station;
mod transport;
mod unit;

pub use dispatcher::SessionEvent;
pub use error::TransportError;
pub use registry::SessionRegistry;
pub use runner::ProcedureRunner;
pub use settings::{Settings, SettingsError};
pub use station::{Station, StationHandle};
#[cfg(feature = "serial")]
pub use transport::open_serial;
pub use transport::{
    AtModem, AtSink, AtSource, LineReader, LineSink, LineSource, LineTransport, LineWriter,
    Transport,
};
pub use unit::{Unit, UnitHandle};
