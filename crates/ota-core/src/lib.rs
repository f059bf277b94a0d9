//! Sans-IO core of the OTA session protocol.
//!
//! Wire messages, test configurations and the per-peer session state
//! machines. Nothing in here touches a clock, a socket or a serial port: the
//! runtime feeds [`Event`]s in and drains [`Message`]s and [`Report`]s out.

mod address;
mod config;
mod error;
mod event;
mod message;
mod orchestration;
pub mod session;

pub use address::Address;
pub use config::Config;
pub use error::{ParseError, SessionError, TestConfigError};
pub use event::{Event, Report};
pub use message::{MAX_PAYLOAD_LEN, Message, MessageKind};
pub use orchestration::{Position, TestConfig, TestPolicy, TestState};
pub use session::{ConnectionState, Session, SessionSummary, StationSession, UnitSession};
