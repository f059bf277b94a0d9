use std::{fmt::Display, str::FromStr};

use anyhow::anyhow;

use crate::ParseError;

/// Address of a station or remote unit on the radio network.
///
/// `0` is reserved for broadcast and is never a valid device address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u16);

impl Address {
    /// The broadcast address, used as the receiver of `REQ`.
    pub const BROADCAST: Self = Self(0);

    /// Creates a device address.
    ///
    /// # Errors
    ///
    /// Fails for `0`, which is reserved for broadcast.
    pub fn new(address: u16) -> anyhow::Result<Self> {
        if address == 0 {
            return Err(anyhow!("device address must be non-zero, 0 is broadcast"));
        }
        Ok(Self(address))
    }

    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn is_broadcast(self) -> bool {
        self.0 == 0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parses the decimal wire form. Accepts `0` so that broadcast receivers
/// can be represented; callers that need a device address check
/// [`Address::is_broadcast`].
impl FromStr for Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u16>()
            .map(Self)
            .map_err(|e| ParseError::InvalidAddress(format!("`{s}`: {e}")))
    }
}
