use std::{fmt::Display, ops::RangeInclusive, str::FromStr};

use crate::TestConfigError;

/// A test assignment, carried in a `TEST` body as `configId.role.startTime`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TestConfig {
    pub configuration_id: u32,
    pub role: u32,
    /// Unix epoch seconds at which the unit sends `BEGIN`.
    pub start_time: u64,
}

impl TestConfig {
    #[must_use]
    pub const fn new(configuration_id: u32, role: u32, start_time: u64) -> Self {
        Self {
            configuration_id,
            role,
            start_time,
        }
    }
}

impl Display for TestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.configuration_id, self.role, self.start_time
        )
    }
}

impl FromStr for TestConfig {
    type Err = TestConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.trim().split('.');
        let (Some(configuration_id), Some(role), Some(start_time), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(TestConfigError::Format(format!(
                "expected configId.role.startTime, got `{s}`"
            )));
        };

        let field = |name: &str, value: &str| {
            TestConfigError::Format(format!("{name} `{value}` is not a non-negative integer"))
        };
        Ok(Self {
            configuration_id: configuration_id
                .parse()
                .map_err(|_| field("configuration id", configuration_id))?,
            role: role.parse().map_err(|_| field("role", role))?,
            start_time: start_time
                .parse()
                .map_err(|_| field("start time", start_time))?,
        })
    }
}

/// Which test assignments a remote unit accepts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestPolicy {
    pub configuration_ids: RangeInclusive<u32>,
    pub roles: RangeInclusive<u32>,
}

impl Default for TestPolicy {
    fn default() -> Self {
        Self {
            configuration_ids: 0..=u32::MAX,
            roles: 0..=u32::MAX,
        }
    }
}

impl TestPolicy {
    /// Parses a `TEST` body and checks it against the policy.
    ///
    /// # Errors
    ///
    /// The reason to send back in `FAIL`.
    pub fn accept(&self, body: Option<&str>) -> Result<TestConfig, TestConfigError> {
        let config: TestConfig = body
            .ok_or_else(|| TestConfigError::Format("missing test configuration".to_string()))?
            .parse()?;

        if !self.configuration_ids.contains(&config.configuration_id) {
            return Err(TestConfigError::OutOfRange {
                field: "configuration id",
                value: config.configuration_id.into(),
            });
        }
        if !self.roles.contains(&config.role) {
            return Err(TestConfigError::OutOfRange {
                field: "role",
                value: config.role.into(),
            });
        }
        Ok(config)
    }
}

/// Test phase of a connected session. Only defined while connected.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TestState {
    Idle,
    /// `TEST` accepted (unit) or sent (station), preparation not yet confirmed.
    Configured,
    /// `PREPR` sent or received, waiting for the start time.
    Prepared,
    Running,
}

impl Display for TestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Configured => "configured",
            Self::Prepared => "prepared",
            Self::Running => "running",
        })
    }
}

/// Last position reported by a remote unit, in decimal degrees.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    /// Body of a `PING` carrying this position.
    #[must_use]
    pub fn to_body(&self) -> String {
        format!("{:.6},{:.6}", self.latitude, self.longitude)
    }

    /// Parses a `lat,lon` body. Empty or unparseable bodies yield `None`.
    #[must_use]
    pub fn from_body(body: &str) -> Option<Self> {
        let (latitude, longitude) = body.split_once(',')?;
        let position = Self {
            latitude: latitude.trim().parse().ok()?,
            longitude: longitude.trim().parse().ok()?,
        };
        ((-90.0..=90.0).contains(&position.latitude)
            && (-180.0..=180.0).contains(&position.longitude))
        .then_some(position)
    }
}
