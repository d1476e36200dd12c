// src/core/protocol/version.rs

//! Protocol version negotiation and the capability set each version enables.
//!
//! A connection's behavior is decided once, at `HELLO`, by turning the
//! negotiated [`Version`] into a [`Capabilities`] value. The handler consults
//! those flags instead of branching on version numbers.

use crate::core::SamError;
use std::fmt;
use std::str::FromStr;

/// A `major.minor` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    pub fn generation(&self) -> Generation {
        match self.major {
            1 => Generation::V1,
            2 => Generation::V2,
            _ => Generation::V3,
        }
    }
}

/// Versions the gateway speaks, highest first.
pub const SUPPORTED_VERSIONS: [Version; 4] = [
    Version::new(3, 1),
    Version::new(3, 0),
    Version::new(2, 0),
    Version::new(1, 0),
];

impl FromStr for Version {
    type Err = SamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || SamError::Malformed(format!("invalid version '{s}'"));
        let mut parts = s.trim().split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(bad)?;
        let minor = match parts.next() {
            Some(p) => p.parse::<u8>().map_err(|_| bad())?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(Version { major, minor })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Picks the highest supported version within `[min, max]`.
///
/// A missing `min` means 1.0; a missing `max` is unbounded. A client asking
/// for exactly `MIN=3.0 MAX=3.0` always receives `3.0`, whatever the
/// gateway's own maximum is.
pub fn negotiate(min: Option<&str>, max: Option<&str>) -> Result<Version, SamError> {
    let min = match min {
        Some(s) if !s.trim().is_empty() => s.parse::<Version>()?,
        _ => Version::new(1, 0),
    };
    let max = match max {
        Some(s) if !s.trim().is_empty() => Some(s.parse::<Version>()?),
        _ => None,
    };

    if min == Version::new(3, 0) && max == Some(Version::new(3, 0)) {
        return Ok(Version::new(3, 0));
    }

    SUPPORTED_VERSIONS
        .iter()
        .copied()
        .find(|v| *v >= min && max.is_none_or(|m| *v <= m))
        .ok_or(SamError::NoVersion)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    V1,
    V2,
    V3,
}

/// How `STREAM SEND` payloads reach the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPolicy {
    /// The command loop waits until the transport took the bytes.
    Blocking,
    /// Immediate `OK`/`FAILED` answer with buffer-state credit tokens.
    Credit,
    /// No `STREAM SEND`; the client socket is spliced to the stream.
    Spliced,
}

/// Everything that differs between protocol generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub version: Version,
    pub generation: Generation,
    pub send_policy: SendPolicy,
    /// `STREAM RECEIVE LIMIT=` quotas.
    pub receive_limits: bool,
    /// `STREAM CONNECT` runs in a worker instead of the command loop.
    pub async_connect: bool,
    /// Sessions are named by a client-chosen `ID`.
    pub explicit_ids: bool,
    /// `DESTINATION=<name>` resolves through the persistent key store.
    pub named_destinations: bool,
    /// `DIRECTION=` is honored on stream sessions.
    pub directions: bool,
    /// Inbound streams are announced with `STREAM CONNECTED` and ids.
    pub auto_accept: bool,
    pub primary_sessions: bool,
    pub auth_commands: bool,
    pub keepalive: bool,
    /// Forces `i2cp.messageReliability=none` on every session.
    pub force_unreliable: bool,
}

impl Capabilities {
    pub fn for_version(version: Version) -> Self {
        let generation = version.generation();
        let legacy = generation != Generation::V3;
        Self {
            version,
            generation,
            send_policy: match generation {
                Generation::V1 => SendPolicy::Blocking,
                Generation::V2 => SendPolicy::Credit,
                Generation::V3 => SendPolicy::Spliced,
            },
            receive_limits: generation == Generation::V2,
            async_connect: generation != Generation::V1,
            explicit_ids: !legacy,
            named_destinations: legacy,
            directions: legacy,
            auto_accept: legacy,
            primary_sessions: !legacy,
            auth_commands: !legacy,
            keepalive: !legacy,
            force_unreliable: generation == Generation::V1,
        }
    }
}
