use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Transport address of a task endpoint: `(host, port)`.
///
/// Two servers can share a host (several server processes per node) but never
/// a port; the pair is what identifies a `Server` uniquely, while the host
/// half alone identifies the owning `Node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub addr: SocketAddr,
}

impl Location {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr.ip(), self.addr.port())
    }
}

impl FromStr for Location {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let addr: SocketAddr = s
            .parse()
            .with_context(|| format!("invalid location '{s}', expected addr:port"))?;
        Ok(Self { addr })
    }
}

impl From<SocketAddr> for Location {
    fn from(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Serialize for Location {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Location {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(|err: anyhow::Error| {
            serde::de::Error::custom(format!("{err}: {}", anyhow!("invalid location")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_string() {
        let loc: Location = "10.0.0.5:9001".parse().unwrap();
        assert_eq!(loc.to_string(), "10.0.0.5:9001");
        assert_eq!(loc.host(), "10.0.0.5");
        assert_eq!(loc.port(), 9001);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("not-a-location".parse::<Location>().is_err());
    }

    #[test]
    fn serializes_as_plain_string() {
        let loc: Location = "127.0.0.1:51350".parse().unwrap();
        let json = serde_json::to_string(&loc).unwrap();
        assert_eq!(json, "\"127.0.0.1:51350\"");
        let back: Location = serde_json::from_str(&json).unwrap();
        assert_eq!(back, loc);
    }
}
