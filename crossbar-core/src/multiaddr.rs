//! Multiaddresses.
//!
//! The switch treats addresses as opaque apart from their first segment,
//! which names the transport responsible for them (`tcp`, `ws`,
//! `p2p-circuit`, ...).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AddrError;
use crate::peer_id::PeerId;

/// Transport tag of circuit-relay addresses.
pub const CIRCUIT_TAG: &str = "p2p-circuit";

/// An opaque, `/`-separated peer address carrying a transport tag.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Multiaddr {
    segments: Vec<String>,
}

impl Multiaddr {
    /// Parse an address of the form `/tag/seg/seg/...`.
    pub fn parse(s: &str) -> Result<Self, AddrError> {
        if !s.starts_with('/') {
            return Err(AddrError::MissingLeadingSlash);
        }
        let segments: Vec<String> = s
            .split('/')
            .filter(|seg| !seg.is_empty())
            .map(str::to_string)
            .collect();
        if segments.is_empty() {
            return Err(AddrError::Empty);
        }
        Ok(Self { segments })
    }

    /// Build an address from pre-split segments.
    pub fn from_segments(segments: Vec<String>) -> Result<Self, AddrError> {
        if segments.is_empty() {
            return Err(AddrError::Empty);
        }
        Ok(Self { segments })
    }

    /// The circuit-relay address targeting `peer`.
    pub fn circuit_to(peer: &PeerId) -> Self {
        Self {
            segments: vec![
                CIRCUIT_TAG.to_string(),
                "ipfs".to_string(),
                peer.to_base58(),
            ],
        }
    }

    /// The transport tag, i.e. the first segment.
    pub fn transport_tag(&self) -> &str {
        &self.segments[0]
    }

    /// Whether this address is served by the circuit-relay transport.
    pub fn is_circuit(&self) -> bool {
        self.transport_tag() == CIRCUIT_TAG
    }

    /// All segments of the address.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.segments {
            write!(f, "/{}", seg)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Multiaddr({})", self)
    }
}

impl FromStr for Multiaddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Multiaddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Multiaddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Multiaddr::parse(&s).map_err(serde::de::Error::custom)
    }
}
