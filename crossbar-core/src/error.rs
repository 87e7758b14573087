//! Error types for the crossbar core crate.

use std::fmt;

/// Top-level error type for crossbar-core operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoreError {
    /// A peer identity could not be decoded.
    Identity(IdentityError),
    /// A multiaddress could not be parsed.
    Addr(AddrError),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Identity(e) => write!(f, "identity error: {}", e),
            CoreError::Addr(e) => write!(f, "address error: {}", e),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<IdentityError> for CoreError {
    fn from(e: IdentityError) -> Self {
        CoreError::Identity(e)
    }
}

impl From<AddrError> for CoreError {
    fn from(e: AddrError) -> Self {
        CoreError::Addr(e)
    }
}

/// Errors related to peer identities.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityError {
    /// The identity has no bytes.
    Empty,
    /// The base58 rendering could not be decoded.
    InvalidBase58,
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::Empty => write!(f, "peer id must not be empty"),
            IdentityError::InvalidBase58 => write!(f, "invalid base58 peer id"),
        }
    }
}

impl std::error::Error for IdentityError {}

/// Errors related to multiaddresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddrError {
    /// The address does not start with `/`.
    MissingLeadingSlash,
    /// The address has no segments.
    Empty,
}

impl fmt::Display for AddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrError::MissingLeadingSlash => write!(f, "multiaddr must start with '/'"),
            AddrError::Empty => write!(f, "multiaddr must have at least one segment"),
        }
    }
}

impl std::error::Error for AddrError {}
