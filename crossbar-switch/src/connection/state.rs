//! Connection lifecycle states and transitions.
//!
//! The state value is the single source of truth for a connection's
//! lifecycle. Transitions happen only through the named events below; an
//! event fed to a state it is not legal in leaves the machine where it is
//! and surfaces a single invalid-transition error.

use std::fmt;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection exists (initial and terminal).
    Disconnected,
    /// A transport dial is in flight.
    Dialing,
    /// A raw stream exists (outbound: dial done; inbound: socket accepted).
    Dialed,
    /// The private-network protector is wrapping the stream.
    Privatizing,
    /// The private-network envelope is in place.
    Privatized,
    /// The encryption handshake is in flight.
    Encrypting,
    /// The stream is encrypted and the remote identity is known.
    Encrypted,
    /// Muxer negotiation is in flight.
    Upgrading,
    /// A muxer is running over the connection.
    Muxed,
    /// The connection settled encrypted but without a muxer.
    Connected,
    /// Teardown is in flight.
    Disconnecting,
    /// The dial was aborted (terminal).
    Aborted,
    /// The pipeline failed; teardown follows.
    Errored,
}

impl ConnectionState {
    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Dialing => "dialing",
            ConnectionState::Dialed => "dialed",
            ConnectionState::Privatizing => "privatizing",
            ConnectionState::Privatized => "privatized",
            ConnectionState::Encrypting => "encrypting",
            ConnectionState::Encrypted => "encrypted",
            ConnectionState::Upgrading => "upgrading",
            ConnectionState::Muxed => "muxed",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Aborted => "aborted",
            ConnectionState::Errored => "errored",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Events driving connection state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Start the transport dial.
    Dial,
    /// The current step completed.
    Done,
    /// The current step failed.
    Error,
    /// Cancel the attempt outright.
    Abort,
    /// Tear the connection down.
    Disconnect,
    /// Wrap the stream in the private-network envelope.
    Privatize,
    /// Run the encryption handshake.
    Encrypt,
    /// Negotiate a muxer.
    Upgrade,
    /// Settle without a muxer.
    Stop,
}

impl ConnectionEvent {
    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Dial => "dial",
            ConnectionEvent::Done => "done",
            ConnectionEvent::Error => "error",
            ConnectionEvent::Abort => "abort",
            ConnectionEvent::Disconnect => "disconnect",
            ConnectionEvent::Privatize => "privatize",
            ConnectionEvent::Encrypt => "encrypt",
            ConnectionEvent::Upgrade => "upgrade",
            ConnectionEvent::Stop => "stop",
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Legal transitions of the outbound machine.
pub fn outbound_step(state: ConnectionState, event: ConnectionEvent) -> Option<ConnectionState> {
    use ConnectionEvent as E;
    use ConnectionState as S;

    match (state, event) {
        (S::Disconnected, E::Dial) => Some(S::Dialing),

        (S::Dialing, E::Done) => Some(S::Dialed),
        (S::Dialing, E::Error) => Some(S::Errored),
        (S::Dialing, E::Abort) => Some(S::Aborted),
        (S::Dialing, E::Disconnect) => Some(S::Disconnecting),

        (S::Dialed, E::Privatize) => Some(S::Privatizing),
        (S::Dialed, E::Encrypt) => Some(S::Encrypting),

        (S::Privatizing, E::Done) => Some(S::Privatized),
        (S::Privatizing, E::Abort) => Some(S::Aborted),
        (S::Privatizing, E::Disconnect) => Some(S::Disconnecting),

        (S::Privatized, E::Encrypt) => Some(S::Encrypting),

        (S::Encrypting, E::Done) => Some(S::Encrypted),
        (S::Encrypting, E::Error) => Some(S::Errored),
        (S::Encrypting, E::Disconnect) => Some(S::Disconnecting),

        (S::Encrypted, E::Upgrade) => Some(S::Upgrading),
        (S::Encrypted, E::Disconnect) => Some(S::Disconnecting),

        (S::Upgrading, E::Done) => Some(S::Muxed),
        (S::Upgrading, E::Stop) => Some(S::Connected),
        (S::Upgrading, E::Error) => Some(S::Errored),

        (S::Muxed, E::Disconnect) => Some(S::Disconnecting),
        (S::Connected, E::Disconnect) => Some(S::Disconnecting),

        (S::Disconnecting, E::Done) => Some(S::Disconnected),

        (S::Errored, E::Disconnect) => Some(S::Disconnecting),

        _ => None,
    }
}

/// Legal transitions of the inbound machine.
///
/// The inbound machine starts in `Dialed`, has no abort or errored branch,
/// and every failure takes the `disconnect` edge.
pub fn inbound_step(state: ConnectionState, event: ConnectionEvent) -> Option<ConnectionState> {
    use ConnectionEvent as E;
    use ConnectionState as S;

    match (state, event) {
        (S::Dialed, E::Privatize) => Some(S::Privatizing),
        (S::Dialed, E::Encrypt) => Some(S::Encrypting),
        (S::Dialed, E::Disconnect) => Some(S::Disconnecting),

        (S::Privatizing, E::Done) => Some(S::Privatized),
        (S::Privatizing, E::Disconnect) => Some(S::Disconnecting),

        (S::Privatized, E::Encrypt) => Some(S::Encrypting),
        (S::Privatized, E::Disconnect) => Some(S::Disconnecting),

        (S::Encrypting, E::Done) => Some(S::Encrypted),
        (S::Encrypting, E::Disconnect) => Some(S::Disconnecting),

        (S::Encrypted, E::Upgrade) => Some(S::Upgrading),
        (S::Encrypted, E::Disconnect) => Some(S::Disconnecting),

        (S::Upgrading, E::Done) => Some(S::Muxed),
        (S::Upgrading, E::Disconnect) => Some(S::Disconnecting),

        (S::Muxed, E::Disconnect) => Some(S::Disconnecting),

        (S::Disconnecting, E::Done) => Some(S::Disconnected),

        _ => None,
    }
}
