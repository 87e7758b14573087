//! Encryption and private-network contracts.

use async_trait::async_trait;

use crossbar_core::PeerId;

use crate::error::SwitchResult;
use crate::stream::SwitchStream;

/// Encryption layer negotiated onto every connection.
#[async_trait]
pub trait Crypto: Send + Sync {
    /// Protocol name announced during negotiation.
    fn tag(&self) -> &str;

    /// Run the handshake and wrap `stream` in the encrypted channel.
    ///
    /// Dialers pass the identity they expect in `remote`; listeners pass
    /// `None` and the implementation must fill the stream's peer slot with
    /// the cryptographically authenticated remote identity.
    async fn encrypt(
        &self,
        local: PeerId,
        stream: SwitchStream,
        remote: Option<PeerId>,
    ) -> SwitchResult<SwitchStream>;
}

/// Optional pre-shared-key layer wrapping raw transport streams before
/// encryption.
#[async_trait]
pub trait Protector: Send + Sync {
    /// Wrap `stream` in the private-network envelope.
    async fn protect(&self, stream: SwitchStream) -> SwitchResult<SwitchStream>;
}
