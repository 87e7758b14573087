//! Protocol negotiation contract.
//!
//! The wire codec (multistream-select) is external; the switch only consumes
//! this interface. Implementations must be bit-exact with the ecosystem
//! negotiation protocol when talking to real peers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SwitchResult;
use crate::stream::SwitchStream;

/// Predicate deciding whether a proposed protocol name is acceptable.
pub type ProtocolMatcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Outcome of a dialer-side selection.
pub enum Selection {
    /// The remote accepted `name`; the stream is positioned after
    /// negotiation.
    Selected {
        /// The accepted protocol name.
        name: String,
        /// The negotiated stream.
        stream: SwitchStream,
    },
    /// The remote refused every candidate. The negotiation session ended
    /// cleanly and the stream remains usable for another round.
    Refused {
        /// The still-usable stream.
        stream: SwitchStream,
    },
}

/// Drives protocol selection over a byte stream.
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Dialer side: propose `candidates` in order. A clean refusal of every
    /// candidate is `Ok(Selection::Refused)`; `Err` means the session broke
    /// and the stream is gone.
    async fn select(
        &self,
        stream: SwitchStream,
        candidates: &[String],
    ) -> SwitchResult<Selection>;

    /// Listener side: answer the remote's proposals, accepting the first one
    /// `accept` admits, and return the selected name with the stream.
    async fn listen(
        &self,
        stream: SwitchStream,
        accept: ProtocolMatcher,
    ) -> SwitchResult<(String, SwitchStream)>;
}

/// Matcher accepting exactly one protocol name.
pub fn exact_matcher(name: &str) -> ProtocolMatcher {
    let name = name.to_string();
    Arc::new(move |proposed| proposed == name)
}
