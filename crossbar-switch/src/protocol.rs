//! Protocol registration and inbound stream dispatch.

use std::sync::{Arc, Mutex};

use crate::error::{SwitchError, SwitchResult};
use crate::negotiator::{Negotiator, ProtocolMatcher};
use crate::observer::TrafficObserver;
use crate::stream::SwitchStream;

/// Handler invoked with the negotiated protocol name and the stream bound to
/// it. Handlers that need to do I/O spawn their own task.
pub type ProtocolHandlerFn = Arc<dyn Fn(String, SwitchStream) + Send + Sync>;

struct ProtocolEntry {
    handler: ProtocolHandlerFn,
    matcher: Option<ProtocolMatcher>,
}

/// Registered protocols, shared between the switch API and the connection
/// machinery.
#[derive(Clone, Default)]
pub struct ProtocolTable {
    entries: Arc<Mutex<Vec<(String, ProtocolEntry)>>>,
}

impl ProtocolTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `name`. When `matcher` is given it decides
    /// acceptance of proposed names; otherwise only the exact string is
    /// accepted. Re-registering a name replaces its entry.
    pub fn register(
        &self,
        name: &str,
        handler: ProtocolHandlerFn,
        matcher: Option<ProtocolMatcher>,
    ) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|(n, _)| n != name);
        entries.push((name.to_string(), ProtocolEntry { handler, matcher }));
    }

    /// Remove the handler registered for `name`.
    pub fn unregister(&self, name: &str) {
        self.entries.lock().unwrap().retain(|(n, _)| n != name);
    }

    /// Registered protocol names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Find the handler accepting `proposed`, if any.
    pub fn lookup(&self, proposed: &str) -> Option<ProtocolHandlerFn> {
        let entries = self.entries.lock().unwrap();
        for (name, entry) in entries.iter() {
            let accepted = match &entry.matcher {
                Some(matcher) => matcher(proposed),
                None => name == proposed,
            };
            if accepted {
                return Some(entry.handler.clone());
            }
        }
        None
    }

    /// Matcher admitting anything some registered protocol accepts.
    pub fn accept_fn(&self) -> ProtocolMatcher {
        let table = self.clone();
        Arc::new(move |proposed| table.lookup(proposed).is_some())
    }
}

/// Negotiates a registered protocol on an incoming stream and hands it to
/// the protocol's handler.
#[derive(Clone)]
pub struct ProtocolDispatcher {
    table: ProtocolTable,
    negotiator: Arc<dyn Negotiator>,
    observer: TrafficObserver,
}

impl ProtocolDispatcher {
    /// Build a dispatcher over the given table.
    pub fn new(
        table: ProtocolTable,
        negotiator: Arc<dyn Negotiator>,
        observer: TrafficObserver,
    ) -> Self {
        Self {
            table,
            negotiator,
            observer,
        }
    }

    /// Negotiate a protocol on `stream`, meter it, and invoke the handler.
    pub async fn handle(&self, stream: SwitchStream) -> SwitchResult<()> {
        let accept = self.table.accept_fn();
        let (selected, stream) = self.negotiator.listen(stream, accept).await?;
        let handler = self.table.lookup(&selected).ok_or_else(|| {
            SwitchError::Negotiation(format!("no handler for negotiated protocol {selected}"))
        })?;
        let metered = self.observer.tap(stream, None, Some(selected.clone()));
        handler(selected, metered);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> ProtocolHandlerFn {
        Arc::new(|_proto, _stream| {})
    }

    #[test]
    fn test_exact_match_by_default() {
        let table = ProtocolTable::new();
        table.register("/kv/1.0.0", noop_handler(), None);

        assert!(table.lookup("/kv/1.0.0").is_some());
        assert!(table.lookup("/kv/1.1.0").is_none());
    }

    #[test]
    fn test_matcher_decides_acceptance() {
        let table = ProtocolTable::new();
        let matcher: ProtocolMatcher = Arc::new(|p| p.starts_with("/kv/1."));
        table.register("/kv/1.0.0", noop_handler(), Some(matcher));

        assert!(table.lookup("/kv/1.3.0").is_some());
        assert!(table.lookup("/kv/2.0.0").is_none());
    }

    #[test]
    fn test_unregister() {
        let table = ProtocolTable::new();
        table.register("/kv/1.0.0", noop_handler(), None);
        table.unregister("/kv/1.0.0");

        assert!(table.lookup("/kv/1.0.0").is_none());
        assert!(table.names().is_empty());
    }

    #[test]
    fn test_accept_fn_covers_matchers() {
        let table = ProtocolTable::new();
        table.register("/ping/1.0.0", noop_handler(), None);
        let accept = table.accept_fn();

        assert!(accept("/ping/1.0.0"));
        assert!(!accept("/pong/1.0.0"));
    }
}
