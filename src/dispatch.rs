//! Tagged message dispatch.
//!
//! Handlers are bound to tags through [`ClusterBuilder`](crate::ClusterBuilder)
//! and frozen into a [`HandlerTable`] before any run exists; there is no way to mutate the
//! table while connections are live. Subsystems (directory, mailbox, query
//! routing) each own one tag.

use std::sync::Arc;

use crate::connection::Connection;
use crate::drain::DrainLock;
use crate::{ClusterVersion, MessageTag, Result, MAX_MESSAGE_TAG};

/// Receives every frame carrying the tag it was registered under.
///
/// `on_message` runs on the connection's reader task and must finish before
/// the next frame of that connection is read; handlers that need concurrency
/// dispatch internally. The `keepalive` holds the connection open for as
/// long as the handler (or anything it hands the lock to) needs it.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(
        &self,
        conn: &Arc<Connection>,
        keepalive: DrainLock,
        version: ClusterVersion,
        payload: &[u8],
    ) -> Result<()>;

    /// Local fast path for loopback sends. The default reads the buffered
    /// payload through `on_message`; override to skip the copy.
    fn on_local_message(
        &self,
        conn: &Arc<Connection>,
        keepalive: DrainLock,
        version: ClusterVersion,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.on_message(conn, keepalive, version, &payload)
    }
}

/// Fixed tag-indexed handler array, immutable after construction.
pub(crate) struct HandlerTable {
    slots: [Option<Arc<dyn MessageHandler>>; MAX_MESSAGE_TAG],
}

impl HandlerTable {
    pub(crate) fn from_slots(slots: [Option<Arc<dyn MessageHandler>>; MAX_MESSAGE_TAG]) -> Self {
        Self { slots }
    }

    pub(crate) fn get(&self, tag: MessageTag) -> Option<&Arc<dyn MessageHandler>> {
        self.slots[tag as usize].as_ref()
    }

    pub(crate) fn registered_tags(&self) -> impl Iterator<Item = MessageTag> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(tag, _)| tag as MessageTag)
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("tags", &self.registered_tags().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{HostPort, PeerAddress};
    use crate::PeerId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
    }

    impl MessageHandler for CountingHandler {
        fn on_message(
            &self,
            _conn: &Arc<Connection>,
            _keepalive: DrainLock,
            _version: ClusterVersion,
            _payload: &[u8],
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn empty_slots() -> [Option<Arc<dyn MessageHandler>>; MAX_MESSAGE_TAG] {
        std::array::from_fn(|_| None)
    }

    #[test]
    fn test_lookup_by_tag() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        let mut slots = empty_slots();
        slots[b'D' as usize] = Some(handler.clone() as Arc<dyn MessageHandler>);
        let table = HandlerTable::from_slots(slots);

        assert!(table.get(b'D').is_some());
        assert!(table.get(b'E').is_none());
        assert_eq!(table.registered_tags().collect::<Vec<_>>(), vec![b'D']);
    }

    #[test]
    fn test_default_local_path_delegates() {
        let handler = CountingHandler {
            calls: AtomicUsize::new(0),
        };
        let conn = Connection::new(
            PeerId::random(),
            PeerAddress::from_host_port(HostPort::new("127.0.0.1", 7600)),
            ClusterVersion::CURRENT,
            None,
        );
        let lock = conn.drainer().lock().unwrap();
        handler
            .on_local_message(&conn, lock, ClusterVersion::CURRENT, b"payload".to_vec())
            .unwrap();
        assert_eq!(handler.calls.load(Ordering::Relaxed), 1);
    }
}
