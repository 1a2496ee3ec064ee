//! The [`ConnectionManager`] collaborator boundary.
//!
//! The admission queue never constructs or tears down connections itself; it
//! hands a SYN to a `ConnectionManager` and either gets an open
//! [`Connection`] back or doesn't. This mirrors the way the teacher's `Tcp`
//! protocol delegates session bookkeeping to its own `sessions` map rather
//! than inlining it into `demux`.

use crate::packet::Packet;
use std::fmt;
use std::sync::Arc;

/// An opaque remote-identity handle. Equality is the only operation the
/// admission queue needs: it compares the identity on a would-be duplicate
/// SYN against the identity already associated with an existing connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(Arc<[u8]>);

impl Identity {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().take(8) {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// An opaque handle to an established connection. Cheaply cloneable; the
/// admission queue only ever moves this around, never inspects it.
#[derive(Debug, Clone)]
pub struct Connection(Arc<dyn ConnectionHandle>);

impl Connection {
    pub fn new(inner: Arc<dyn ConnectionHandle>) -> Self {
        Self(inner)
    }

    pub fn receive_stream_id(&self) -> u32 {
        self.0.receive_stream_id()
    }

    pub fn remote_identity(&self) -> &Identity {
        self.0.remote_identity()
    }

    /// Re-dispatches a non-SYN packet that arrived before (or raced with)
    /// the SYN that created this connection.
    pub fn receive(&self, packet: Box<dyn Packet>) {
        self.0.receive(packet)
    }
}

/// What a concrete transport's connection object must expose for the
/// admission queue's bookkeeping. Kept separate from [`Connection`] so the
/// latter stays a plain, cloneable value type.
pub trait ConnectionHandle: fmt::Debug + Send + Sync + 'static {
    fn receive_stream_id(&self) -> u32;
    fn remote_identity(&self) -> &Identity;
    fn receive(&self, packet: Box<dyn Packet>);
}

/// The collaborator that owns connection lifecycle. See §6 of the admission
/// queue's design: `receive_connection`, `get_connection_by_receive_id`,
/// an outbound packet sink, and the local identity used to address RSTs.
pub trait ConnectionManager: Send + Sync + 'static {
    /// Offers a SYN packet to the manager. Returns `Some` if the manager
    /// accepted it and opened a connection.
    fn receive_connection(&self, syn: Box<dyn Packet>) -> Option<Connection>;

    /// Looks up an already-open connection by the `receive_stream_id` a
    /// packet names.
    fn get_connection_by_receive_id(&self, id: u32) -> Option<Connection>;

    /// Queues a packet (typically a RST) for outbound transmission.
    fn enqueue_outbound(&self, packet: Box<dyn Packet>);

    /// The local identity to address RSTs from.
    fn my_destination(&self) -> Identity;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use dashmap::DashMap;
    use std::sync::Mutex;

    /// A `ConnectionManager` test double: `receive_connection` always opens
    /// a connection keyed by the SYN's `receive_stream_id`, and outbound
    /// packets are recorded instead of transmitted.
    #[derive(Debug, Default)]
    pub struct TestConnectionManager {
        pub local_identity: Identity,
        connections: DashMap<u32, Connection>,
        pub outbound: Mutex<Vec<Box<dyn Packet>>>,
    }

    impl Default for Identity {
        fn default() -> Self {
            Identity::new(Arc::from(b"test-identity".as_slice()))
        }
    }

    #[derive(Debug)]
    struct TestConnection {
        receive_stream_id: u32,
        remote: Identity,
    }

    impl ConnectionHandle for TestConnection {
        fn receive_stream_id(&self) -> u32 {
            self.receive_stream_id
        }

        fn remote_identity(&self) -> &Identity {
            &self.remote
        }

        fn receive(&self, packet: Box<dyn Packet>) {
            packet.release_payload();
        }
    }

    impl TestConnectionManager {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn outbound_len(&self) -> usize {
            self.outbound.lock().unwrap().len()
        }
    }

    impl ConnectionManager for TestConnectionManager {
        fn receive_connection(&self, syn: Box<dyn Packet>) -> Option<Connection> {
            let remote = syn.optional_from()?.clone();
            let id = syn.receive_stream_id();
            let conn = Connection::new(Arc::new(TestConnection {
                receive_stream_id: id,
                remote,
            }));
            self.connections.insert(id, conn.clone());
            syn.release_payload();
            Some(conn)
        }

        fn get_connection_by_receive_id(&self, id: u32) -> Option<Connection> {
            self.connections.get(&id).map(|entry| entry.clone())
        }

        fn enqueue_outbound(&self, packet: Box<dyn Packet>) {
            self.outbound.lock().unwrap().push(packet);
        }

        fn my_destination(&self) -> Identity {
            self.local_identity.clone()
        }
    }
}
