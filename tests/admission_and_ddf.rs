//! Exercises the public API end to end: a connection manager that consults
//! a `DecayingDuplicateFilter` before handing a SYN to the admission queue,
//! the composition the crate's two halves are meant for.

use admission_core::{
    AdmissionQueue, AdmissionQueueConfig, Connection, ConnectionHandle, ConnectionManager,
    DecayingDuplicateFilter, DecayingDuplicateFilterConfig, Identity, Packet, PacketCodec,
    PacketFlags, TokioTimer,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

mod common;

#[derive(Debug)]
struct TestPacket {
    from: Identity,
    receive_stream_id: u32,
    sequence_number: u32,
    syn: bool,
    released: Arc<AtomicBool>,
}

impl Packet for TestPacket {
    fn send_stream_id(&self) -> u32 {
        0
    }

    fn receive_stream_id(&self) -> u32 {
        self.receive_stream_id
    }

    fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    fn ack_through(&self) -> u32 {
        0
    }

    fn flags(&self) -> PacketFlags {
        if self.syn {
            PacketFlags::SYN.union(PacketFlags::SIGNATURE_INCLUDED)
        } else {
            PacketFlags::empty()
        }
    }

    fn optional_from(&self) -> Option<&Identity> {
        Some(&self.from)
    }

    fn optional_delay(&self) -> i64 {
        0
    }

    fn release_payload(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct OpenConnection {
    receive_stream_id: u32,
    remote: Identity,
}

impl ConnectionHandle for OpenConnection {
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

/// Rejects a SYN whose `(remote identity, sequence number)` pair has already
/// been seen, using the duplicate filter as a replay guard ahead of the
/// admission queue's own per-connection duplicate check.
struct DedupingConnectionManager {
    ddf: Arc<DecayingDuplicateFilter>,
    connections: Mutex<Vec<Connection>>,
    outbound: Mutex<Vec<Box<dyn Packet>>>,
}

impl DedupingConnectionManager {
    fn new(ddf: Arc<DecayingDuplicateFilter>) -> Self {
        Self {
            ddf,
            connections: Mutex::new(Vec::new()),
            outbound: Mutex::new(Vec::new()),
        }
    }

    fn replay_key(from: &Identity, seq: u32) -> u64 {
        let mut key = [0u8; 8];
        key[..4].copy_from_slice(&seq.to_le_bytes());
        let tag = from.as_bytes().first().copied().unwrap_or(0);
        key[4] = tag;
        u64::from_le_bytes(key)
    }
}

impl ConnectionManager for DedupingConnectionManager {
    fn receive_connection(&self, syn: Box<dyn Packet>) -> Option<Connection> {
        let from = syn.optional_from()?.clone();
        let key = Self::replay_key(&from, syn.sequence_number());
        if self.ddf.add_long(key).expect("replay key filter is configured with entry_bytes = 8") {
            syn.release_payload();
            return None;
        }
        let conn = Connection::new(Arc::new(OpenConnection {
            receive_stream_id: syn.receive_stream_id(),
            remote: from,
        }));
        self.connections.lock().unwrap().push(conn.clone());
        syn.release_payload();
        Some(conn)
    }

    fn get_connection_by_receive_id(&self, id: u32) -> Option<Connection> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .find(|conn| conn.receive_stream_id() == id)
            .cloned()
    }

    fn enqueue_outbound(&self, packet: Box<dyn Packet>) {
        self.outbound.lock().unwrap().push(packet);
    }

    fn my_destination(&self) -> Identity {
        Identity::new(Arc::from(b"server".as_slice()))
    }
}

struct AcceptAllCodec;

impl PacketCodec for AcceptAllCodec {
    fn verify_signature(&self, _packet: &dyn Packet, _claimed_sender: &Identity) -> bool {
        true
    }
}

#[tokio::test]
async fn replayed_syn_is_rejected_before_a_second_connection_opens() -> anyhow::Result<()> {
    common::init_tracing();
    let timer = Arc::new(TokioTimer::new());
    let ddf = DecayingDuplicateFilter::new(
        DecayingDuplicateFilterConfig {
            duration_ms: 60_000,
            entry_bytes: 8,
        },
        timer.clone(),
    );
    let connections = Arc::new(DedupingConnectionManager::new(ddf));
    let queue = AdmissionQueue::new(
        AdmissionQueueConfig::default(),
        connections,
        Arc::new(AcceptAllCodec),
        timer,
    );
    queue.set_active(true).await;
    let acceptor = Arc::clone(&queue).acceptor();

    let from = Identity::new(Arc::from(b"client-1".as_slice()));
    let make_syn = |receive_stream_id: u32, seq: u32| {
        Box::new(TestPacket {
            from: from.clone(),
            receive_stream_id,
            sequence_number: seq,
            syn: true,
            released: Arc::new(AtomicBool::new(false)),
        })
    };

    Arc::clone(&queue).receive_new_syn(make_syn(42, 1));
    let first = acceptor.accept(500).await;
    anyhow::ensure!(first.is_some(), "first SYN should open a connection");

    // A replay carrying a different receive_stream_id: the admission
    // queue's own duplicate-SYN check only looks at the stream id already
    // associated with an open connection, so it lets this one through to
    // the connection manager. It is the duplicate filter, keyed on
    // `(identity, sequence number)`, that catches the replay.
    Arc::clone(&queue).receive_new_syn(make_syn(99, 1));
    let replay = acceptor.accept(50).await;
    anyhow::ensure!(replay.is_none(), "replayed SYN should not open a second connection");

    Arc::clone(&queue).receive_new_syn(make_syn(7, 2));
    let second = acceptor.accept(500).await;
    anyhow::ensure!(second.is_some(), "a genuinely new SYN should still open a connection");

    anyhow::ensure!(
        queue.stats().snapshot().accepts == 2,
        "expected exactly 2 accepts, got {}",
        queue.stats().snapshot().accepts
    );
    tracing::info!(stats = %queue.stats(), "replay scenario finished");
    Ok(())
}
