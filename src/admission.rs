//! The connection admission queue (§2 "Admission Queue (AQ)", §4.1).
//!
//! Bounds the backlog of inbound SYN-bearing packets, times each one out if
//! nobody accepts it, suppresses duplicate SYNs without extra locking (by
//! restricting `accept` to a single consumer, see [`Acceptor`]), and emits
//! RSTs for packets it has to drop rather than silently dropping them and
//! leaving the remote hanging.

use crate::codec::PacketCodec;
use crate::connection::{Connection, ConnectionManager};
use crate::packet::{self, Packet, PacketFlags, POISON};
use crate::stats::AdmissionStats;
use crate::timer::{TimerHandle, TimerService};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Default bound on the number of packets waiting for `accept` (§6).
pub const MAX_QUEUE_SIZE: usize = 64;

/// Default per-entry deadline after enqueue, in milliseconds (§6).
pub const DEFAULT_ACCEPT_TIMEOUT_MS: i64 = 3000;

/// Construction-time parameters for an [`AdmissionQueue`].
#[derive(Debug, Clone, Copy)]
pub struct AdmissionQueueConfig {
    pub capacity: usize,
    pub accept_timeout_ms: i64,
}

impl Default for AdmissionQueueConfig {
    fn default() -> Self {
        Self {
            capacity: MAX_QUEUE_SIZE,
            accept_timeout_ms: DEFAULT_ACCEPT_TIMEOUT_MS,
        }
    }
}

/// A packet together with the bookkeeping the queue needs to remove it
/// again, either from `accept` or from its own timeout handler.
struct Entry {
    seq: u64,
    packet: Box<dyn Packet>,
}

/// The distinguished element used to unblock a blocked [`Acceptor`] on
/// shutdown (§3, §9 "Packet as sum type"). It is a real `Packet`, not a
/// separate type, so it survives transport through the same queue as any
/// other entry without a downcast.
#[derive(Debug)]
struct PoisonPacket;

impl Packet for PoisonPacket {
    fn send_stream_id(&self) -> u32 {
        0
    }

    fn receive_stream_id(&self) -> u32 {
        0
    }

    fn sequence_number(&self) -> u32 {
        0
    }

    fn ack_through(&self) -> u32 {
        0
    }

    fn flags(&self) -> PacketFlags {
        PacketFlags::empty()
    }

    fn optional_from(&self) -> Option<&crate::connection::Identity> {
        None
    }

    fn optional_delay(&self) -> i64 {
        POISON
    }

    fn release_payload(&self) {}
}

/// Bounded FIFO of pending inbound packets with per-entry deadlines,
/// duplicate-SYN suppression, and RST emission on reject/timeout.
///
/// Cloning an `Arc<AdmissionQueue>` is the intended way to share it between
/// the producer side (any thread calling [`AdmissionQueue::receive_new_syn`])
/// and the single consumer (an [`Acceptor`], obtained via
/// [`AdmissionQueue::acceptor`]).
pub struct AdmissionQueue {
    queue: Mutex<VecDeque<Entry>>,
    capacity: usize,
    accept_timeout_ms: i64,
    active: AtomicBool,
    notify_not_empty: Notify,
    next_seq: AtomicU64,
    pending_timers: crate::FxDashMap<u64, TimerHandle>,
    acceptor_taken: AtomicBool,
    stats: AdmissionStats,
    connections: Arc<dyn ConnectionManager>,
    codec: Arc<dyn PacketCodec>,
    timer: Arc<dyn TimerService>,
}

impl AdmissionQueue {
    pub fn new(
        config: AdmissionQueueConfig,
        connections: Arc<dyn ConnectionManager>,
        codec: Arc<dyn PacketCodec>,
        timer: Arc<dyn TimerService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(config.capacity)),
            capacity: config.capacity,
            accept_timeout_ms: config.accept_timeout_ms,
            active: AtomicBool::new(false),
            notify_not_empty: Notify::new(),
            next_seq: AtomicU64::new(1),
            pending_timers: crate::FxDashMap::default(),
            acceptor_taken: AtomicBool::new(false),
            stats: AdmissionStats::new(),
            connections,
            codec,
            timer,
        })
    }

    pub fn stats(&self) -> &AdmissionStats {
        &self.stats
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Obtains the single consumer-side handle. Panics if one has already
    /// been created: the single-consumer discipline that lets `accept`
    /// dedup SYNs without extra locking (§9) is enforced at the type level,
    /// not just documented. Callers that still need `self` afterward (to
    /// keep calling `receive_new_syn`) should pass in a clone, the same way
    /// the teacher's protocol methods consume an `Arc<Self>` they already
    /// cloned out of a session map.
    pub fn acceptor(self: Arc<Self>) -> Acceptor {
        if self
            .acceptor_taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("AdmissionQueue::acceptor called more than once");
        }
        Acceptor {
            queue: self,
            _not_sync: std::marker::PhantomData,
        }
    }

    /// Toggles the lifecycle flag (§4.1). Turning off enqueues a poison
    /// sentinel, blocking until space is available, so a blocked `accept`
    /// wakes deterministically and observes termination.
    pub async fn set_active(&self, on: bool) {
        if on {
            self.active.store(true, Ordering::Release);
            return;
        }
        self.active.store(false, Ordering::Release);
        loop {
            let notified = self.notify_not_empty.notified();
            let inserted = {
                let mut queue = self.queue.lock().unwrap();
                if queue.len() < self.capacity {
                    queue.push_back(Entry {
                        seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                        packet: Box::new(PoisonPacket),
                    });
                    true
                } else {
                    false
                }
            };
            if inserted {
                self.notify_not_empty.notify_one();
                return;
            }
            notified.await;
        }
    }

    /// Producer entry point. Never blocks. Takes `self` by `Arc` value, the
    /// way the teacher's protocol methods consume a session `Arc` they
    /// already cloned out of a map; callers still needing the queue
    /// afterward pass a clone.
    pub fn receive_new_syn(self: Arc<Self>, packet: Box<dyn Packet>) {
        if !self.is_active() {
            AdmissionStats::inc(&self.stats.drops_inactive);
            tracing::debug!("admission queue inactive, dropping inbound packet");
            if packet::is_syn(&*packet) {
                self.send_reset(&*packet);
            }
            packet.release_payload();
            return;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let rejected = {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                Some(packet)
            } else {
                queue.push_back(Entry { seq, packet });
                self.stats.queue_depth.store(queue.len() as i64, Ordering::Relaxed);
                None
            }
        };

        match rejected {
            Some(packet) => {
                AdmissionStats::inc(&self.stats.drops_full);
                tracing::debug!("admission queue full, dropping inbound packet");
                if packet::is_syn(&*packet) {
                    self.send_reset(&*packet);
                }
                packet.release_payload();
            }
            None => {
                self.notify_not_empty.notify_one();
                self.arm_timeout(seq);
            }
        }
    }

    fn arm_timeout(self: Arc<Self>, seq: u64) {
        let handler_queue = self.clone();
        let handle = self.timer.schedule(
            self.accept_timeout_ms,
            Box::new(move || handler_queue.handle_timeout(seq)),
        );
        self.pending_timers.insert(seq, handle);
    }

    fn handle_timeout(&self, seq: u64) {
        self.pending_timers.remove(&seq);
        let Some(packet) = self.remove_by_seq(seq) else {
            // Already dequeued by `accept`; exactly one of the two wins (§5).
            return;
        };
        AdmissionStats::inc(&self.stats.timeouts);
        if packet::is_syn(&*packet) {
            tracing::debug!(seq, "SYN timed out, sending RST");
            self.send_reset(&*packet);
            packet.release_payload();
        } else {
            tracing::debug!(seq, "non-SYN packet timed out, attempting re-dispatch");
            self.redispatch_or_drop(packet);
        }
    }

    fn remove_by_seq(&self, seq: u64) -> Option<Box<dyn Packet>> {
        let mut queue = self.queue.lock().unwrap();
        let index = queue.iter().position(|entry| entry.seq == seq)?;
        let entry = queue.remove(index).expect("index was just found");
        self.stats.queue_depth.store(queue.len() as i64, Ordering::Relaxed);
        Some(entry.packet)
    }

    /// Dequeues the front entry, if any, and wakes anyone waiting for space
    /// to free up — including a `set_active(false)` poison insert blocked on
    /// a full queue (§5: the poison enqueue "suspends until space is
    /// available", which requires a dequeue to eventually wake it).
    fn dequeue_front(&self) -> Option<(u64, Box<dyn Packet>)> {
        let mut queue = self.queue.lock().unwrap();
        let entry = queue.pop_front()?;
        self.stats.queue_depth.store(queue.len() as i64, Ordering::Relaxed);
        drop(queue);
        self.notify_not_empty.notify_one();
        Some((entry.seq, entry.packet))
    }

    fn cancel_timeout(&self, seq: u64) {
        if let Some((_, handle)) = self.pending_timers.remove(&seq) {
            self.timer.cancel(handle);
        }
    }

    /// Re-dispatches a non-SYN packet to its connection if one now exists;
    /// otherwise releases its payload and drops it (§4.1 "Non-SYN packet
    /// path").
    fn redispatch_or_drop(&self, packet: Box<dyn Packet>) {
        match self.connections.get_connection_by_receive_id(packet.receive_stream_id()) {
            Some(connection) => connection.receive(packet),
            None => packet.release_payload(),
        }
    }

    /// Constructs and sends a RST in response to `inbound` (§4.1 "RST
    /// emission"). Verifies the inbound signature first: a forged packet
    /// never earns a reply, which would otherwise be a spoofing
    /// amplification vector (§7, property 7).
    fn send_reset(&self, inbound: &dyn Packet) {
        let Some(from) = inbound.optional_from() else {
            // Nothing to address a RST to.
            return;
        };
        if !self.codec.verify_signature(inbound, from) {
            AdmissionStats::inc(&self.stats.drops_bad_signature);
            tracing::warn!("signature verification failed, dropping would-be RST target");
            return;
        }
        let reset = ResetPacket {
            to: from.clone(),
            ack_through: inbound.sequence_number(),
            send_stream_id: inbound.receive_stream_id(),
            from: self.connections.my_destination(),
        };
        self.connections.enqueue_outbound(Box::new(reset));
        AdmissionStats::inc(&self.stats.resets_sent);
    }
}

/// The single-consumer handle obtained from [`AdmissionQueue::acceptor`].
/// Not `Sync`, so it cannot be shared across threads: this is the type-level
/// guarantee behind the "no concurrent `accept()` callers" discipline (§9).
pub struct Acceptor {
    queue: Arc<AdmissionQueue>,
    _not_sync: std::marker::PhantomData<std::cell::Cell<()>>,
}

impl Acceptor {
    /// Consumer entry point (§4.1). Blocks up to `timeout_ms`; a
    /// non-positive `timeout_ms` blocks indefinitely.
    pub async fn accept(&self, timeout_ms: i64) -> Option<Connection> {
        let deadline_ms = if timeout_ms <= 0 {
            None
        } else {
            Some(self.queue.timer.now_ms() + timeout_ms)
        };

        loop {
            if let Some(deadline) = deadline_ms {
                if self.queue.timer.now_ms() >= deadline {
                    return None;
                }
            }

            if !self.queue.is_active() {
                self.drain_with_reset();
                return None;
            }

            let (seq, packet) = match self.wait_and_dequeue(deadline_ms).await {
                Some(item) => item,
                None => return None,
            };
            self.queue.cancel_timeout(seq);

            if packet::is_poison(&*packet) {
                return None;
            }

            if packet::is_syn(&*packet) {
                let Some(from) = packet.optional_from() else {
                    AdmissionStats::inc(&self.queue.stats.drops_no_from);
                    packet.release_payload();
                    continue;
                };

                if let Some(existing) = self
                    .queue
                    .connections
                    .get_connection_by_receive_id(packet.receive_stream_id())
                {
                    if existing.remote_identity() == from {
                        AdmissionStats::inc(&self.queue.stats.drops_duplicate);
                        tracing::debug!("duplicate SYN for existing connection, dropping");
                        packet.release_payload();
                        continue;
                    }
                }

                if let Some(connection) = self.queue.connections.receive_connection(packet) {
                    AdmissionStats::inc(&self.queue.stats.accepts);
                    return Some(connection);
                }
                continue;
            }

            self.queue.redispatch_or_drop(packet);
        }
    }

    async fn wait_and_dequeue(&self, deadline_ms: Option<i64>) -> Option<(u64, Box<dyn Packet>)> {
        loop {
            let notified = self.queue.notify_not_empty.notified();
            if let Some(item) = self.queue.dequeue_front() {
                return Some(item);
            }
            if !self.queue.is_active() {
                return None;
            }
            match deadline_ms {
                None => notified.await,
                Some(deadline) => {
                    let now = self.queue.timer.now_ms();
                    if now >= deadline {
                        return None;
                    }
                    let remaining = std::time::Duration::from_millis((deadline - now) as u64);
                    if tokio::time::timeout(remaining, notified).await.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Drains the queue non-blockingly, emitting a RST for every packet that
    /// is not the poison sentinel (§4.1 "Consumer algorithm", step 2; §8 S4).
    fn drain_with_reset(&self) {
        while let Some((seq, packet)) = self.queue.dequeue_front() {
            self.queue.cancel_timeout(seq);
            if packet::is_poison(&*packet) {
                continue;
            }
            if packet::is_syn(&*packet) {
                self.queue.send_reset(&*packet);
            }
            packet.release_payload();
        }
    }
}

/// A RST constructed by [`AdmissionQueue::send_reset`]. `ack_through`
/// (exposed via [`Packet::ack_through`]) names the inbound sequence number
/// being reset; `send_stream_id` is the inbound's `receive_stream_id`,
/// continuing the convention that each side's send id is the other's
/// receive id.
#[derive(Debug)]
struct ResetPacket {
    to: crate::connection::Identity,
    ack_through: u32,
    send_stream_id: u32,
    from: crate::connection::Identity,
}

impl Packet for ResetPacket {
    fn send_stream_id(&self) -> u32 {
        self.send_stream_id
    }

    fn receive_stream_id(&self) -> u32 {
        0
    }

    fn sequence_number(&self) -> u32 {
        0
    }

    fn ack_through(&self) -> u32 {
        self.ack_through
    }

    fn flags(&self) -> PacketFlags {
        PacketFlags::RST.union(PacketFlags::SIGNATURE_INCLUDED)
    }

    fn optional_from(&self) -> Option<&crate::connection::Identity> {
        Some(&self.to)
    }

    fn optional_delay(&self) -> i64 {
        0
    }

    fn release_payload(&self) {}
}
