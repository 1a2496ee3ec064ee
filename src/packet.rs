//! The narrow [`Packet`] contract the rest of the crate depends on.
//!
//! Nothing here parses or constructs wire bytes: a `Packet` is whatever the
//! caller's transport already produced, exposed through the handful of
//! observable attributes the admission queue and RST logic need.

use crate::connection::Identity;
use std::fmt;

/// Bits carried on every packet. Only the three flags the admission path
/// inspects are named; a real transport may define more and simply never
/// surface them through this trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u16);

impl PacketFlags {
    pub const SYN: Self = Self(0b001);
    pub const RST: Self = Self(0b010);
    pub const SIGNATURE_INCLUDED: Self = Self(0b100);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// One greater than the maximum legal `optional_delay`, making the poison
/// sentinel unforgeable from the wire (see [`is_poison`]).
pub const POISON: i64 = i64::from(u16::MAX) + 1;

/// The observable surface of an inbound (or outbound, for RSTs) packet.
///
/// Implementors own the actual byte buffer and any codec state; this trait
/// exists only so `admission` and `ddf` can be written against a stable,
/// minimal interface instead of a concrete wire format.
pub trait Packet: fmt::Debug + Send + Sync + 'static {
    /// The stream identifier the remote chose for packets it sends us.
    fn send_stream_id(&self) -> u32;

    /// The stream identifier the remote expects us to use. Zero means "not
    /// yet assigned".
    fn receive_stream_id(&self) -> u32;

    fn sequence_number(&self) -> u32;

    /// The sequence number being acknowledged/reset. Distinct from
    /// [`Packet::sequence_number`] (that packet's own sequence number): a RST
    /// names a different packet's sequence number as the one it is resetting
    /// (§4.1 "RST emission", `ack_through = inbound.sequence_number`).
    /// Packets that never carry an ack (an ordinary SYN, for instance)
    /// return `0`.
    fn ack_through(&self) -> u32;

    fn flags(&self) -> PacketFlags;

    /// The remote identity, if the packet carries one.
    fn optional_from(&self) -> Option<&Identity>;

    /// A small integer field, normally a delay request; the admission queue
    /// additionally uses it to carry the poison sentinel (see [`POISON`]).
    fn optional_delay(&self) -> i64;

    /// Releases any buffer backing this packet. Called exactly once, by
    /// whichever actor (consumer or timeout handler) ultimately drops the
    /// packet.
    fn release_payload(&self);
}

/// True when `packet.optional_delay() == POISON`, i.e. this is the
/// distinguished element used to unblock a blocked [`crate::admission::Acceptor`]
/// on shutdown. No legitimately parsed packet can carry this value: codecs
/// that map the wire delay field into `optional_delay` must clamp it to
/// `0..=u16::MAX`.
pub fn is_poison(packet: &dyn Packet) -> bool {
    packet.optional_delay() == POISON
}

/// Convenience check used throughout `admission`.
pub fn is_syn(packet: &dyn Packet) -> bool {
    packet.flags().contains(PacketFlags::SYN)
}
