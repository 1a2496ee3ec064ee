//! A bounded connection admission queue and decaying duplicate filter for
//! anonymizing, datagram-substrate streaming transports.
//!
//! # Uses
//!
//! - Transport implementations that sit on top of an unreliable, possibly
//!   adversarial datagram substrate can use [`AdmissionQueue`] to bound the
//!   backlog of inbound connection attempts and [`DecayingDuplicateFilter`]
//!   to reject replayed packets, without either component blocking a
//!   producer thread or growing without limit under load or attack.
//!
//! # Organization
//!
//! - [`packet`] defines the minimal `Packet` surface both components need.
//! - [`connection`] defines the `ConnectionManager` collaborator the
//!   admission queue hands accepted and re-dispatched packets to.
//! - [`codec`] defines the `PacketCodec` collaborator used to verify
//!   signatures before a RST is sent.
//! - [`timer`] is the injectable clock/scheduler shared by the other two.
//! - [`admission`] is the Admission Queue itself.
//! - [`ddf`] is the Decaying Duplicate Filter itself.
//! - [`error`] and [`stats`] hold the crate's error types and observability
//!   counters.

pub mod admission;
pub use admission::{AdmissionQueue, AdmissionQueueConfig};

pub mod codec;
pub use codec::PacketCodec;

pub mod connection;
pub use connection::{Connection, ConnectionHandle, ConnectionManager, Identity};

pub mod ddf;
pub use ddf::{DecayingDuplicateFilter, DecayingDuplicateFilterConfig};

pub mod error;
pub use error::DdfError;

pub mod packet;
pub use packet::{Packet, PacketFlags};

pub mod stats;
pub use stats::{AdmissionStats, AdmissionStatsSnapshot, DdfStats};

pub mod timer;
pub use timer::{TimerHandle, TimerService, TokioTimer, VirtualTimer};

use dashmap::DashMap;
use std::hash::BuildHasherDefault;

/// A `DashMap` keyed by `rustc_hash::FxHasher` instead of the default
/// SipHash, used wherever a collection's keys (sequence numbers, timer ids)
/// are already well distributed and do not need DoS-resistant hashing.
pub type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;
