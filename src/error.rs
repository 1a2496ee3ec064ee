//! Crate-wide error types.
//!
//! The admission queue deliberately has none of these: per §7, every failure
//! on that path is a drop-and-count, not a propagated `Result` (the
//! datagram substrate handles retransmission, so there is nothing useful to
//! return to a caller). The decaying duplicate filter has exactly one
//! precondition that can be violated by a caller, and it is represented
//! here the way the teacher represents protocol-layer errors (`OpenError`,
//! `ListenError`, ...) with `thiserror`.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DdfError {
    #[error("entry has {actual} bytes, expected {expected}")]
    WrongLength { expected: usize, actual: usize },

    /// `add_long`/`is_known`'s numeric encoding only covers `entry_bytes` in
    /// `1..=8`; a filter configured outside that range is meant to be used
    /// with [`crate::ddf::DecayingDuplicateFilter::add`] directly.
    #[error("add_long/is_known require entry_bytes in 1..=8, filter is configured with {entry_bytes}")]
    LongWidthUnsupported { entry_bytes: usize },
}
