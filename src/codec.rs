//! The [`PacketCodec`] collaborator: signature verification for RST
//! anti-amplification (§4.1 "RST emission").

use crate::connection::Identity;
use crate::packet::Packet;

/// Verifies packet signatures. The admission queue calls this exactly once
/// per would-be RST, before ever touching the network, so that a forged
/// packet can never be turned into an amplified reply.
pub trait PacketCodec: Send + Sync + 'static {
    fn verify_signature(&self, packet: &dyn Packet, claimed_sender: &Identity) -> bool;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Accepts every signature. Used by tests that aren't exercising the
    /// anti-amplification path.
    #[derive(Debug, Default)]
    pub struct AlwaysValid;

    impl PacketCodec for AlwaysValid {
        fn verify_signature(&self, _packet: &dyn Packet, _claimed_sender: &Identity) -> bool {
            true
        }
    }

    /// Rejects every signature. Used to exercise property 7: RST is never
    /// emitted for a packet whose signature fails verification.
    #[derive(Debug, Default)]
    pub struct AlwaysInvalid;

    impl PacketCodec for AlwaysInvalid {
        fn verify_signature(&self, _packet: &dyn Packet, _claimed_sender: &Identity) -> bool {
            false
        }
    }
}
