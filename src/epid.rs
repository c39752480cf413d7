//! The external group-signature verifier seam.
//!
//! Legacy devices attest with a group-signature scheme whose math lives
//! in an external service. The protocol engine only needs a yes/no
//! verdict for a signature over a message bound to the session nonce,
//! so that is the whole interface.

use crate::types::Nonce;

/// Group-signature scheme versions a device may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpidVersion {
    V1_0,
    V1_1,
    V2_0,
}

/// A verifier-side failure (the verdict itself is the `Ok` bool).
#[derive(Debug)]
pub struct EpidError(pub String);

impl std::fmt::Display for EpidError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "epid verifier: {}", self.0)
    }
}

impl std::error::Error for EpidError {}

/// External verifier for group-signature attestations.
pub trait EpidVerifier: Send + Sync {
    /// Verify `signature` over `message` for the group key `group_key`,
    /// bound to `nonce` and `app_id`.
    fn verify(
        &self,
        version: EpidVersion,
        group_key: &[u8],
        message: &[u8],
        signature: &[u8],
        nonce: &Nonce,
        app_id: &[u8],
    ) -> Result<bool, EpidError>;
}
