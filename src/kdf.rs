//! Session key derivation.
//!
//! A single-iteration NIST SP 800-108 counter-mode KDF:
//! `HMAC(zero_key, counter ‖ label ‖ 0x00 ‖ context)` where the context
//! is the raw shared secret from the key exchange. The PRF is selected
//! by the session's "crypto level", which is bound to the device's
//! attestation key type rather than the negotiated cipher; the SEK
//! length follows the cipher algorithm instead. The two axes are
//! deliberately independent.

use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::{Sha256, Sha384};

use crate::cipher::CipherAlgorithm;
use crate::kex::KexType;
use crate::keys::KeyKind;
use crate::proto::KDF_LABEL;
use crate::secret::SecretBytes;
use crate::types::{DigestKind, MacKind};

/// The two security classes of the protocol.
///
/// Level 0 is the 128-bit class (SHA-256 / HMAC-SHA256); level 1 the
/// 256/384-bit class (SHA-384 / HMAC-SHA384).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoLevel {
    Level0,
    Level1,
}

impl CryptoLevel {
    /// The level a device attestation key implies.
    pub fn from_key_kind(kind: KeyKind) -> Option<Self> {
        Some(match kind {
            KeyKind::Rsa2048Restr | KeyKind::EcdsaP256 => Self::Level0,
            KeyKind::RsaUr | KeyKind::EcdsaP384 => Self::Level1,
            _ => return None,
        })
    }

    /// The level a key-exchange type implies. The device chooses its
    /// exchange from its attestation key, so both mappings agree.
    pub fn from_kex_type(ty: KexType) -> Self {
        match ty {
            KexType::DhGroup14 | KexType::EcdhP256 | KexType::Asym2048 => Self::Level0,
            KexType::DhGroup15 | KexType::EcdhP384 | KexType::Asym3072 => Self::Level1,
        }
    }

    /// Digest used for voucher chain hashes at this level.
    pub fn digest_kind(self) -> DigestKind {
        match self {
            Self::Level0 => DigestKind::Sha256,
            Self::Level1 => DigestKind::Sha384,
        }
    }

    /// MAC type used for voucher HMACs at this level.
    pub fn mac_kind(self) -> MacKind {
        match self {
            Self::Level0 => MacKind::HmacSha256,
            Self::Level1 => MacKind::HmacSha384,
        }
    }

    /// PRF output size: 32 bytes (HMAC-SHA256) or 48 (HMAC-SHA384).
    pub fn prf_len(self) -> usize {
        match self {
            Self::Level0 => 32,
            Self::Level1 => 48,
        }
    }

    /// Session verification key length: 32 or 64 bytes.
    pub fn svk_len(self) -> usize {
        match self {
            Self::Level0 => 32,
            Self::Level1 => 64,
        }
    }

    /// Device HMAC secret length for new credentials.
    pub fn hmac_secret_len(self) -> usize {
        match self {
            Self::Level0 => 16,
            Self::Level1 => 64,
        }
    }
}

// One PRF invocation of the counter-mode KDF.
fn kdf_block(level: CryptoLevel, counter: u8, context: &[u8]) -> SecretBytes {
    const ZERO_KEY: [u8; 1] = [0];
    const SEPARATOR: [u8; 1] = [0];
    let bytes = match level {
        CryptoLevel::Level0 => {
            let mut m = Hmac::<Sha256>::new_from_slice(&ZERO_KEY).expect("any key length");
            m.update(&[counter]);
            m.update(KDF_LABEL);
            m.update(&SEPARATOR);
            m.update(context);
            m.finalize().into_bytes().to_vec()
        }
        CryptoLevel::Level1 => {
            let mut m = Hmac::<Sha384>::new_from_slice(&ZERO_KEY).expect("any key length");
            m.update(&[counter]);
            m.update(KDF_LABEL);
            m.update(&SEPARATOR);
            m.update(context);
            m.finalize().into_bytes().to_vec()
        }
    };
    SecretBytes::from_vec(bytes)
}

/// Derive the session encryption key from the raw shared secret.
///
/// Counter 1. The PRF follows `level`; the key length follows the
/// cipher algorithm, truncating the PRF output when it is longer.
pub fn derive_sek(level: CryptoLevel, algorithm: CipherAlgorithm, shared: &[u8]) -> SecretBytes {
    let block = kdf_block(level, 1, shared);
    SecretBytes::from_slice(&block.as_bytes()[..algorithm.key_len()])
}

/// Derive the session verification (MAC) key from the raw shared secret.
///
/// Counter 2 at level 0 (32 bytes); counters 2 and 3 concatenated at
/// level 1 (48 + 16 = 64 bytes).
pub fn derive_svk(level: CryptoLevel, shared: &[u8]) -> SecretBytes {
    match level {
        CryptoLevel::Level0 => kdf_block(level, 2, shared),
        CryptoLevel::Level1 => {
            let b2 = kdf_block(level, 2, shared);
            let b3 = kdf_block(level, 3, shared);
            let mut out = SecretBytes::new(64);
            out.as_mut()[..48].copy_from_slice(b2.as_bytes());
            out.as_mut()[48..].copy_from_slice(&b3.as_bytes()[..16]);
            out
        }
    }
}

/// A fresh device HMAC secret for rotated credentials.
pub fn fresh_hmac_secret(level: CryptoLevel) -> SecretBytes {
    let mut out = SecretBytes::new(level.hmac_secret_len());
    OsRng.fill_bytes(out.as_mut());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kdf_is_deterministic() {
        let shared = [0x42u8; 64];
        let a = derive_sek(CryptoLevel::Level0, CipherAlgorithm::Aes128, &shared);
        let b = derive_sek(CryptoLevel::Level0, CipherAlgorithm::Aes128, &shared);
        assert_eq!(a, b);
        let a = derive_svk(CryptoLevel::Level1, &shared);
        let b = derive_svk(CryptoLevel::Level1, &shared);
        assert_eq!(a, b);
    }

    #[test]
    fn sek_and_svk_differ() {
        let shared = [7u8; 48];
        let sek = derive_sek(CryptoLevel::Level0, CipherAlgorithm::Aes256, &shared);
        let svk = derive_svk(CryptoLevel::Level0, &shared);
        assert_ne!(sek.as_bytes(), &svk.as_bytes()[..sek.len()]);
    }

    #[test]
    fn sek_length_follows_cipher_not_level() {
        let shared = [1u8; 32];
        // AES-128 key cut from 48-byte HMAC-SHA384 output at level 1
        let sek = derive_sek(CryptoLevel::Level1, CipherAlgorithm::Aes128, &shared);
        assert_eq!(sek.len(), 16);
        // full 32-byte HMAC-SHA256 output for AES-256 at level 0
        let sek = derive_sek(CryptoLevel::Level0, CipherAlgorithm::Aes256, &shared);
        assert_eq!(sek.len(), 32);
    }

    #[test]
    fn truncated_sek_is_prefix_of_prf_output() {
        let shared = [9u8; 32];
        let short = derive_sek(CryptoLevel::Level1, CipherAlgorithm::Aes128, &shared);
        let long = derive_sek(CryptoLevel::Level1, CipherAlgorithm::Aes256, &shared);
        assert_eq!(short.as_bytes(), &long.as_bytes()[..16]);
    }

    #[test]
    fn svk_lengths() {
        let shared = [3u8; 32];
        assert_eq!(derive_svk(CryptoLevel::Level0, &shared).len(), 32);
        assert_eq!(derive_svk(CryptoLevel::Level1, &shared).len(), 64);
    }

    #[test]
    fn different_secrets_give_different_keys() {
        let a = derive_svk(CryptoLevel::Level0, &[1u8; 32]);
        let b = derive_svk(CryptoLevel::Level0, &[2u8; 32]);
        assert_ne!(a, b);
    }

    #[test]
    fn levels_from_key_kinds() {
        assert_eq!(CryptoLevel::from_key_kind(KeyKind::EcdsaP256), Some(CryptoLevel::Level0));
        assert_eq!(CryptoLevel::from_key_kind(KeyKind::EcdsaP384), Some(CryptoLevel::Level1));
        assert_eq!(CryptoLevel::from_key_kind(KeyKind::Rsa2048Restr), Some(CryptoLevel::Level0));
        assert_eq!(CryptoLevel::from_key_kind(KeyKind::RsaUr), Some(CryptoLevel::Level1));
        assert_eq!(CryptoLevel::from_key_kind(KeyKind::None), None);
    }
}
