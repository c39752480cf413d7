//! The two session cipher modes of the encrypted-message channel.
//!
//! CTR mode keeps one IV for the whole session: a 12-byte random nonce
//! chosen at session start plus a 32-bit big-endian block counter that
//! starts at zero and advances by the block count of every ciphertext.
//! Both ends must track the counter identically or they desynchronize.
//! CBC mode draws a fresh random IV per message and pads with PKCS#7.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes256};
use rand_core::{OsRng, RngCore};

use crate::codec::{self, CodecError, Reader};
use crate::proto::{CIPHER_BLOCK_SIZE, CTR_NONCE_SIZE};
use crate::secret::SecretBytes;
use crate::types::MacKind;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Cipher key strength; the algorithm part of a cipher-suite name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    Aes128,
    Aes256,
}

impl CipherAlgorithm {
    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes256 => 32,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Aes128 => "AES128",
            Self::Aes256 => "AES256",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "AES128" => Self::Aes128,
            "AES256" => Self::Aes256,
            _ => return None,
        })
    }
}

/// Block cipher chaining mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Ctr,
    Cbc,
}

impl CipherMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ctr => "CTR",
            Self::Cbc => "CBC",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "CTR" => Self::Ctr,
            "CBC" => Self::Cbc,
            _ => return None,
        })
    }
}

/// A negotiated cipher suite; wire form `"ALG/MODE/MACTYPE"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuite {
    pub algorithm: CipherAlgorithm,
    pub mode: CipherMode,
    pub mac: MacKind,
}

impl CipherSuite {
    pub fn new(algorithm: CipherAlgorithm, mode: CipherMode, mac: MacKind) -> Self {
        Self { algorithm, mode, mac }
    }

    pub fn encode(&self, out: &mut String) {
        let mac = match self.mac {
            MacKind::HmacSha256 => "HMAC-SHA256",
            MacKind::HmacSha384 => "HMAC-SHA384",
            MacKind::None => "NONE",
        };
        codec::write_string(out, &format!("{}/{}/{}", self.algorithm.name(), self.mode.name(), mac));
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let at = r.position();
        let s = r.string()?;
        let mut parts = s.split('/');
        let (Some(alg), Some(mode), Some(mac), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CodecError::Unexpected(at));
        };
        let algorithm = CipherAlgorithm::from_name(alg).ok_or(CodecError::Unexpected(at))?;
        let mode = CipherMode::from_name(mode).ok_or(CodecError::Unexpected(at))?;
        let mac = match mac {
            "HMAC-SHA256" => MacKind::HmacSha256,
            "HMAC-SHA384" => MacKind::HmacSha384,
            "NONE" => MacKind::None,
            _ => return Err(CodecError::Unexpected(at)),
        };
        Ok(Self { algorithm, mode, mac })
    }
}

/// A cipher failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherError {
    /// The ciphertext or its IV had an impossible shape or padding.
    Malformed,
    /// Key material did not match the negotiated algorithm. These are
    /// local programming failures, not peer input.
    BadKey,
}

impl std::fmt::Display for CipherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed ciphertext"),
            Self::BadKey => write!(f, "session key does not fit cipher"),
        }
    }
}

impl std::error::Error for CipherError {}

/// An IV and ciphertext pair, as carried inside the encrypted envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherText {
    pub iv: Vec<u8>,
    pub ct: Vec<u8>,
}

enum ModeState {
    Ctr {
        nonce: [u8; CTR_NONCE_SIZE],
        counter: u64, // 4 unsigned bytes won't fit an i32, keep it wide
    },
    Cbc,
}

/// One side's cipher for the encrypted remainder of a session.
///
/// Lives from key derivation to the end of the session; the key is
/// scrubbed when the cipher is dropped.
pub struct SessionCipher {
    sek: SecretBytes,
    algorithm: CipherAlgorithm,
    state: ModeState,
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl SessionCipher {
    /// Build a session cipher around a freshly derived SEK.
    ///
    /// For CTR the 12-byte session nonce is drawn here, independently on
    /// each side, and the block counter starts at zero.
    pub fn new(sek: SecretBytes, suite: CipherSuite) -> Result<Self, CipherError> {
        if sek.len() != suite.algorithm.key_len() {
            return Err(CipherError::BadKey);
        }
        let state = match suite.mode {
            CipherMode::Ctr => {
                let mut nonce = [0u8; CTR_NONCE_SIZE];
                OsRng.fill_bytes(&mut nonce);
                ModeState::Ctr { nonce, counter: 0 }
            }
            CipherMode::Cbc => ModeState::Cbc,
        };
        Ok(Self { sek, algorithm: suite.algorithm, state })
    }

    /// Encipher one message, advancing CTR counter state.
    pub fn encipher(&mut self, plain: &[u8]) -> Result<CipherText, CipherError> {
        match &mut self.state {
            ModeState::Ctr { nonce, counter } => {
                let mut iv = [0u8; CIPHER_BLOCK_SIZE];
                iv[..CTR_NONCE_SIZE].copy_from_slice(nonce);
                iv[CTR_NONCE_SIZE..].copy_from_slice(&(*counter as u32).to_be_bytes());
                let mut ct = plain.to_vec();
                apply_ctr(self.algorithm, self.sek.as_bytes(), &iv, &mut ct)?;
                // advance by the block count of this ciphertext
                if !ct.is_empty() {
                    *counter += 1 + (ct.len() as u64 - 1) / CIPHER_BLOCK_SIZE as u64;
                }
                Ok(CipherText { iv: iv.to_vec(), ct })
            }
            ModeState::Cbc => {
                let mut iv = [0u8; CIPHER_BLOCK_SIZE];
                OsRng.fill_bytes(&mut iv);
                let ct = match self.algorithm {
                    CipherAlgorithm::Aes128 => {
                        cbc::Encryptor::<Aes128>::new_from_slices(self.sek.as_bytes(), &iv)
                            .map_err(|_| CipherError::BadKey)?
                            .encrypt_padded_vec_mut::<Pkcs7>(plain)
                    }
                    CipherAlgorithm::Aes256 => {
                        cbc::Encryptor::<Aes256>::new_from_slices(self.sek.as_bytes(), &iv)
                            .map_err(|_| CipherError::BadKey)?
                            .encrypt_padded_vec_mut::<Pkcs7>(plain)
                    }
                };
                Ok(CipherText { iv: iv.to_vec(), ct })
            }
        }
    }

    /// Decipher one message using the IV it carries.
    pub fn decipher(&self, text: &CipherText) -> Result<Vec<u8>, CipherError> {
        if text.iv.len() != CIPHER_BLOCK_SIZE {
            return Err(CipherError::Malformed);
        }
        match self.state {
            ModeState::Ctr { .. } => {
                let mut plain = text.ct.clone();
                apply_ctr(self.algorithm, self.sek.as_bytes(), &text.iv, &mut plain)?;
                Ok(plain)
            }
            ModeState::Cbc => match self.algorithm {
                CipherAlgorithm::Aes128 => {
                    cbc::Decryptor::<Aes128>::new_from_slices(self.sek.as_bytes(), &text.iv)
                        .map_err(|_| CipherError::BadKey)?
                        .decrypt_padded_vec_mut::<Pkcs7>(&text.ct)
                        .map_err(|_| CipherError::Malformed)
                }
                CipherAlgorithm::Aes256 => {
                    cbc::Decryptor::<Aes256>::new_from_slices(self.sek.as_bytes(), &text.iv)
                        .map_err(|_| CipherError::BadKey)?
                        .decrypt_padded_vec_mut::<Pkcs7>(&text.ct)
                        .map_err(|_| CipherError::Malformed)
                }
            },
        }
    }

    /// The IV the next CTR encipher call will use. CBC has no session IV.
    pub fn next_iv(&self) -> Option<[u8; CIPHER_BLOCK_SIZE]> {
        match &self.state {
            ModeState::Ctr { nonce, counter } => {
                let mut iv = [0u8; CIPHER_BLOCK_SIZE];
                iv[..CTR_NONCE_SIZE].copy_from_slice(nonce);
                iv[CTR_NONCE_SIZE..].copy_from_slice(&(*counter as u32).to_be_bytes());
                Some(iv)
            }
            ModeState::Cbc => None,
        }
    }
}

fn apply_ctr(
    algorithm: CipherAlgorithm,
    key: &[u8],
    iv: &[u8],
    buf: &mut [u8],
) -> Result<(), CipherError> {
    match algorithm {
        CipherAlgorithm::Aes128 => {
            let mut c = Aes128Ctr::new_from_slices(key, iv).map_err(|_| CipherError::BadKey)?;
            c.apply_keystream(buf);
        }
        CipherAlgorithm::Aes256 => {
            let mut c = Aes256Ctr::new_from_slices(key, iv).map_err(|_| CipherError::BadKey)?;
            c.apply_keystream(buf);
        }
    }
    Ok(())
}

impl CipherText {
    /// Wire form `[[ivlen,"b64"],ctlen,"b64"]`.
    pub fn encode(&self, out: &mut String) -> Result<(), CodecError> {
        out.push(codec::BEGIN_ARRAY);
        out.push(codec::BEGIN_ARRAY);
        codec::write_uint(out, self.iv.len() as u64, 8)?;
        out.push(codec::COMMA);
        codec::write_bytes(out, &self.iv);
        out.push(codec::END_ARRAY);
        out.push(codec::COMMA);
        codec::write_uint(out, self.ct.len() as u64, 16)?;
        out.push(codec::COMMA);
        codec::write_bytes(out, &self.ct);
        out.push(codec::END_ARRAY);
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        r.expect(codec::BEGIN_ARRAY)?;
        r.expect(codec::BEGIN_ARRAY)?;
        let ivlen = r.uint8()? as usize;
        r.expect(codec::COMMA)?;
        let iv = r.bytes()?;
        r.expect(codec::END_ARRAY)?;
        if iv.len() != ivlen {
            return Err(CodecError::LengthMismatch);
        }
        r.expect(codec::COMMA)?;
        let ctlen = r.uint16()? as usize;
        r.expect(codec::COMMA)?;
        let ct = r.bytes()?;
        r.expect(codec::END_ARRAY)?;
        if ct.len() != ctlen {
            return Err(CodecError::LengthMismatch);
        }
        Ok(Self { iv, ct })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suite(mode: CipherMode) -> CipherSuite {
        CipherSuite::new(CipherAlgorithm::Aes128, mode, MacKind::HmacSha256)
    }

    fn key16() -> SecretBytes {
        SecretBytes::from_slice(&[0x11u8; 16])
    }

    #[test]
    fn ctr_round_trip() {
        let mut enc = SessionCipher::new(key16(), suite(CipherMode::Ctr)).unwrap();
        let dec = SessionCipher::new(key16(), suite(CipherMode::Ctr)).unwrap();
        for plain in [&b""[..], &b"x"[..], &[7u8; 100][..]] {
            let ct = enc.encipher(plain).unwrap();
            assert_eq!(dec.decipher(&ct).unwrap(), plain);
        }
    }

    #[test]
    fn cbc_round_trip() {
        let mut enc = SessionCipher::new(key16(), suite(CipherMode::Cbc)).unwrap();
        let dec = SessionCipher::new(key16(), suite(CipherMode::Cbc)).unwrap();
        for plain in [&b""[..], &b"abc"[..], &[9u8; 64][..]] {
            let ct = enc.encipher(plain).unwrap();
            // CBC always pads to a whole number of blocks
            assert_eq!(ct.ct.len() % CIPHER_BLOCK_SIZE, 0);
            assert_eq!(dec.decipher(&ct).unwrap(), plain);
        }
    }

    #[test]
    fn ctr_counter_advances_by_block_count() {
        let mut enc = SessionCipher::new(key16(), suite(CipherMode::Ctr)).unwrap();
        let iv0 = enc.next_iv().unwrap();
        assert_eq!(&iv0[CTR_NONCE_SIZE..], &[0, 0, 0, 0]);

        // 33 bytes = 3 blocks
        enc.encipher(&[0u8; 33]).unwrap();
        let iv1 = enc.next_iv().unwrap();
        assert_eq!(&iv1[CTR_NONCE_SIZE..], &3u32.to_be_bytes());
        // the session nonce part never changes
        assert_eq!(&iv0[..CTR_NONCE_SIZE], &iv1[..CTR_NONCE_SIZE]);

        // exactly one block
        enc.encipher(&[0u8; 16]).unwrap();
        let iv2 = enc.next_iv().unwrap();
        assert_eq!(&iv2[CTR_NONCE_SIZE..], &4u32.to_be_bytes());
    }

    #[test]
    fn ctr_ivs_never_repeat_across_messages() {
        let mut enc = SessionCipher::new(key16(), suite(CipherMode::Ctr)).unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let ct = enc.encipher(&[1u8; 24]).unwrap();
            assert!(seen.insert(ct.iv.clone()), "IV reused within a session");
        }
    }

    #[test]
    fn cbc_iv_is_fresh_per_message() {
        let mut enc = SessionCipher::new(key16(), suite(CipherMode::Cbc)).unwrap();
        let a = enc.encipher(b"same plaintext").unwrap();
        let b = enc.encipher(b"same plaintext").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ct, b.ct);
    }

    #[test]
    fn cbc_bad_padding_is_malformed() {
        let mut enc = SessionCipher::new(key16(), suite(CipherMode::Cbc)).unwrap();
        let dec = SessionCipher::new(key16(), suite(CipherMode::Cbc)).unwrap();
        let mut ct = enc.encipher(b"hello").unwrap();
        ct.ct[0] ^= 0xff;
        // corrupting the single block scrambles the padding byte
        assert_eq!(dec.decipher(&ct).unwrap_err(), CipherError::Malformed);
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        let sek = SecretBytes::from_slice(&[0u8; 16]);
        let s = CipherSuite::new(CipherAlgorithm::Aes256, CipherMode::Ctr, MacKind::HmacSha256);
        assert_eq!(SessionCipher::new(sek, s).unwrap_err(), CipherError::BadKey);
    }

    #[test]
    fn cipher_text_codec_round_trip() {
        let ct = CipherText { iv: vec![1; 16], ct: vec![2; 32] };
        let mut out = String::new();
        ct.encode(&mut out).unwrap();
        let mut r = Reader::new(&out);
        assert_eq!(CipherText::decode(&mut r).unwrap(), ct);
    }

    #[test]
    fn suite_name_round_trip() {
        let s = CipherSuite::new(CipherAlgorithm::Aes256, CipherMode::Cbc, MacKind::HmacSha384);
        let mut out = String::new();
        s.encode(&mut out);
        assert_eq!(out, "\"AES256/CBC/HMAC-SHA384\"");
        let mut r = Reader::new(&out);
        assert_eq!(CipherSuite::decode(&mut r).unwrap(), s);
    }
}
