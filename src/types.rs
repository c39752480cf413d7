//! Small wire value types: nonces, GUIDs, digests and MACs.

use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256, Sha384};
use uuid::Uuid;

use crate::codec::{self, CodecError, Reader};
use crate::proto::{GUID_SIZE, NONCE_SIZE};
use crate::secret::secure_eq;

/// A 16-byte random protocol nonce.
///
/// Nonces are compared by value and each protocol slot (n3…n7) admits a
/// given value exactly once.
#[derive(Clone, Copy, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Wire form: the 16 raw bytes, base64, quoted, no length prefix.
    pub fn encode(&self, out: &mut String) {
        codec::write_bytes(out, &self.0);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let bytes = r.bytes()?;
        let bytes: [u8; NONCE_SIZE] = bytes.try_into().map_err(|_| CodecError::LengthMismatch)?;
        Ok(Self(bytes))
    }
}

impl PartialEq for Nonce {
    fn eq(&self, other: &Self) -> bool {
        secure_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Nonce(")?;
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// A device protocol identifier; 16 bytes on the wire, hi-then-lo 64-bit
/// words, big-endian. Rotated at the end of each successful transfer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(Uuid);

impl Guid {
    pub fn generate() -> Self {
        let mut bytes = [0u8; GUID_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(Uuid::from_bytes(bytes))
    }

    pub fn from_bytes(bytes: [u8; GUID_SIZE]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; GUID_SIZE] {
        self.0.as_bytes()
    }

    pub fn encode(&self, out: &mut String) {
        codec::write_bytes(out, self.as_bytes());
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let bytes = r.bytes()?;
        let bytes: [u8; GUID_SIZE] = bytes.try_into().map_err(|_| CodecError::LengthMismatch)?;
        Ok(Self::from_bytes(bytes))
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Guid({})", self.0)
    }
}

/// Digest hash types and their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestKind {
    None,
    Sha256,
    Sha384,
}

impl DigestKind {
    pub fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Sha256 => 8,
            Self::Sha384 => 14,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::None,
            8 => Self::Sha256,
            14 => Self::Sha384,
            _ => return None,
        })
    }

    pub fn output_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
        }
    }

    /// Digest the concatenation of `parts`.
    pub fn digest_of(self, parts: &[&[u8]]) -> HashDigest {
        let bytes = match self {
            Self::None => Vec::new(),
            Self::Sha256 => {
                let mut h = Sha256::new();
                for p in parts {
                    h.update(p);
                }
                h.finalize().to_vec()
            }
            Self::Sha384 => {
                let mut h = Sha384::new();
                for p in parts {
                    h.update(p);
                }
                h.finalize().to_vec()
            }
        };
        HashDigest { kind: self, bytes }
    }
}

/// MAC hash types and their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacKind {
    None,
    HmacSha256,
    HmacSha384,
}

impl MacKind {
    pub fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::HmacSha256 => 108,
            Self::HmacSha384 => 114,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::None,
            108 => Self::HmacSha256,
            114 => Self::HmacSha384,
            _ => return None,
        })
    }

    /// MAC the concatenation of `parts` under `key`.
    ///
    /// An HMAC key of any length is legal, so construction cannot fail;
    /// `MacKind::None` produces an empty MAC.
    pub fn mac_of(self, key: &[u8], parts: &[&[u8]]) -> HashMac {
        let bytes = match self {
            Self::None => Vec::new(),
            Self::HmacSha256 => {
                let mut m =
                    Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
                for p in parts {
                    m.update(p);
                }
                m.finalize().into_bytes().to_vec()
            }
            Self::HmacSha384 => {
                let mut m =
                    Hmac::<Sha384>::new_from_slice(key).expect("hmac accepts any key length");
                for p in parts {
                    m.update(p);
                }
                m.finalize().into_bytes().to_vec()
            }
        };
        HashMac { kind: self, bytes }
    }
}

/// A typed digest value; wire form `[len,type,"base64"]`.
#[derive(Debug, Clone, Eq)]
pub struct HashDigest {
    pub kind: DigestKind,
    pub bytes: Vec<u8>,
}

impl HashDigest {
    pub fn none() -> Self {
        Self { kind: DigestKind::None, bytes: Vec::new() }
    }

    pub fn encode(&self, out: &mut String) {
        encode_hash(out, self.kind.code(), &self.bytes);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let (code, bytes) = decode_hash(r)?;
        let kind = DigestKind::from_code(code).ok_or(CodecError::OutOfRange)?;
        Ok(Self { kind, bytes })
    }
}

impl PartialEq for HashDigest {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && secure_eq(&self.bytes, &other.bytes)
    }
}

/// A typed MAC value; wire form `[len,type,"base64"]`.
#[derive(Debug, Clone, Eq)]
pub struct HashMac {
    pub kind: MacKind,
    pub bytes: Vec<u8>,
}

impl HashMac {
    pub fn new(kind: MacKind, bytes: Vec<u8>) -> Self {
        Self { kind, bytes }
    }

    /// The credential-reuse placeholder: mac type none, single `=` byte.
    pub fn reuse_placeholder() -> Self {
        Self { kind: MacKind::None, bytes: vec![crate::proto::REUSE_MAC_BYTE] }
    }

    pub fn is_reuse_placeholder(&self) -> bool {
        self.kind == MacKind::None && self.bytes == [crate::proto::REUSE_MAC_BYTE]
    }

    pub fn encode(&self, out: &mut String) {
        encode_hash(out, self.kind.code(), &self.bytes);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let (code, bytes) = decode_hash(r)?;
        let kind = MacKind::from_code(code).ok_or(CodecError::OutOfRange)?;
        Ok(Self { kind, bytes })
    }
}

impl PartialEq for HashMac {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && secure_eq(&self.bytes, &other.bytes)
    }
}

fn encode_hash(out: &mut String, code: u8, bytes: &[u8]) {
    out.push(codec::BEGIN_ARRAY);
    // hash lengths are bounded well below u8::MAX
    let _ = codec::write_uint(out, bytes.len() as u64, 8);
    out.push(codec::COMMA);
    let _ = codec::write_uint(out, code as u64, 8);
    out.push(codec::COMMA);
    codec::write_bytes(out, bytes);
    out.push(codec::END_ARRAY);
}

fn decode_hash(r: &mut Reader<'_>) -> Result<(u8, Vec<u8>), CodecError> {
    r.expect(codec::BEGIN_ARRAY)?;
    let len = r.uint8()? as usize;
    r.expect(codec::COMMA)?;
    let code = r.uint8()?;
    r.expect(codec::COMMA)?;
    let bytes = r.bytes()?;
    r.expect(codec::END_ARRAY)?;
    if bytes.len() != len {
        return Err(CodecError::LengthMismatch);
    }
    Ok((code, bytes))
}
