//! Public-key wire model and signature primitives.
//!
//! On the wire a public key is `[type,encoding,body]` where the body
//! depends on the encoding: null, X.509 SubjectPublicKeyInfo DER, an RSA
//! modulus/exponent pair, or an opaque group-signature key blob. A
//! `SignatureBlock` carries a verbatim signed body together with the
//! signer key and signature; the body text is signed exactly as
//! transmitted, so it is never re-serialized after decoding.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha384};

use crate::codec::{self, CodecError, Reader};

/// Public key type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    None,
    /// RSA 2048 with exponent 65537; the restricted form legacy devices
    /// require of every key in the voucher.
    Rsa2048Restr,
    /// RSA, unrestricted length and exponent.
    RsaUr,
    EcdsaP256,
    EcdsaP384,
    /// Legacy group-signature key, verified by an external service.
    Epid20,
}

impl KeyKind {
    pub fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Rsa2048Restr => 1,
            Self::RsaUr => 4,
            Self::EcdsaP256 => 13,
            Self::EcdsaP384 => 14,
            Self::Epid20 => 92,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::None,
            1 => Self::Rsa2048Restr,
            4 => Self::RsaUr,
            13 => Self::EcdsaP256,
            14 => Self::EcdsaP384,
            92 => Self::Epid20,
            _ => return None,
        })
    }
}

/// Public key encoding codes (the `pe` fields).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    None,
    X509,
    RsaModExp,
    Epid,
}

impl KeyEncoding {
    pub fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::X509 => 1,
            Self::RsaModExp => 2,
            Self::Epid => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::None,
            1 => Self::X509,
            2 => Self::RsaModExp,
            3 => Self::Epid,
            _ => return None,
        })
    }

    pub fn encode(self, out: &mut String) {
        let _ = codec::write_uint(out, self.code() as u64, 8);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let at = r.position();
        Self::from_code(r.uint8()?).ok_or(CodecError::Unexpected(at))
    }
}

/// An error from key handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    /// Key bytes could not be parsed or re-encoded.
    Encoding,
    /// The operation is not defined for this key form.
    Unsupported,
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encoding => write!(f, "key encoding failure"),
            Self::Unsupported => write!(f, "operation unsupported for key type"),
        }
    }
}

impl std::error::Error for KeyError {}

/// A decoded protocol public key.
#[derive(Debug, Clone)]
pub enum PublicKey {
    /// The absent key (`pk` of a signature block whose signer is implied).
    None,
    EcP256(p256::ecdsa::VerifyingKey),
    EcP384(p384::ecdsa::VerifyingKey),
    Rsa(RsaPublicKey),
    /// Opaque group-signature key blob; only an external verifier can use it.
    Epid(Vec<u8>),
}

impl PublicKey {
    pub fn kind(&self) -> KeyKind {
        match self {
            Self::None => KeyKind::None,
            Self::EcP256(_) => KeyKind::EcdsaP256,
            Self::EcP384(_) => KeyKind::EcdsaP384,
            Self::Rsa(k) => rsa_kind(k),
            Self::Epid(_) => KeyKind::Epid20,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn is_epid(&self) -> bool {
        matches!(self, Self::Epid(_))
    }

    /// X.509 SubjectPublicKeyInfo DER bytes of this key.
    pub fn spki_der(&self) -> Result<Vec<u8>, KeyError> {
        match self {
            Self::EcP256(k) => Ok(k.to_public_key_der().map_err(|_| KeyError::Encoding)?.into_vec()),
            Self::EcP384(k) => Ok(k.to_public_key_der().map_err(|_| KeyError::Encoding)?.into_vec()),
            Self::Rsa(k) => Ok(k.to_public_key_der().map_err(|_| KeyError::Encoding)?.into_vec()),
            Self::None | Self::Epid(_) => Err(KeyError::Unsupported),
        }
    }

    /// Parse an X.509 SubjectPublicKeyInfo of unknown algorithm.
    pub fn from_spki_der(der: &[u8]) -> Result<Self, KeyError> {
        if let Ok(k) = p256::ecdsa::VerifyingKey::from_public_key_der(der) {
            return Ok(Self::EcP256(k));
        }
        if let Ok(k) = p384::ecdsa::VerifyingKey::from_public_key_der(der) {
            return Ok(Self::EcP384(k));
        }
        if let Ok(k) = RsaPublicKey::from_public_key_der(der) {
            return Ok(Self::Rsa(k));
        }
        Err(KeyError::Encoding)
    }

    /// Verify `sg` over the verbatim `body` text.
    ///
    /// The digest follows the key: SHA-256 for P-256 and restricted RSA,
    /// SHA-384 for P-384 and unrestricted RSA. EPID and absent keys
    /// cannot verify anything here.
    pub fn verify(&self, body: &str, sg: &[u8]) -> bool {
        match self {
            Self::EcP256(k) => p256::ecdsa::Signature::from_der(sg)
                .map(|sig| k.verify(body.as_bytes(), &sig).is_ok())
                .unwrap_or(false),
            Self::EcP384(k) => p384::ecdsa::Signature::from_der(sg)
                .map(|sig| k.verify(body.as_bytes(), &sig).is_ok())
                .unwrap_or(false),
            Self::Rsa(k) => match rsa_kind(k) {
                KeyKind::Rsa2048Restr => k
                    .verify(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(body.as_bytes()), sg)
                    .is_ok(),
                _ => k
                    .verify(Pkcs1v15Sign::new::<Sha384>(), &Sha384::digest(body.as_bytes()), sg)
                    .is_ok(),
            },
            Self::None | Self::Epid(_) => false,
        }
    }

    /// Wire form `[type,encoding,body]`.
    ///
    /// A `None` key is always written as the null encoding, whatever the
    /// requested `pe` is.
    pub fn encode(&self, out: &mut String, pe: KeyEncoding) -> Result<(), KeyError> {
        let pe = if self.is_none() { KeyEncoding::None } else { pe };
        out.push(codec::BEGIN_ARRAY);
        let _ = codec::write_uint(out, self.kind().code() as u64, 8);
        out.push(codec::COMMA);
        pe.encode(out);
        out.push(codec::COMMA);
        match pe {
            KeyEncoding::None => {
                out.push(codec::BEGIN_ARRAY);
                let _ = codec::write_uint(out, 0, 8);
                out.push(codec::END_ARRAY);
            }
            KeyEncoding::X509 => {
                let der = self.spki_der()?;
                out.push(codec::BEGIN_ARRAY);
                codec::write_uint(out, der.len() as u64, 32).map_err(|_| KeyError::Encoding)?;
                out.push(codec::COMMA);
                codec::write_bytes(out, &der);
                out.push(codec::END_ARRAY);
            }
            KeyEncoding::RsaModExp => {
                let Self::Rsa(k) = self else { return Err(KeyError::Unsupported) };
                let n = k.n().to_bytes_be();
                let e = k.e().to_bytes_be();
                out.push(codec::BEGIN_ARRAY);
                codec::write_uint(out, n.len() as u64, 32).map_err(|_| KeyError::Encoding)?;
                out.push(codec::COMMA);
                codec::write_bytes(out, &n);
                out.push(codec::COMMA);
                codec::write_uint(out, e.len() as u64, 32).map_err(|_| KeyError::Encoding)?;
                out.push(codec::COMMA);
                codec::write_bytes(out, &e);
                out.push(codec::END_ARRAY);
            }
            KeyEncoding::Epid => {
                let Self::Epid(blob) = self else { return Err(KeyError::Unsupported) };
                out.push(codec::BEGIN_ARRAY);
                codec::write_uint(out, blob.len() as u64, 32).map_err(|_| KeyError::Encoding)?;
                out.push(codec::COMMA);
                codec::write_bytes(out, blob);
                out.push(codec::END_ARRAY);
            }
        }
        out.push(codec::END_ARRAY);
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        r.expect(codec::BEGIN_ARRAY)?;
        let at = r.position();
        let kind = KeyKind::from_code(r.uint8()?).ok_or(CodecError::Unexpected(at))?;
        r.expect(codec::COMMA)?;
        let pe = KeyEncoding::decode(r)?;
        r.expect(codec::COMMA)?;
        let key = match pe {
            KeyEncoding::None => {
                r.expect(codec::BEGIN_ARRAY)?;
                let zero = r.uint8()?;
                r.expect(codec::END_ARRAY)?;
                if zero != 0 {
                    return Err(CodecError::Unexpected(at));
                }
                Self::None
            }
            KeyEncoding::X509 => {
                r.expect(codec::BEGIN_ARRAY)?;
                let len = r.uint32()? as usize;
                r.expect(codec::COMMA)?;
                let der = r.bytes()?;
                r.expect(codec::END_ARRAY)?;
                if der.len() != len {
                    return Err(CodecError::LengthMismatch);
                }
                Self::from_spki_der(&der).map_err(|_| CodecError::Unexpected(at))?
            }
            KeyEncoding::RsaModExp => {
                r.expect(codec::BEGIN_ARRAY)?;
                let nlen = r.uint32()? as usize;
                r.expect(codec::COMMA)?;
                let n = r.bytes()?;
                r.expect(codec::COMMA)?;
                let elen = r.uint32()? as usize;
                r.expect(codec::COMMA)?;
                let e = r.bytes()?;
                r.expect(codec::END_ARRAY)?;
                if n.len() != nlen || e.len() != elen {
                    return Err(CodecError::LengthMismatch);
                }
                let key = RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
                    .map_err(|_| CodecError::Unexpected(at))?;
                Self::Rsa(key)
            }
            KeyEncoding::Epid => {
                r.expect(codec::BEGIN_ARRAY)?;
                let len = r.uint32()? as usize;
                r.expect(codec::COMMA)?;
                let blob = r.bytes()?;
                r.expect(codec::END_ARRAY)?;
                if blob.len() != len {
                    return Err(CodecError::LengthMismatch);
                }
                Self::Epid(blob)
            }
        };
        r.expect(codec::END_ARRAY)?;
        // the declared type must agree with what the body decoded to
        if !key.is_none() && key.kind() != kind {
            return Err(CodecError::Unexpected(at));
        }
        Ok(key)
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::EcP256(a), Self::EcP256(b)) => a == b,
            (Self::EcP384(a), Self::EcP384(b)) => a == b,
            (Self::Rsa(a), Self::Rsa(b)) => a == b,
            (Self::Epid(a), Self::Epid(b)) => a == b,
            _ => false,
        }
    }
}
impl Eq for PublicKey {}

fn rsa_kind(k: &RsaPublicKey) -> KeyKind {
    if k.e() == &BigUint::from(65537u32) && k.n().bits() <= 2048 {
        KeyKind::Rsa2048Restr
    } else {
        KeyKind::RsaUr
    }
}

/// A signing key pair held by a device or owner.
#[derive(Clone)]
pub enum KeyPair {
    EcP256(p256::ecdsa::SigningKey),
    EcP384(p384::ecdsa::SigningKey),
    Rsa(RsaPrivateKey),
}

impl KeyPair {
    pub fn generate_p256() -> Self {
        Self::EcP256(p256::ecdsa::SigningKey::random(&mut OsRng))
    }

    pub fn generate_p384() -> Self {
        Self::EcP384(p384::ecdsa::SigningKey::random(&mut OsRng))
    }

    pub fn kind(&self) -> KeyKind {
        match self {
            Self::EcP256(_) => KeyKind::EcdsaP256,
            Self::EcP384(_) => KeyKind::EcdsaP384,
            Self::Rsa(k) => rsa_kind(&k.to_public_key()),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            Self::EcP256(k) => PublicKey::EcP256(*k.verifying_key()),
            Self::EcP384(k) => PublicKey::EcP384(*k.verifying_key()),
            Self::Rsa(k) => PublicKey::Rsa(k.to_public_key()),
        }
    }

    /// Sign the verbatim `body` text. ECDSA signatures are ASN.1 DER,
    /// RSA signatures PKCS#1 v1.5; digests match `PublicKey::verify`.
    pub fn sign(&self, body: &str) -> Result<Vec<u8>, KeyError> {
        match self {
            Self::EcP256(k) => {
                let sig: p256::ecdsa::Signature = k.sign(body.as_bytes());
                Ok(sig.to_der().as_bytes().to_vec())
            }
            Self::EcP384(k) => {
                let sig: p384::ecdsa::Signature = k.sign(body.as_bytes());
                Ok(sig.to_der().as_bytes().to_vec())
            }
            Self::Rsa(k) => {
                let sig = match rsa_kind(&k.to_public_key()) {
                    KeyKind::Rsa2048Restr => {
                        k.sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(body.as_bytes()))
                    }
                    _ => k.sign(Pkcs1v15Sign::new::<Sha384>(), &Sha384::digest(body.as_bytes())),
                };
                sig.map_err(|_| KeyError::Encoding)
            }
        }
    }
}

/// Signature algorithm advertisement (`eA`/`eB`); `[type,len,"base64"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigInfo {
    pub sg_type: KeyKind,
    pub info: Vec<u8>,
}

impl SigInfo {
    /// The advertisement for a plain (non-group-signature) key: the key
    /// type with no extra material.
    pub fn for_key(kind: KeyKind) -> Self {
        Self { sg_type: kind, info: Vec::new() }
    }

    pub fn encode(&self, out: &mut String) {
        out.push(codec::BEGIN_ARRAY);
        let _ = codec::write_uint(out, self.sg_type.code() as u64, 8);
        out.push(codec::COMMA);
        let _ = codec::write_uint(out, self.info.len() as u64, 16);
        out.push(codec::COMMA);
        codec::write_bytes(out, &self.info);
        out.push(codec::END_ARRAY);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        r.expect(codec::BEGIN_ARRAY)?;
        let at = r.position();
        let sg_type = KeyKind::from_code(r.uint8()?).ok_or(CodecError::Unexpected(at))?;
        r.expect(codec::COMMA)?;
        let len = r.uint16()? as usize;
        r.expect(codec::COMMA)?;
        let info = r.bytes()?;
        r.expect(codec::END_ARRAY)?;
        if info.len() != len {
            return Err(CodecError::LengthMismatch);
        }
        Ok(Self { sg_type, info })
    }
}

/// A signed body: `{"bo":…,"pk":…,"sg":[len,"b64"]}`.
///
/// `bo` is the exact transmitted text of the signed object; hashing or
/// verifying always uses this span, never a re-serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBlock {
    pub bo: String,
    pub pk: PublicKey,
    pub sg: Vec<u8>,
}

/// A decoded signature block plus the verbatim text of its `pk` field,
/// which the device hashes for its new owner-key digest.
#[derive(Debug, Clone)]
pub struct DecodedSignatureBlock {
    pub block: SignatureBlock,
    pub pk_text: String,
}

impl SignatureBlock {
    /// Sign `bo` with `keys`, advertising `pk` as the signer.
    pub fn sign(bo: String, pk: PublicKey, keys: &KeyPair) -> Result<Self, KeyError> {
        let sg = keys.sign(&bo)?;
        Ok(Self { bo, pk, sg })
    }

    /// Verify the signature with the embedded key.
    pub fn verify(&self) -> bool {
        self.pk.verify(&self.bo, &self.sg)
    }

    pub fn encode(&self, out: &mut String, pe: KeyEncoding) -> Result<(), KeyError> {
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(out, "bo");
        out.push_str(&self.bo);
        out.push(codec::COMMA);
        codec::write_key(out, "pk");
        self.pk.encode(out, pe)?;
        out.push(codec::COMMA);
        codec::write_key(out, "sg");
        out.push(codec::BEGIN_ARRAY);
        codec::write_uint(out, self.sg.len() as u64, 16).map_err(|_| KeyError::Encoding)?;
        out.push(codec::COMMA);
        codec::write_bytes(out, &self.sg);
        out.push(codec::END_ARRAY);
        out.push(codec::END_OBJECT);
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<DecodedSignatureBlock, CodecError> {
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("bo")?;
        let bo = r.object_span()?.to_string();
        r.expect(codec::COMMA)?;
        r.expect_key("pk")?;
        let pk_start = r.position();
        let pk = PublicKey::decode(r)?;
        let pk_text = r.span(pk_start, r.position()).to_string();
        r.expect(codec::COMMA)?;
        r.expect_key("sg")?;
        r.expect(codec::BEGIN_ARRAY)?;
        let len = r.uint16()? as usize;
        r.expect(codec::COMMA)?;
        let sg = r.bytes()?;
        r.expect(codec::END_ARRAY)?;
        r.expect(codec::END_OBJECT)?;
        if sg.len() != len {
            return Err(CodecError::LengthMismatch);
        }
        Ok(DecodedSignatureBlock { block: SignatureBlock { bo, pk, sg }, pk_text })
    }

    /// Decode from a full message body string.
    pub fn decode_str(text: &str) -> Result<DecodedSignatureBlock, CodecError> {
        SignatureBlock::decode(&mut Reader::new(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p256_sign_verify_round_trip() {
        let keys = KeyPair::generate_p256();
        let pk = keys.public_key();
        let sg = keys.sign("{\"x\":1}").unwrap();
        assert!(pk.verify("{\"x\":1}", &sg));
        assert!(!pk.verify("{\"x\":2}", &sg));
    }

    #[test]
    fn p384_sign_verify_round_trip() {
        let keys = KeyPair::generate_p384();
        let pk = keys.public_key();
        let sg = keys.sign("body").unwrap();
        assert!(pk.verify("body", &sg));
    }

    #[test]
    fn x509_key_round_trip() {
        let keys = KeyPair::generate_p256();
        let pk = keys.public_key();
        let mut out = String::new();
        pk.encode(&mut out, KeyEncoding::X509).unwrap();
        let mut r = Reader::new(&out);
        let decoded = PublicKey::decode(&mut r).unwrap();
        assert_eq!(decoded, pk);
        assert_eq!(decoded.kind(), KeyKind::EcdsaP256);
    }

    #[test]
    fn null_key_round_trip() {
        let mut out = String::new();
        PublicKey::None.encode(&mut out, KeyEncoding::X509).unwrap();
        assert_eq!(out, "[0,0,[0]]");
        let mut r = Reader::new(&out);
        assert!(PublicKey::decode(&mut r).unwrap().is_none());
    }

    #[test]
    fn signature_block_round_trip() {
        let keys = KeyPair::generate_p256();
        let sb =
            SignatureBlock::sign("{\"n\":1}".to_string(), keys.public_key(), &keys).unwrap();
        let mut out = String::new();
        sb.encode(&mut out, KeyEncoding::X509).unwrap();
        let decoded = SignatureBlock::decode_str(&out).unwrap();
        assert_eq!(decoded.block, sb);
        assert!(decoded.block.verify());
        assert!(decoded.pk_text.starts_with('['));
    }

    #[test]
    fn sig_info_round_trip() {
        let si = SigInfo::for_key(KeyKind::EcdsaP384);
        let mut out = String::new();
        si.encode(&mut out);
        let mut r = Reader::new(&out);
        assert_eq!(SigInfo::decode(&mut r).unwrap(), si);
    }
}
