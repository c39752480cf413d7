//! Ownership vouchers and their chain of trust.
//!
//! A voucher is a header (owner key, rendezvous info, device GUID and
//! info string), an HMAC binding the header to a device-held secret, an
//! ordered list of signed entries recording successive ownership
//! transfers, and an optional device certificate chain. Entry *i* is
//! signed by the key embedded in entry *i-1* (the header key for entry
//! 0); each entry carries the running hash of its predecessor and the
//! constant hash of the device identity. The verifier walks the chain
//! one entry at a time, which is how the device consumes it over the
//! wire without ever materializing the whole list.

use crate::codec::{self, CodecError, Reader};
use crate::kdf::CryptoLevel;
use crate::keys::{KeyEncoding, KeyError, KeyPair, PublicKey, SignatureBlock};
use crate::rendezvous::RendezvousInfo;
use crate::types::{DigestKind, Guid, HashDigest, HashMac};

/// The voucher header (`oh`); wire order `pv,pe,r,g,d,pk[,hdc]`.
#[derive(Debug, Clone, PartialEq)]
pub struct VoucherHeader {
    pub pe: KeyEncoding,
    pub r: RendezvousInfo,
    pub g: Guid,
    /// Manufacturer's device-info string.
    pub d: String,
    pub pk: PublicKey,
    /// Digest of the device certificate chain, when one exists.
    pub hdc: Option<HashDigest>,
}

/// Verbatim spans captured while decoding a header. The HMAC and the
/// chain hashes cover these exact texts.
#[derive(Debug, Clone)]
pub struct HeaderText {
    pub oh: String,
    pub g: String,
    pub d: String,
}

impl VoucherHeader {
    pub fn encode(&self, out: &mut String) -> Result<(), VoucherError> {
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(out, "pv");
        codec::write_uint(out, crate::proto::PROTOCOL_VERSION as u64, 32)?;
        out.push(codec::COMMA);
        codec::write_key(out, "pe");
        self.pe.encode(out);
        out.push(codec::COMMA);
        codec::write_key(out, "r");
        self.r.encode(out)?;
        out.push(codec::COMMA);
        codec::write_key(out, "g");
        self.g.encode(out);
        out.push(codec::COMMA);
        codec::write_key(out, "d");
        codec::write_string(out, &self.d);
        out.push(codec::COMMA);
        codec::write_key(out, "pk");
        self.pk.encode(out, self.pe)?;
        if let Some(hdc) = &self.hdc {
            out.push(codec::COMMA);
            codec::write_key(out, "hdc");
            hdc.encode(out);
        }
        out.push(codec::END_OBJECT);
        Ok(())
    }

    /// Decode a header, capturing the spans the chain hashes over.
    pub fn decode(r: &mut Reader<'_>) -> Result<(Self, HeaderText), CodecError> {
        let oh_start = r.position();
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("pv")?;
        let at = r.position();
        let pv = r.uint32()?;
        if pv != crate::proto::PROTOCOL_VERSION {
            return Err(CodecError::Unexpected(at));
        }
        r.expect(codec::COMMA)?;
        r.expect_key("pe")?;
        let pe = KeyEncoding::decode(r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("r")?;
        let rv = RendezvousInfo::decode(r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("g")?;
        let g_start = r.position();
        let g = Guid::decode(r)?;
        let g_text = r.span(g_start, r.position()).to_string();
        r.expect(codec::COMMA)?;
        r.expect_key("d")?;
        let d_start = r.position();
        let d = r.string()?;
        let d_text = r.span(d_start, r.position()).to_string();
        r.expect(codec::COMMA)?;
        r.expect_key("pk")?;
        let pk = PublicKey::decode(r)?;
        // hdc is optional; a comma after pk means it is present
        let hdc = if r.consume_matching(",\"hdc\":") {
            Some(HashDigest::decode(r)?)
        } else {
            None
        };
        r.expect(codec::END_OBJECT)?;
        let oh_text = r.span(oh_start, r.position()).to_string();
        Ok((
            Self { pe, r: rv, g, d, pk, hdc },
            HeaderText { oh: oh_text, g: g_text, d: d_text },
        ))
    }

    /// Canonical texts of this header, as `decode` would capture them.
    /// The encoder is deterministic, so hashing these is equivalent to
    /// hashing received spans.
    pub fn texts(&self) -> Result<HeaderText, VoucherError> {
        let mut oh = String::new();
        self.encode(&mut oh)?;
        let mut g = String::new();
        self.g.encode(&mut g);
        let mut d = String::new();
        codec::write_string(&mut d, &self.d);
        Ok(HeaderText { oh, g, d })
    }
}

/// One ownership-transfer entry body: the running chain hash, the
/// constant device-identity hash, and the next owner's key.
#[derive(Debug, Clone, PartialEq)]
pub struct VoucherEntry {
    pub hp: HashDigest,
    pub hc: HashDigest,
    pub pk: PublicKey,
}

impl VoucherEntry {
    pub fn encode(&self, out: &mut String, pe: KeyEncoding) -> Result<(), VoucherError> {
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(out, "hp");
        self.hp.encode(out);
        out.push(codec::COMMA);
        codec::write_key(out, "hc");
        self.hc.encode(out);
        out.push(codec::COMMA);
        codec::write_key(out, "pk");
        self.pk.encode(out, pe)?;
        out.push(codec::END_OBJECT);
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("hp")?;
        let hp = HashDigest::decode(r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("hc")?;
        let hc = HashDigest::decode(r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("pk")?;
        let pk = PublicKey::decode(r)?;
        r.expect(codec::END_OBJECT)?;
        Ok(Self { hp, hc, pk })
    }

    pub fn decode_str(text: &str) -> Result<Self, CodecError> {
        Self::decode(&mut Reader::new(text))
    }
}

/// A voucher-handling failure outside the chain walk itself.
#[derive(Debug)]
pub enum VoucherError {
    Codec(CodecError),
    Key(KeyError),
    /// The signing key offered for an extension is not the voucher's
    /// current owner key.
    WrongSigner,
    /// The header key type does not map to a crypto level.
    UnsupportedKey,
}

impl std::fmt::Display for VoucherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Codec(e) => write!(f, "voucher encoding: {}", e),
            Self::Key(e) => write!(f, "voucher key: {}", e),
            Self::WrongSigner => write!(f, "extension signer is not the current owner"),
            Self::UnsupportedKey => write!(f, "unsupported voucher owner key type"),
        }
    }
}

impl std::error::Error for VoucherError {}

impl From<CodecError> for VoucherError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<KeyError> for VoucherError {
    fn from(e: KeyError) -> Self {
        Self::Key(e)
    }
}

/// A chain-walk failure. Each check has its own kind so a failure names
/// exactly what broke.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainError {
    /// Entry `index`'s signature did not verify under the running key.
    EntrySignature { index: usize },
    /// Entry `index`'s device-identity hash (`hc`) is wrong.
    EntryDigest { index: usize },
    /// Entry `index`'s predecessor hash (`hp`) is wrong.
    ChainDigest { index: usize },
    /// The last entry's key does not match the live owner's signing key.
    OwnerKeyMismatch,
    /// An entry body was unparsable.
    Malformed(CodecError),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EntrySignature { index } => write!(f, "entry {} signature invalid", index),
            Self::EntryDigest { index } => write!(f, "entry {} hc invalid", index),
            Self::ChainDigest { index } => write!(f, "entry {} hp invalid", index),
            Self::OwnerKeyMismatch => write!(f, "final entry key does not match prover key"),
            Self::Malformed(e) => write!(f, "entry unparsable: {}", e),
        }
    }
}

impl std::error::Error for ChainError {}

/// Incremental voucher-chain verifier.
///
/// Seeded from the header and HMAC texts, then fed signed entries in
/// order as they arrive; `finish` pins the surviving key to the live
/// prover's key.
pub struct ChainVerifier {
    digest: DigestKind,
    hc: HashDigest,
    hp: HashDigest,
    pk: PublicKey,
    index: usize,
}

impl ChainVerifier {
    pub fn new(digest: DigestKind, texts: &HeaderText, hmac_text: &str, pk: PublicKey) -> Self {
        let hc = digest.digest_of(&[texts.g.as_bytes(), texts.d.as_bytes()]);
        let hp = digest.digest_of(&[texts.oh.as_bytes(), hmac_text.as_bytes()]);
        Self { digest, hc, hp, pk, index: 0 }
    }

    /// The key expected to have signed the next entry.
    pub fn current_key(&self) -> &PublicKey {
        &self.pk
    }

    /// Verify one entry and advance the running state.
    pub fn feed(&mut self, signed: &SignatureBlock) -> Result<(), ChainError> {
        let index = self.index;
        if !self.pk.verify(&signed.bo, &signed.sg) {
            return Err(ChainError::EntrySignature { index });
        }
        let entry = VoucherEntry::decode_str(&signed.bo).map_err(ChainError::Malformed)?;
        if entry.hc != self.hc {
            return Err(ChainError::EntryDigest { index });
        }
        if entry.hp != self.hp {
            return Err(ChainError::ChainDigest { index });
        }
        self.pk = entry.pk;
        self.hp = self.digest.digest_of(&[signed.bo.as_bytes()]);
        self.index += 1;
        Ok(())
    }

    /// After the last entry, the surviving key must be the live owner's.
    pub fn finish(self, prover_key: &PublicKey) -> Result<PublicKey, ChainError> {
        if &self.pk != prover_key {
            return Err(ChainError::OwnerKeyMismatch);
        }
        Ok(self.pk)
    }
}

/// A complete ownership voucher.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnershipVoucher {
    pub oh: VoucherHeader,
    pub hmac: HashMac,
    /// Device certificate chain, leaf first, as X.509 DER.
    pub dc: Option<Vec<Vec<u8>>>,
    /// Signed ownership-transfer entries.
    pub en: Vec<SignatureBlock>,
}

impl OwnershipVoucher {
    pub fn new(oh: VoucherHeader, hmac: HashMac) -> Self {
        Self { oh, hmac, dc: None, en: Vec::new() }
    }

    pub fn uuid(&self) -> Guid {
        self.oh.g
    }

    /// The digest the chain hashes use, bound to the header key type.
    pub fn digest_kind(&self) -> Result<DigestKind, VoucherError> {
        CryptoLevel::from_key_kind(self.oh.pk.kind())
            .map(CryptoLevel::digest_kind)
            .ok_or(VoucherError::UnsupportedKey)
    }

    /// The public key of the voucher's current owner: the last entry's
    /// embedded key, or the header key for an unextended voucher.
    pub fn current_owner_key(&self) -> Result<PublicKey, VoucherError> {
        match self.en.last() {
            None => Ok(self.oh.pk.clone()),
            Some(signed) => Ok(VoucherEntry::decode_str(&signed.bo)
                .map_err(VoucherError::Codec)?
                .pk),
        }
    }

    /// The leaf public key of the device certificate chain, if present.
    pub fn device_cert_key(&self) -> Option<PublicKey> {
        let chain = self.dc.as_ref()?;
        let leaf = chain.first()?;
        leaf_public_key(leaf)
    }

    /// Append a transfer entry handing the voucher to `next_owner`.
    ///
    /// `owner_keys` must be the current owner's keypair; it signs the
    /// new entry.
    pub fn extend(&mut self, owner_keys: &KeyPair, next_owner: &PublicKey) -> Result<(), VoucherError> {
        if self.current_owner_key()? != owner_keys.public_key() {
            return Err(VoucherError::WrongSigner);
        }
        let digest = self.digest_kind()?;
        let texts = self.oh.texts()?;
        let mut hmac_text = String::new();
        self.hmac.encode(&mut hmac_text);

        let hc = digest.digest_of(&[texts.g.as_bytes(), texts.d.as_bytes()]);
        let hp = match self.en.last() {
            None => digest.digest_of(&[texts.oh.as_bytes(), hmac_text.as_bytes()]),
            Some(prev) => digest.digest_of(&[prev.bo.as_bytes()]),
        };

        let entry = VoucherEntry { hp, hc, pk: next_owner.clone() };
        let mut bo = String::new();
        entry.encode(&mut bo, self.oh.pe)?;
        let signed = SignatureBlock::sign(bo, owner_keys.public_key(), owner_keys)?;
        self.en.push(signed);
        Ok(())
    }

    /// Verify the whole chain against the stored entries, returning the
    /// current owner key. Equivalent to the device's incremental walk
    /// with canonical header texts.
    pub fn verify_chain(&self) -> Result<PublicKey, ChainError> {
        let digest = self
            .digest_kind()
            .map_err(|_| ChainError::Malformed(CodecError::OutOfRange))?;
        let texts = self
            .oh
            .texts()
            .map_err(|_| ChainError::Malformed(CodecError::OutOfRange))?;
        let mut hmac_text = String::new();
        self.hmac.encode(&mut hmac_text);
        let mut verifier = ChainVerifier::new(digest, &texts, &hmac_text, self.oh.pk.clone());
        for signed in &self.en {
            verifier.feed(signed)?;
        }
        let expected = self
            .current_owner_key()
            .map_err(|_| ChainError::Malformed(CodecError::OutOfRange))?;
        verifier.finish(&expected)
    }

    /// Storage/wire form: `{"sz":…,"oh":…,"hmac":…[,"dc":…],"en":[…]}`.
    pub fn encode(&self, out: &mut String) -> Result<(), VoucherError> {
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(out, "sz");
        codec::write_uint(out, self.en.len() as u64, 32)?;
        out.push(codec::COMMA);
        codec::write_key(out, "oh");
        self.oh.encode(out)?;
        out.push(codec::COMMA);
        codec::write_key(out, "hmac");
        self.hmac.encode(out);
        if let Some(dc) = &self.dc {
            out.push(codec::COMMA);
            codec::write_key(out, "dc");
            out.push(codec::BEGIN_ARRAY);
            codec::write_uint(out, dc.len() as u64, 8)?;
            for cert in dc {
                out.push(codec::COMMA);
                out.push(codec::BEGIN_ARRAY);
                codec::write_uint(out, cert.len() as u64, 32)?;
                out.push(codec::COMMA);
                codec::write_bytes(out, cert);
                out.push(codec::END_ARRAY);
            }
            out.push(codec::END_ARRAY);
        }
        out.push(codec::COMMA);
        codec::write_key(out, "en");
        out.push(codec::BEGIN_ARRAY);
        for (i, signed) in self.en.iter().enumerate() {
            if i > 0 {
                out.push(codec::COMMA);
            }
            signed.encode(out, self.oh.pe)?;
        }
        out.push(codec::END_ARRAY);
        out.push(codec::END_OBJECT);
        Ok(())
    }

    pub fn decode(text: &str) -> Result<(Self, HeaderText), CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("sz")?;
        let sz = r.uint32()? as usize;
        r.expect(codec::COMMA)?;
        r.expect_key("oh")?;
        let (oh, texts) = VoucherHeader::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("hmac")?;
        let hmac = HashMac::decode(&mut r)?;
        let dc = if r.consume_matching(",\"dc\":") {
            r.expect(codec::BEGIN_ARRAY)?;
            let n = r.uint8()? as usize;
            let mut certs = Vec::with_capacity(n);
            for _ in 0..n {
                r.expect(codec::COMMA)?;
                r.expect(codec::BEGIN_ARRAY)?;
                let len = r.uint32()? as usize;
                r.expect(codec::COMMA)?;
                let cert = r.bytes()?;
                r.expect(codec::END_ARRAY)?;
                if cert.len() != len {
                    return Err(CodecError::LengthMismatch);
                }
                certs.push(cert);
            }
            r.expect(codec::END_ARRAY)?;
            Some(certs)
        } else {
            None
        };
        r.expect(codec::COMMA)?;
        r.expect_key("en")?;
        r.expect(codec::BEGIN_ARRAY)?;
        let mut en = Vec::with_capacity(sz);
        for i in 0..sz {
            if i > 0 {
                r.expect(codec::COMMA)?;
            }
            en.push(SignatureBlock::decode(&mut r)?.block);
        }
        r.expect(codec::END_ARRAY)?;
        r.expect(codec::END_OBJECT)?;
        Ok((Self { oh, hmac, dc, en }, texts))
    }
}

/// Extract the subject public key from an X.509 certificate by scanning
/// the to-be-signed sequence for the first element that parses as a
/// SubjectPublicKeyInfo. Narrow on purpose; full certificate-path
/// validation belongs to the host.
fn leaf_public_key(cert_der: &[u8]) -> Option<PublicKey> {
    let tbs = der_nested_sequence(cert_der)?;
    let mut pos = 0usize;
    while pos < tbs.len() {
        let (_, _, total) = der_element(&tbs[pos..])?;
        // the SPKI is the first nested SEQUENCE that parses as one
        if tbs[pos] == 0x30 {
            if let Ok(key) = PublicKey::from_spki_der(&tbs[pos..pos + total]) {
                return Some(key);
            }
        }
        pos += total;
    }
    None
}

// Enter Certificate -> tbsCertificate, both SEQUENCEs.
fn der_nested_sequence(der: &[u8]) -> Option<&[u8]> {
    let (start, len, _) = der_element(der)?;
    let outer = &der[start..start + len];
    let (start2, len2, _) = der_element(outer)?;
    if outer.first() != Some(&0x30) {
        return None;
    }
    Some(&outer[start2..start2 + len2])
}

// One DER TLV: (content offset, content length, total length).
fn der_element(buf: &[u8]) -> Option<(usize, usize, usize)> {
    if buf.len() < 2 {
        return None;
    }
    let first_len = buf[1] as usize;
    if first_len < 0x80 {
        let total = 2 + first_len;
        if buf.len() < total {
            return None;
        }
        Some((2, first_len, total))
    } else {
        let n = first_len & 0x7f;
        if n == 0 || n > 4 || buf.len() < 2 + n {
            return None;
        }
        let mut len = 0usize;
        for b in &buf[2..2 + n] {
            len = (len << 8) | *b as usize;
        }
        let total = 2 + n + len;
        if buf.len() < total {
            return None;
        }
        Some((2 + n, len, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::{RendezvousInstr, RvProtocol};
    use crate::types::MacKind;

    fn test_header(owner: &PublicKey) -> VoucherHeader {
        VoucherHeader {
            pe: KeyEncoding::X509,
            r: RendezvousInfo::single(RendezvousInstr::with_host(
                "rv.example",
                8040,
                RvProtocol::Http,
            )),
            g: Guid::generate(),
            d: "widget-3000".to_string(),
            pk: owner.clone(),
            hdc: None,
        }
    }

    fn test_voucher(owner_keys: &KeyPair, secret: &[u8]) -> OwnershipVoucher {
        let oh = test_header(&owner_keys.public_key());
        let texts = oh.texts().unwrap();
        let hmac = MacKind::HmacSha256.mac_of(secret, &[texts.oh.as_bytes()]);
        OwnershipVoucher::new(oh, hmac)
    }

    #[test]
    fn voucher_round_trip() {
        let keys = KeyPair::generate_p256();
        let voucher = test_voucher(&keys, b"device-secret");
        let mut out = String::new();
        voucher.encode(&mut out).unwrap();
        let (decoded, texts) = OwnershipVoucher::decode(&out).unwrap();
        assert_eq!(decoded, voucher);
        // the captured header span equals the canonical encoding
        assert_eq!(texts.oh, voucher.oh.texts().unwrap().oh);
    }

    #[test]
    fn unextended_voucher_owner_is_header_key() {
        let keys = KeyPair::generate_p256();
        let voucher = test_voucher(&keys, b"s");
        assert_eq!(voucher.current_owner_key().unwrap(), keys.public_key());
        assert!(voucher.verify_chain().is_ok());
    }

    #[test]
    fn extended_chain_verifies() {
        let maker = KeyPair::generate_p256();
        let reseller = KeyPair::generate_p256();
        let owner = KeyPair::generate_p256();
        let mut voucher = test_voucher(&maker, b"s");
        voucher.extend(&maker, &reseller.public_key()).unwrap();
        voucher.extend(&reseller, &owner.public_key()).unwrap();
        assert_eq!(voucher.en.len(), 2);
        assert_eq!(voucher.verify_chain().unwrap(), owner.public_key());
    }

    #[test]
    fn extend_requires_current_owner() {
        let maker = KeyPair::generate_p256();
        let stranger = KeyPair::generate_p256();
        let mut voucher = test_voucher(&maker, b"s");
        assert!(matches!(
            voucher.extend(&stranger, &stranger.public_key()),
            Err(VoucherError::WrongSigner)
        ));
    }

    #[test]
    fn corrupt_signature_names_entry_signature() {
        let maker = KeyPair::generate_p256();
        let owner = KeyPair::generate_p256();
        let mut voucher = test_voucher(&maker, b"s");
        voucher.extend(&maker, &owner.public_key()).unwrap();
        let last = voucher.en.last_mut().unwrap();
        let mid = last.sg.len() / 2;
        last.sg[mid] ^= 0x01;
        assert_eq!(voucher.verify_chain().unwrap_err(), ChainError::EntrySignature { index: 0 });
    }

    #[test]
    fn corrupt_hc_names_entry_digest() {
        let maker = KeyPair::generate_p256();
        let owner = KeyPair::generate_p256();
        let mut voucher = test_voucher(&maker, b"s");
        // build the entry with a wrong hc, properly signed
        let digest = voucher.digest_kind().unwrap();
        let texts = voucher.oh.texts().unwrap();
        let mut hmac_text = String::new();
        voucher.hmac.encode(&mut hmac_text);
        let mut bad_hc = digest.digest_of(&[texts.g.as_bytes(), texts.d.as_bytes()]);
        bad_hc.bytes[0] ^= 0xff;
        let hp = digest.digest_of(&[texts.oh.as_bytes(), hmac_text.as_bytes()]);
        let entry = VoucherEntry { hp, hc: bad_hc, pk: owner.public_key() };
        let mut bo = String::new();
        entry.encode(&mut bo, voucher.oh.pe).unwrap();
        voucher.en.push(SignatureBlock::sign(bo, maker.public_key(), &maker).unwrap());
        assert_eq!(voucher.verify_chain().unwrap_err(), ChainError::EntryDigest { index: 0 });
    }

    #[test]
    fn corrupt_hp_names_chain_digest() {
        let maker = KeyPair::generate_p256();
        let owner = KeyPair::generate_p256();
        let mut voucher = test_voucher(&maker, b"s");
        let digest = voucher.digest_kind().unwrap();
        let texts = voucher.oh.texts().unwrap();
        let hc = digest.digest_of(&[texts.g.as_bytes(), texts.d.as_bytes()]);
        let bad_hp = digest.digest_of(&[b"not the header"]);
        let entry = VoucherEntry { hp: bad_hp, hc, pk: owner.public_key() };
        let mut bo = String::new();
        entry.encode(&mut bo, voucher.oh.pe).unwrap();
        voucher.en.push(SignatureBlock::sign(bo, maker.public_key(), &maker).unwrap());
        assert_eq!(voucher.verify_chain().unwrap_err(), ChainError::ChainDigest { index: 0 });
    }

    #[test]
    fn wrong_final_key_names_owner_mismatch() {
        let maker = KeyPair::generate_p256();
        let owner = KeyPair::generate_p256();
        let mut voucher = test_voucher(&maker, b"s");
        voucher.extend(&maker, &owner.public_key()).unwrap();
        let digest = voucher.digest_kind().unwrap();
        let texts = voucher.oh.texts().unwrap();
        let mut hmac_text = String::new();
        voucher.hmac.encode(&mut hmac_text);
        let mut verifier =
            ChainVerifier::new(digest, &texts, &hmac_text, voucher.oh.pk.clone());
        verifier.feed(&voucher.en[0]).unwrap();
        // the live prover presents a different key than the chain ends on
        let imposter = KeyPair::generate_p256().public_key();
        assert_eq!(verifier.finish(&imposter).unwrap_err(), ChainError::OwnerKeyMismatch);
    }

    #[test]
    fn p384_chain_uses_sha384() {
        let maker = KeyPair::generate_p384();
        let owner = KeyPair::generate_p384();
        let mut voucher = test_voucher(&maker, b"s");
        assert_eq!(voucher.digest_kind().unwrap(), DigestKind::Sha384);
        voucher.extend(&maker, &owner.public_key()).unwrap();
        assert_eq!(voucher.verify_chain().unwrap(), owner.public_key());
    }
}
