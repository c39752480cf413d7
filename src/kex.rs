//! Key exchange algorithms for the ownership-transfer handshake.
//!
//! Each exchange produces this side's public contribution (`message`) and,
//! given the peer's contribution, a raw shared secret. The secret feeds
//! the KDF and is scrubbed as soon as the session keys exist; an exchange
//! is consumed by `shared_secret` so it cannot be replayed.
//!
//! Three families share the one type: finite-field Diffie-Hellman over
//! two fixed MODP groups, elliptic-curve Diffie-Hellman over P-256/P-384
//! with length-prefixed coordinates and an extra random per side, and an
//! RSA-OAEP "asymmetric" exchange where the device picks the secret and
//! mails it to the owner. The ECDH secret concatenation order differs by
//! role and must stay exactly as it is.

use p256::elliptic_curve::generic_array::GenericArray;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use rand_core::{OsRng, RngCore};
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::codec::{self, CodecError, Reader};
use crate::secret::SecretBytes;

/// RFC 3526 MODP group 14 (2048-bit) prime.
const MODP_2048: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

/// RFC 3526 MODP group 15 (3072-bit) prime.
const MODP_3072: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33\
A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864\
D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2\
08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

/// Which side of the exchange this instance plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Device,
    Owner,
}

/// Key exchange algorithm identifiers; encoded as quoted names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexType {
    DhGroup14,
    DhGroup15,
    EcdhP256,
    EcdhP384,
    Asym2048,
    Asym3072,
}

impl KexType {
    pub fn name(self) -> &'static str {
        match self {
            Self::DhGroup14 => "DHKEXid14",
            Self::DhGroup15 => "DHKEXid15",
            Self::EcdhP256 => "ECDH",
            Self::EcdhP384 => "ECDH384",
            Self::Asym2048 => "ASYMKEX",
            Self::Asym3072 => "ASYMKEX3072",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "DHKEXid14" => Self::DhGroup14,
            "DHKEXid15" => Self::DhGroup15,
            "ECDH" => Self::EcdhP256,
            "ECDH384" => Self::EcdhP384,
            "ASYMKEX" => Self::Asym2048,
            "ASYMKEX3072" => Self::Asym3072,
            _ => return None,
        })
    }

    pub fn encode(self, out: &mut String) {
        codec::write_string(out, self.name());
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let at = r.position();
        let name = r.string()?;
        Self::from_name(&name).ok_or(CodecError::Unexpected(at))
    }

    /// Bytes of extra random each ECDH side contributes.
    fn ecdh_random_len(self) -> usize {
        match self {
            Self::EcdhP256 => 16,
            Self::EcdhP384 => 48,
            _ => 0,
        }
    }

    /// Size of the asymmetric-exchange halves, fixed by type.
    pub fn asym_secret_len(self) -> usize {
        match self {
            Self::Asym2048 => 32,
            Self::Asym3072 => 96,
            _ => 0,
        }
    }

    /// RSA modulus bits required of the owner key for this exchange.
    pub fn asym_modulus_bits(self) -> usize {
        match self {
            Self::Asym2048 => 2048,
            Self::Asym3072 => 3072,
            _ => 0,
        }
    }
}

/// A key-exchange failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexError {
    /// The peer's contribution was malformed: a length prefix overran
    /// the buffer, a coordinate had the wrong size, or a field was
    /// missing. Caller-visible; not a crypto failure.
    Malformed,
    /// A local cryptographic operation failed.
    Crypto,
    /// The owner key supplied for an asymmetric exchange has the wrong
    /// modulus size.
    WrongKeySize,
}

impl std::fmt::Display for KexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed key exchange parameter"),
            Self::Crypto => write!(f, "key exchange crypto failure"),
            Self::WrongKeySize => write!(f, "wrong key size for exchange type"),
        }
    }
}

impl std::error::Error for KexError {}

enum Inner {
    Dh {
        ty: KexType,
        prime: BigUint,
        exponent: BigUint,
    },
    Ecdh256 {
        secret: p256::ecdh::EphemeralSecret,
        random: SecretBytes,
    },
    Ecdh384 {
        secret: p384::ecdh::EphemeralSecret,
        random: SecretBytes,
    },
    /// Owner side: holds the RSA keypair and the cleartext random `A`.
    AsymOwner {
        ty: KexType,
        keys: Box<RsaPrivateKey>,
        a: SecretBytes,
    },
    /// Device side: holds the owner's public key and the random `B`.
    AsymDevice {
        ty: KexType,
        owner_key: RsaPublicKey,
        b: SecretBytes,
    },
}

/// One side of a single handshake's key exchange.
///
/// Holds the ephemeral keypair and local random; consumed by
/// `shared_secret` and scrubbed on drop.
pub struct KeyExchange {
    role: Role,
    inner: Inner,
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl KeyExchange {
    /// Start a Diffie-Hellman or ECDH exchange.
    ///
    /// Asymmetric exchanges need key material and use the dedicated
    /// constructors; requesting one here is a `WrongKeySize` error.
    pub fn new(ty: KexType, role: Role) -> Result<Self, KexError> {
        let inner = match ty {
            KexType::DhGroup14 | KexType::DhGroup15 => {
                let hex = if ty == KexType::DhGroup14 { MODP_2048 } else { MODP_3072 };
                let prime = BigUint::parse_bytes(hex.as_bytes(), 16).ok_or(KexError::Crypto)?;
                let mut buf = vec![0u8; hex.len() / 2];
                OsRng.fill_bytes(&mut buf);
                let exponent = BigUint::from_bytes_be(&buf) % &prime;
                use zeroize::Zeroize;
                buf.zeroize();
                Inner::Dh { ty, prime, exponent }
            }
            KexType::EcdhP256 => {
                let mut random = SecretBytes::new(ty.ecdh_random_len());
                OsRng.fill_bytes(random.as_mut());
                Inner::Ecdh256 { secret: p256::ecdh::EphemeralSecret::random(&mut OsRng), random }
            }
            KexType::EcdhP384 => {
                let mut random = SecretBytes::new(ty.ecdh_random_len());
                OsRng.fill_bytes(random.as_mut());
                Inner::Ecdh384 { secret: p384::ecdh::EphemeralSecret::random(&mut OsRng), random }
            }
            KexType::Asym2048 | KexType::Asym3072 => return Err(KexError::WrongKeySize),
        };
        Ok(Self { role, inner })
    }

    /// Start the owner side of an asymmetric exchange with the owner's
    /// RSA keypair.
    pub fn new_asym_owner(ty: KexType, keys: RsaPrivateKey) -> Result<Self, KexError> {
        use rsa::traits::PublicKeyParts;
        if keys.n().bits() != ty.asym_modulus_bits() {
            return Err(KexError::WrongKeySize);
        }
        let mut a = SecretBytes::new(ty.asym_secret_len());
        OsRng.fill_bytes(a.as_mut());
        Ok(Self { role: Role::Owner, inner: Inner::AsymOwner { ty, keys: Box::new(keys), a } })
    }

    /// Start the device side of an asymmetric exchange with the owner's
    /// public key (learned from the prove-header signature).
    pub fn new_asym_device(ty: KexType, owner_key: RsaPublicKey) -> Result<Self, KexError> {
        use rsa::traits::PublicKeyParts;
        if owner_key.n().bits() != ty.asym_modulus_bits() {
            return Err(KexError::WrongKeySize);
        }
        let mut b = SecretBytes::new(ty.asym_secret_len());
        OsRng.fill_bytes(b.as_mut());
        Ok(Self { role: Role::Device, inner: Inner::AsymDevice { ty, owner_key, b } })
    }

    pub fn kex_type(&self) -> KexType {
        match &self.inner {
            Inner::Dh { ty, .. } | Inner::AsymOwner { ty, .. } | Inner::AsymDevice { ty, .. } => {
                *ty
            }
            Inner::Ecdh256 { .. } => KexType::EcdhP256,
            Inner::Ecdh384 { .. } => KexType::EcdhP384,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// This side's public contribution (`xA` from the owner, `xB` from
    /// the device).
    pub fn message(&self) -> Result<Vec<u8>, KexError> {
        match &self.inner {
            Inner::Dh { prime, exponent, .. } => {
                let public = BigUint::from(2u32).modpow(exponent, prime);
                let width = (prime.bits() + 7) / 8;
                fixed_width(&public.to_bytes_be(), width as usize)
            }
            Inner::Ecdh256 { secret, random } => {
                let point = secret.public_key().to_encoded_point(false);
                let (x, y) = (point.x().ok_or(KexError::Crypto)?, point.y().ok_or(KexError::Crypto)?);
                Ok(ecdh_message(x, y, random.as_bytes()))
            }
            Inner::Ecdh384 { secret, random } => {
                let point = secret.public_key().to_encoded_point(false);
                let (x, y) = (point.x().ok_or(KexError::Crypto)?, point.y().ok_or(KexError::Crypto)?);
                Ok(ecdh_message(x, y, random.as_bytes()))
            }
            Inner::AsymOwner { a, .. } => Ok(a.as_bytes().to_vec()),
            Inner::AsymDevice { owner_key, b, .. } => owner_key
                .encrypt(&mut OsRng, Oaep::new::<Sha256>(), b.as_bytes())
                .map_err(|_| KexError::Crypto),
        }
    }

    /// Consume the peer's contribution and produce the raw shared secret.
    ///
    /// The exchange is consumed; its ephemeral state is dropped (and
    /// scrubbed) before this returns.
    pub fn shared_secret(self, peer: &[u8]) -> Result<SecretBytes, KexError> {
        match self.inner {
            Inner::Dh { prime, exponent, .. } => {
                if peer.is_empty() {
                    return Err(KexError::Malformed);
                }
                let theirs = BigUint::from_bytes_be(peer);
                if theirs == BigUint::from(0u32) || theirs >= prime {
                    return Err(KexError::Malformed);
                }
                let shared = theirs.modpow(&exponent, &prime);
                let width = (prime.bits() + 7) / 8;
                let mut bytes = fixed_width(&shared.to_bytes_be(), width as usize)?;
                Ok(SecretBytes::from_bytes_then_delete(&mut bytes))
            }
            Inner::Ecdh256 { secret, random } => {
                let (x, y, theirs) = ecdh_split(peer, 32)?;
                let point = p256::EncodedPoint::from_affine_coordinates(
                    GenericArray::from_slice(&x),
                    GenericArray::from_slice(&y),
                    false,
                );
                let peer_key: Option<p256::PublicKey> =
                    p256::PublicKey::from_encoded_point(&point).into();
                let peer_key = peer_key.ok_or(KexError::Malformed)?;
                let shx = secret.diffie_hellman(&peer_key);
                Ok(assemble_ecdh(self.role, shx.raw_secret_bytes().as_slice(), random.as_bytes(), &theirs))
            }
            Inner::Ecdh384 { secret, random } => {
                let (x, y, theirs) = ecdh_split(peer, 48)?;
                let point = p384::EncodedPoint::from_affine_coordinates(
                    GenericArray::from_slice(&x),
                    GenericArray::from_slice(&y),
                    false,
                );
                let peer_key: Option<p384::PublicKey> =
                    p384::PublicKey::from_encoded_point(&point).into();
                let peer_key = peer_key.ok_or(KexError::Malformed)?;
                let shx = secret.diffie_hellman(&peer_key);
                Ok(assemble_ecdh(self.role, shx.raw_secret_bytes().as_slice(), random.as_bytes(), &theirs))
            }
            Inner::AsymOwner { ty, keys, a } => {
                let mut b = keys
                    .decrypt(Oaep::new::<Sha256>(), peer)
                    .map_err(|_| KexError::Malformed)?;
                if b.len() != ty.asym_secret_len() {
                    return Err(KexError::Malformed);
                }
                let mut out = SecretBytes::new(b.len() + a.len());
                out.as_mut()[..b.len()].copy_from_slice(&b);
                out.as_mut()[b.len()..].copy_from_slice(a.as_bytes());
                use zeroize::Zeroize;
                b.zeroize();
                Ok(out)
            }
            Inner::AsymDevice { ty, b, .. } => {
                if peer.len() != ty.asym_secret_len() {
                    return Err(KexError::Malformed);
                }
                let mut out = SecretBytes::new(b.len() + peer.len());
                out.as_mut()[..b.len()].copy_from_slice(b.as_bytes());
                out.as_mut()[b.len()..].copy_from_slice(peer);
                Ok(out)
            }
        }
    }
}

/// The final ECDH secret: `Shx ‖ DeviceRandom ‖ OwnerRandom`. Each side
/// appends its own random in the slot its role owns; the asymmetry is
/// load-bearing.
fn assemble_ecdh(role: Role, shx: &[u8], mine: &[u8], theirs: &[u8]) -> SecretBytes {
    let mut out = SecretBytes::new(shx.len() + mine.len() + theirs.len());
    let buf = out.as_mut();
    buf[..shx.len()].copy_from_slice(shx);
    match role {
        Role::Device => {
            buf[shx.len()..shx.len() + mine.len()].copy_from_slice(mine);
            buf[shx.len() + mine.len()..].copy_from_slice(theirs);
        }
        Role::Owner => {
            buf[shx.len()..shx.len() + theirs.len()].copy_from_slice(theirs);
            buf[shx.len() + theirs.len()..].copy_from_slice(mine);
        }
    }
    out
}

/// `len-prefixed(x) ‖ len-prefixed(y) ‖ len-prefixed(random)` with
/// 2-byte big-endian length prefixes.
fn ecdh_message(x: &[u8], y: &[u8], random: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + x.len() + y.len() + random.len());
    for field in [x, y, random] {
        out.extend_from_slice(&(field.len() as u16).to_be_bytes());
        out.extend_from_slice(field);
    }
    out
}

/// Split a peer's ECDH message into (x, y, random), checking every
/// length prefix against the buffer before trusting any of them.
fn ecdh_split(msg: &[u8], coord_len: usize) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), KexError> {
    let mut fields = Vec::new();
    let mut pos = 0usize;
    while pos < msg.len() {
        if pos + 2 > msg.len() {
            return Err(KexError::Malformed);
        }
        let len = u16::from_be_bytes([msg[pos], msg[pos + 1]]) as usize;
        pos += 2;
        if pos + len > msg.len() {
            return Err(KexError::Malformed);
        }
        fields.push(msg[pos..pos + len].to_vec());
        pos += len;
    }
    if fields.len() != 3 {
        return Err(KexError::Malformed);
    }
    let random = fields.pop().unwrap();
    let y = fixed_width(&fields.pop().unwrap(), coord_len)?;
    let x = fixed_width(&fields.pop().unwrap(), coord_len)?;
    Ok((x, y, random))
}

/// Normalize a big-endian integer to exactly `width` bytes.
fn fixed_width(bytes: &[u8], width: usize) -> Result<Vec<u8>, KexError> {
    let stripped: &[u8] = {
        let mut b = bytes;
        while b.len() > 1 && b[0] == 0 {
            b = &b[1..];
        }
        b
    };
    if stripped.len() > width {
        return Err(KexError::Malformed);
    }
    let mut out = vec![0u8; width];
    out[width - stripped.len()..].copy_from_slice(stripped);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange_pair(ty: KexType) -> (SecretBytes, SecretBytes) {
        let device = KeyExchange::new(ty, Role::Device).unwrap();
        let owner = KeyExchange::new(ty, Role::Owner).unwrap();
        let xb = device.message().unwrap();
        let xa = owner.message().unwrap();
        (device.shared_secret(&xa).unwrap(), owner.shared_secret(&xb).unwrap())
    }

    #[test]
    fn ecdh_p256_sides_agree() {
        let (d, o) = exchange_pair(KexType::EcdhP256);
        // Shx(32) + 16 + 16
        assert_eq!(d.len(), 64);
        assert_eq!(d, o);
    }

    #[test]
    fn ecdh_p384_sides_agree() {
        let (d, o) = exchange_pair(KexType::EcdhP384);
        assert_eq!(d.len(), 48 + 48 + 48);
        assert_eq!(d, o);
    }

    #[test]
    fn dh_group14_sides_agree() {
        let (d, o) = exchange_pair(KexType::DhGroup14);
        assert_eq!(d.len(), 256);
        assert_eq!(d, o);
    }

    #[test]
    fn dh_message_is_fixed_width() {
        let kx = KeyExchange::new(KexType::DhGroup14, Role::Owner).unwrap();
        assert_eq!(kx.message().unwrap().len(), 256);
    }

    #[test]
    fn asym_sides_agree() {
        let keys = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let owner = KeyExchange::new_asym_owner(KexType::Asym2048, keys.clone()).unwrap();
        let device =
            KeyExchange::new_asym_device(KexType::Asym2048, keys.to_public_key()).unwrap();
        let xa = owner.message().unwrap();
        let xb = device.message().unwrap();
        let ds = device.shared_secret(&xa).unwrap();
        let os = owner.shared_secret(&xb).unwrap();
        assert_eq!(ds.len(), 64); // B(32) || A(32)
        assert_eq!(ds, os);
    }

    #[test]
    fn ecdh_rejects_length_prefix_overrun() {
        let owner = KeyExchange::new(KexType::EcdhP256, Role::Owner).unwrap();
        // length prefix claims 0xffff bytes that are not there
        let bogus = [0xffu8, 0xff, 1, 2, 3];
        assert_eq!(owner.shared_secret(&bogus).unwrap_err(), KexError::Malformed);
    }

    #[test]
    fn ecdh_rejects_two_field_message() {
        let owner = KeyExchange::new(KexType::EcdhP256, Role::Owner).unwrap();
        let mut msg = Vec::new();
        for field in [&[1u8; 32][..], &[2u8; 32][..]] {
            msg.extend_from_slice(&(field.len() as u16).to_be_bytes());
            msg.extend_from_slice(field);
        }
        assert_eq!(owner.shared_secret(&msg).unwrap_err(), KexError::Malformed);
    }

    #[test]
    fn dh_rejects_out_of_range_peer() {
        let owner = KeyExchange::new(KexType::DhGroup14, Role::Owner).unwrap();
        assert_eq!(owner.shared_secret(&[0u8; 4]).unwrap_err(), KexError::Malformed);
    }

    #[test]
    fn asym_owner_requires_matching_modulus() {
        let keys = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        assert_eq!(
            KeyExchange::new_asym_owner(KexType::Asym3072, keys).unwrap_err(),
            KexError::WrongKeySize
        );
    }
}
