//! The HMAC-authenticated encrypted-message envelope.
//!
//! Every post-handshake message travels as
//! `{"ct":<CipherText>,"hmac":[len,"b64"]}`. The MAC is computed over
//! the exact serialized text of the `ct` field, keyed with the session
//! verification key; the algorithm follows the key length (32 bytes →
//! HMAC-SHA256, 64 → HMAC-SHA384). Decoding verifies the MAC before any
//! plaintext is released, and a MAC mismatch is its own error, never a
//! parse failure.

use crate::cipher::{CipherError, CipherText, SessionCipher};
use crate::codec::{self, CodecError, Reader};
use crate::secret::{secure_eq, SecretBytes};
use crate::types::MacKind;

/// An envelope failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The envelope text was not parsable.
    Parse(CodecError),
    /// The MAC did not verify. Never folded into parse failures.
    HmacVerification,
    /// The enclosed ciphertext could not be deciphered.
    Cipher(CipherError),
    /// The SVK has a length no MAC algorithm corresponds to.
    BadKey,
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "bad envelope: {}", e),
            Self::HmacVerification => write!(f, "envelope HMAC verification failed"),
            Self::Cipher(e) => write!(f, "envelope cipher failure: {}", e),
            Self::BadKey => write!(f, "illegal SVK length"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl From<CodecError> for EnvelopeError {
    fn from(e: CodecError) -> Self {
        Self::Parse(e)
    }
}

impl From<CipherError> for EnvelopeError {
    fn from(e: CipherError) -> Self {
        Self::Cipher(e)
    }
}

/// Encoder/decoder for the authenticated envelope, bound to one
/// session's verification key.
pub struct Envelope {
    svk: SecretBytes,
}

impl Envelope {
    pub fn new(svk: SecretBytes) -> Result<Self, EnvelopeError> {
        match svk.len() {
            32 | 64 => Ok(Self { svk }),
            _ => Err(EnvelopeError::BadKey),
        }
    }

    // MAC algorithm follows the SVK size.
    fn mac_kind(&self) -> MacKind {
        if self.svk.len() == 32 {
            MacKind::HmacSha256
        } else {
            MacKind::HmacSha384
        }
    }

    /// Wrap a ciphertext.
    pub fn encode(&self, ct: &CipherText) -> Result<String, EnvelopeError> {
        let mut ct_text = String::new();
        ct.encode(&mut ct_text)?;
        let mac = self.mac_kind().mac_of(self.svk.as_bytes(), &[ct_text.as_bytes()]);

        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "ct");
        out.push_str(&ct_text);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "hmac");
        out.push(codec::BEGIN_ARRAY);
        codec::write_uint(&mut out, mac.bytes.len() as u64, 8)?;
        out.push(codec::COMMA);
        codec::write_bytes(&mut out, &mac.bytes);
        out.push(codec::END_ARRAY);
        out.push(codec::END_OBJECT);
        Ok(out)
    }

    /// Unwrap an envelope, verifying the MAC over the verbatim `ct` span.
    pub fn decode(&self, text: &str) -> Result<CipherText, EnvelopeError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("ct")?;
        let ct_start = r.position();
        let ct = CipherText::decode(&mut r)?;
        let ct_text = r.span(ct_start, r.position());
        let actual = self.mac_kind().mac_of(self.svk.as_bytes(), &[ct_text.as_bytes()]);

        r.expect(codec::COMMA)?;
        r.expect_key("hmac")?;
        r.expect(codec::BEGIN_ARRAY)?;
        let len = r.uint8()? as usize;
        r.expect(codec::COMMA)?;
        let expected = r.bytes()?;
        r.expect(codec::END_ARRAY)?;
        r.expect(codec::END_OBJECT)?;
        if !r.is_empty() {
            return Err(EnvelopeError::Parse(CodecError::Unexpected(r.position())));
        }
        if expected.len() != len {
            return Err(EnvelopeError::Parse(CodecError::LengthMismatch));
        }
        if !secure_eq(&expected, &actual.bytes) {
            return Err(EnvelopeError::HmacVerification);
        }
        Ok(ct)
    }

    /// Encipher and wrap a plaintext message body in one step.
    pub fn seal(&self, cipher: &mut SessionCipher, plain: &str) -> Result<String, EnvelopeError> {
        let ct = cipher.encipher(plain.as_bytes())?;
        self.encode(&ct)
    }

    /// Unwrap and decipher a message body in one step. The MAC is
    /// checked before the cipher ever sees the ciphertext.
    pub fn open(&self, cipher: &SessionCipher, text: &str) -> Result<String, EnvelopeError> {
        let ct = self.decode(text)?;
        let plain = cipher.decipher(&ct)?;
        String::from_utf8(plain).map_err(|_| EnvelopeError::Cipher(CipherError::Malformed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CipherAlgorithm, CipherMode, CipherSuite};

    fn setup(mode: CipherMode) -> (Envelope, SessionCipher, SessionCipher) {
        let svk = SecretBytes::from_slice(&[0x22u8; 32]);
        let sek = SecretBytes::from_slice(&[0x33u8; 16]);
        let suite = CipherSuite::new(CipherAlgorithm::Aes128, mode, MacKind::HmacSha256);
        (
            Envelope::new(svk).unwrap(),
            SessionCipher::new(sek.clone(), suite).unwrap(),
            SessionCipher::new(sek, suite).unwrap(),
        )
    }

    #[test]
    fn seal_open_round_trip_ctr_and_cbc() {
        for mode in [CipherMode::Ctr, CipherMode::Cbc] {
            let (env, mut enc, dec) = setup(mode);
            for plain in ["", "{\"nn\":0,\"dsi\":{}}"] {
                let sealed = env.seal(&mut enc, plain).unwrap();
                assert_eq!(env.open(&dec, &sealed).unwrap(), plain);
            }
        }
    }

    #[test]
    fn tampered_ciphertext_fails_hmac_not_decode() {
        let (env, mut enc, dec) = setup(CipherMode::Ctr);
        let sealed = env.seal(&mut enc, "secret payload").unwrap();
        // flip one base64 character inside the ct field
        let idx = sealed.find("\"ct\":").unwrap() + 30;
        let mut bytes = sealed.into_bytes();
        bytes[idx] = if bytes[idx] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();
        match env.open(&dec, &tampered) {
            Err(EnvelopeError::HmacVerification) | Err(EnvelopeError::Parse(_)) => {}
            other => panic!("expected rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn tampered_mac_fails_hmac() {
        let (env, mut enc, dec) = setup(CipherMode::Cbc);
        let sealed = env.seal(&mut enc, "secret payload").unwrap();
        // flip a character in the hmac field's base64
        let at = sealed.rfind('"').unwrap() - 2;
        let mut bytes = sealed.into_bytes();
        bytes[at] = if bytes[at] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();
        assert!(matches!(
            env.open(&dec, &tampered),
            Err(EnvelopeError::HmacVerification) | Err(EnvelopeError::Parse(_))
        ));
    }

    #[test]
    fn wrong_svk_fails_hmac() {
        let (env, mut enc, dec) = setup(CipherMode::Ctr);
        let sealed = env.seal(&mut enc, "payload").unwrap();
        let other = Envelope::new(SecretBytes::from_slice(&[9u8; 32])).unwrap();
        assert_eq!(other.open(&dec, &sealed).unwrap_err(), EnvelopeError::HmacVerification);
        // the right key still works
        assert_eq!(env.open(&dec, &sealed).unwrap(), "payload");
    }

    #[test]
    fn trailing_garbage_is_a_parse_error() {
        let (env, mut enc, _) = setup(CipherMode::Ctr);
        let mut sealed = env.seal(&mut enc, "x").unwrap();
        sealed.push('!');
        assert!(matches!(env.decode(&sealed), Err(EnvelopeError::Parse(_))));
    }

    #[test]
    fn svk_length_selects_mac() {
        let env64 = Envelope::new(SecretBytes::from_slice(&[1u8; 64])).unwrap();
        assert_eq!(env64.mac_kind(), MacKind::HmacSha384);
        assert!(Envelope::new(SecretBytes::from_slice(&[1u8; 48])).is_err());
    }
}
