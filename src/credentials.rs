//! Device credentials: the device-held state that survives onboarding.
//!
//! A credential block records the device's lifecycle state, the HMAC
//! secret binding it to its voucher, the manufacturer's device-info,
//! and the owner block (GUID, rendezvous info, owner-key digest). The
//! owner block is rewritten at the end of each successful transfer
//! unless the reuse protocol applies.

use crate::codec::{self, CodecError, Reader};
use crate::keys::KeyEncoding;
use crate::rendezvous::RendezvousInfo;
use crate::secret::SecretBytes;
use crate::types::{Guid, HashDigest};

/// Device lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Bricked; refuses all protocols.
    PermanentlyDisabled,
    /// In manufacturing; credentials not yet finalized.
    Manufacturing,
    /// Ready for its first ownership transfer.
    Ready1,
    /// First transfer done, idling.
    Idle1,
    /// Transfer-ready with rotated credentials.
    ReadyN,
    /// Rotated and idling.
    IdleN,
}

impl DeviceState {
    pub fn code(self) -> u8 {
        match self {
            Self::PermanentlyDisabled => 0,
            Self::Manufacturing => 1,
            Self::Ready1 => 3,
            Self::Idle1 => 4,
            Self::ReadyN => 5,
            Self::IdleN => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::PermanentlyDisabled,
            1 => Self::Manufacturing,
            3 => Self::Ready1,
            4 => Self::Idle1,
            5 => Self::ReadyN,
            6 => Self::IdleN,
            _ => return None,
        })
    }

    /// States in which the device will start a transfer.
    pub fn is_transfer_ready(self) -> bool {
        matches!(self, Self::Ready1 | Self::ReadyN)
    }
}

/// The manufacturer's block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerBlock {
    /// Device-info string, bound into the voucher identity hash.
    pub d: String,
}

/// The owner's block, rewritten on rotation.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerBlock {
    pub pe: KeyEncoding,
    pub g: Guid,
    pub r: RendezvousInfo,
    /// Digest of the current owner's public key text.
    pub pkh: HashDigest,
}

/// The device credential block.
#[derive(Debug, Clone)]
pub struct DeviceCredentials {
    pub st: DeviceState,
    /// HMAC key material binding the device to its voucher.
    pub secret: SecretBytes,
    pub m: ManufacturerBlock,
    pub o: OwnerBlock,
}

impl DeviceCredentials {
    pub fn guid(&self) -> Guid {
        self.o.g
    }

    /// At-rest text form:
    /// `{"ST":…,"Secret":"b64","M":{"d":…},"O":{"pv":…,"pe":…,"g":…,"r":…,"pkh":…}}`.
    pub fn encode(&self) -> Result<String, CodecError> {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "ST");
        codec::write_uint(&mut out, self.st.code() as u64, 8)?;
        out.push(codec::COMMA);
        codec::write_key(&mut out, "Secret");
        codec::write_bytes(&mut out, self.secret.as_bytes());
        out.push(codec::COMMA);
        codec::write_key(&mut out, "M");
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "d");
        codec::write_string(&mut out, &self.m.d);
        out.push(codec::END_OBJECT);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "O");
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "pv");
        codec::write_uint(&mut out, crate::proto::PROTOCOL_VERSION as u64, 32)?;
        out.push(codec::COMMA);
        codec::write_key(&mut out, "pe");
        self.o.pe.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "g");
        self.o.g.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "r");
        self.o.r.encode(&mut out)?;
        out.push(codec::COMMA);
        codec::write_key(&mut out, "pkh");
        self.o.pkh.encode(&mut out);
        out.push(codec::END_OBJECT);
        out.push(codec::END_OBJECT);
        Ok(out)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("ST")?;
        let at = r.position();
        let st = DeviceState::from_code(r.uint8()?).ok_or(CodecError::Unexpected(at))?;
        r.expect(codec::COMMA)?;
        r.expect_key("Secret")?;
        let mut secret_bytes = r.bytes()?;
        let secret = SecretBytes::from_bytes_then_delete(&mut secret_bytes);
        r.expect(codec::COMMA)?;
        r.expect_key("M")?;
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("d")?;
        let d = r.string()?;
        r.expect(codec::END_OBJECT)?;
        r.expect(codec::COMMA)?;
        r.expect_key("O")?;
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("pv")?;
        let at = r.position();
        if r.uint32()? != crate::proto::PROTOCOL_VERSION {
            return Err(CodecError::Unexpected(at));
        }
        r.expect(codec::COMMA)?;
        r.expect_key("pe")?;
        let pe = KeyEncoding::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("g")?;
        let g = Guid::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("r")?;
        let rv = RendezvousInfo::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("pkh")?;
        let pkh = HashDigest::decode(&mut r)?;
        r.expect(codec::END_OBJECT)?;
        r.expect(codec::END_OBJECT)?;
        Ok(Self {
            st,
            secret,
            m: ManufacturerBlock { d },
            o: OwnerBlock { pe, g, r: rv, pkh },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::{RendezvousInstr, RvProtocol};
    use crate::types::DigestKind;

    #[test]
    fn credentials_round_trip() {
        let creds = DeviceCredentials {
            st: DeviceState::Ready1,
            secret: SecretBytes::from_slice(&[5u8; 16]),
            m: ManufacturerBlock { d: "widget-3000".to_string() },
            o: OwnerBlock {
                pe: KeyEncoding::X509,
                g: Guid::generate(),
                r: RendezvousInfo::single(RendezvousInstr::with_host(
                    "rv.example",
                    8040,
                    RvProtocol::Http,
                )),
                pkh: DigestKind::Sha256.digest_of(&[b"owner key text"]),
            },
        };
        let text = creds.encode().unwrap();
        let decoded = DeviceCredentials::decode(&text).unwrap();
        assert_eq!(decoded.st, creds.st);
        assert_eq!(decoded.secret, creds.secret);
        assert_eq!(decoded.m, creds.m);
        assert_eq!(decoded.o, creds.o);
    }

    #[test]
    fn transfer_ready_states() {
        assert!(DeviceState::Ready1.is_transfer_ready());
        assert!(DeviceState::ReadyN.is_transfer_ready());
        assert!(!DeviceState::Idle1.is_transfer_ready());
        assert!(!DeviceState::Manufacturing.is_transfer_ready());
    }
}
