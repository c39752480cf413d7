//! Protocol message bodies.
//!
//! One struct per message, each with a bit-exact `encode`/`decode` pair
//! in the original wire field order. Messages whose bodies get signed
//! (prove-to-rendezvous, prove-device, the setup-device "new owner
//! header") encode to the text that goes inside a `SignatureBlock`;
//! their decoders run over the verbatim `bo` span.

use crate::cipher::CipherSuite;
use crate::codec::{self, CodecError, Reader};
use crate::keys::{KeyEncoding, SigInfo, SignatureBlock};
use crate::kex::KexType;
use crate::proto;
use crate::rendezvous::RendezvousInfo;
use crate::serviceinfo::{PreServiceInfo, ServiceInfo};
use crate::types::{Guid, HashDigest, HashMac, Nonce};
use crate::voucher::{HeaderText, VoucherHeader};
use std::net::IpAddr;

fn finish(r: Reader<'_>) -> Result<(), CodecError> {
    if r.is_empty() {
        Ok(())
    } else {
        Err(CodecError::Unexpected(r.position()))
    }
}

// `ai` application-id field: `[len,type,"b64"]`.
fn write_app_id(out: &mut String, ai: &[u8]) -> Result<(), CodecError> {
    out.push(codec::BEGIN_ARRAY);
    codec::write_uint(out, ai.len() as u64, 8)?;
    out.push(codec::COMMA);
    codec::write_uint(out, 0, 8)?;
    out.push(codec::COMMA);
    codec::write_bytes(out, ai);
    out.push(codec::END_ARRAY);
    Ok(())
}

fn read_app_id(r: &mut Reader<'_>) -> Result<Vec<u8>, CodecError> {
    r.expect(codec::BEGIN_ARRAY)?;
    let len = r.uint8()? as usize;
    r.expect(codec::COMMA)?;
    let _ty = r.uint8()?;
    r.expect(codec::COMMA)?;
    let ai = r.bytes()?;
    r.expect(codec::END_ARRAY)?;
    if ai.len() != len {
        return Err(CodecError::LengthMismatch);
    }
    Ok(ai)
}

// Key-exchange parameter (`xA`/`xB`): `[len,"b64"]`.
fn write_kex_param(out: &mut String, param: &[u8]) -> Result<(), CodecError> {
    out.push(codec::BEGIN_ARRAY);
    codec::write_uint(out, param.len() as u64, 16)?;
    out.push(codec::COMMA);
    codec::write_bytes(out, param);
    out.push(codec::END_ARRAY);
    Ok(())
}

fn read_kex_param(r: &mut Reader<'_>) -> Result<Vec<u8>, CodecError> {
    r.expect(codec::BEGIN_ARRAY)?;
    let len = r.uint16()? as usize;
    r.expect(codec::COMMA)?;
    let param = r.bytes()?;
    r.expect(codec::END_ARRAY)?;
    if param.len() != len {
        return Err(CodecError::LengthMismatch);
    }
    Ok(param)
}

/* ----- TO0: owner registration ----- */

/// TO0.Hello; an empty body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct To0Hello;

impl To0Hello {
    pub const MSG_TYPE: u8 = proto::TO0_HELLO;

    pub fn encode(&self) -> String {
        "{}".to_string()
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self)
    }
}

/// TO0.HelloAck: `{"n3":…}`.
#[derive(Debug, Clone, PartialEq)]
pub struct To0HelloAck {
    pub n3: Nonce,
}

impl To0HelloAck {
    pub const MSG_TYPE: u8 = proto::TO0_HELLO_ACK;

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "n3");
        self.n3.encode(&mut out);
        out.push(codec::END_OBJECT);
        out
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("n3")?;
        let n3 = Nonce::decode(&mut r)?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self { n3 })
    }
}

/// The `to0d` interior of TO0.OwnerSign: the voucher, the requested
/// wait-seconds, and the echoed n3. Its verbatim text is digested into
/// the redirect (`to0dh`), binding redirect to voucher.
#[derive(Debug, Clone)]
pub struct To0OwnerSignBody {
    pub voucher_text: String,
    pub ws: u32,
    pub n3: Nonce,
}

impl To0OwnerSignBody {
    pub fn encode(&self) -> Result<String, CodecError> {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "op");
        out.push_str(&self.voucher_text);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "ws");
        codec::write_uint(&mut out, self.ws as u64, 32)?;
        out.push(codec::COMMA);
        codec::write_key(&mut out, "n3");
        self.n3.encode(&mut out);
        out.push(codec::END_OBJECT);
        Ok(out)
    }
}

/// TO0.OwnerSign: `{"to0d":…,"to1d":…}`. `to1d` is the signed redirect
/// the rendezvous service will hand to devices.
#[derive(Debug, Clone)]
pub struct To0OwnerSign {
    pub to0d_text: String,
    pub to1d: SignatureBlock,
}

impl To0OwnerSign {
    pub const MSG_TYPE: u8 = proto::TO0_OWNER_SIGN;

    pub fn encode(&self, pe: KeyEncoding) -> Result<String, CodecError> {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "to0d");
        out.push_str(&self.to0d_text);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "to1d");
        self.to1d.encode(&mut out, pe).map_err(|_| CodecError::OutOfRange)?;
        out.push(codec::END_OBJECT);
        Ok(out)
    }
}

/// TO0.AcceptOwner: `{"ws":…}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct To0AcceptOwner {
    pub ws: u32,
}

impl To0AcceptOwner {
    pub const MSG_TYPE: u8 = proto::TO0_ACCEPT_OWNER;

    pub fn encode(&self) -> Result<String, CodecError> {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "ws");
        codec::write_uint(&mut out, self.ws as u64, 32)?;
        out.push(codec::END_OBJECT);
        Ok(out)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("ws")?;
        let ws = r.uint32()?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self { ws })
    }
}

/* ----- TO1: owner discovery ----- */

/// TO1.HelloSdo: `{"g2":…,"eA":…}`.
#[derive(Debug, Clone, PartialEq)]
pub struct To1HelloSdo {
    pub g2: Guid,
    pub ea: SigInfo,
}

impl To1HelloSdo {
    pub const MSG_TYPE: u8 = proto::TO1_HELLO_SDO;

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "g2");
        self.g2.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "eA");
        self.ea.encode(&mut out);
        out.push(codec::END_OBJECT);
        out
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("g2")?;
        let g2 = Guid::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("eA")?;
        let ea = SigInfo::decode(&mut r)?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self { g2, ea })
    }
}

/// TO1.HelloSdoAck: `{"n4":…,"eB":…}`.
#[derive(Debug, Clone, PartialEq)]
pub struct To1HelloSdoAck {
    pub n4: Nonce,
    pub eb: SigInfo,
}

impl To1HelloSdoAck {
    pub const MSG_TYPE: u8 = proto::TO1_HELLO_SDO_ACK;

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "n4");
        self.n4.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "eB");
        self.eb.encode(&mut out);
        out.push(codec::END_OBJECT);
        out
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("n4")?;
        let n4 = Nonce::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("eB")?;
        let eb = SigInfo::decode(&mut r)?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self { n4, eb })
    }
}

/// TO1.ProveToSdo body (signed): `{"ai":…,"n4":…,"g2":…}`.
#[derive(Debug, Clone, PartialEq)]
pub struct To1ProveToSdo {
    pub ai: Vec<u8>,
    pub n4: Nonce,
    pub g2: Guid,
}

impl To1ProveToSdo {
    pub const MSG_TYPE: u8 = proto::TO1_PROVE_TO_SDO;

    pub fn encode(&self) -> Result<String, CodecError> {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "ai");
        write_app_id(&mut out, &self.ai)?;
        out.push(codec::COMMA);
        codec::write_key(&mut out, "n4");
        self.n4.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "g2");
        self.g2.encode(&mut out);
        out.push(codec::END_OBJECT);
        Ok(out)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("ai")?;
        let ai = read_app_id(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("n4")?;
        let n4 = Nonce::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("g2")?;
        let g2 = Guid::decode(&mut r)?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self { ai, n4, g2 })
    }
}

/// TO1.SdoRedirect body (signed): `{"i1":…,"dns1":…,"port1":…,"to0dh":…}`.
///
/// An absent address is all-zeroes, an absent DNS name the empty
/// string; at least one of the two must be usable.
#[derive(Debug, Clone, PartialEq)]
pub struct To1SdoRedirect {
    pub i1: Option<IpAddr>,
    pub dns1: Option<String>,
    pub port1: u16,
    /// Digest of the owner-sign `to0d` text this redirect came from.
    pub to0dh: HashDigest,
}

impl To1SdoRedirect {
    pub const MSG_TYPE: u8 = proto::TO1_SDO_REDIRECT;

    pub fn encode(&self) -> Result<String, CodecError> {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "i1");
        let octets = match self.i1 {
            Some(IpAddr::V4(v4)) => v4.octets().to_vec(),
            Some(IpAddr::V6(v6)) => v6.octets().to_vec(),
            None => vec![0u8; 4],
        };
        out.push(codec::BEGIN_ARRAY);
        codec::write_uint(&mut out, octets.len() as u64, 8)?;
        out.push(codec::COMMA);
        codec::write_bytes(&mut out, &octets);
        out.push(codec::END_ARRAY);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "dns1");
        codec::write_string(&mut out, self.dns1.as_deref().unwrap_or(""));
        out.push(codec::COMMA);
        codec::write_key(&mut out, "port1");
        codec::write_uint(&mut out, self.port1 as u64, 16)?;
        out.push(codec::COMMA);
        codec::write_key(&mut out, "to0dh");
        self.to0dh.encode(&mut out);
        out.push(codec::END_OBJECT);
        Ok(out)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("i1")?;
        r.expect(codec::BEGIN_ARRAY)?;
        let len = r.uint8()? as usize;
        r.expect(codec::COMMA)?;
        let octets = r.bytes()?;
        r.expect(codec::END_ARRAY)?;
        if octets.len() != len {
            return Err(CodecError::LengthMismatch);
        }
        let i1 = match octets.len() {
            4 => {
                let arr = <[u8; 4]>::try_from(octets.as_slice()).unwrap();
                if arr == [0, 0, 0, 0] {
                    None
                } else {
                    Some(IpAddr::from(arr))
                }
            }
            16 => Some(IpAddr::from(<[u8; 16]>::try_from(octets.as_slice()).unwrap())),
            _ => return Err(CodecError::LengthMismatch),
        };
        r.expect(codec::COMMA)?;
        r.expect_key("dns1")?;
        let dns1 = r.string()?;
        let dns1 = if dns1.is_empty() { None } else { Some(dns1) };
        r.expect(codec::COMMA)?;
        r.expect_key("port1")?;
        let port1 = r.uint16()?;
        r.expect(codec::COMMA)?;
        r.expect_key("to0dh")?;
        let to0dh = HashDigest::decode(&mut r)?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self { i1, dns1, port1, to0dh })
    }
}

/* ----- TO2: ownership transfer ----- */

/// TO2.HelloDevice: `{"g2":…,"n5":…,"pe":…,"kx":…,"cs":…,"eA":…}`.
#[derive(Debug, Clone, PartialEq)]
pub struct To2HelloDevice {
    pub g2: Guid,
    pub n5: Nonce,
    pub pe: KeyEncoding,
    pub kx: KexType,
    pub cs: CipherSuite,
    pub ea: SigInfo,
}

impl To2HelloDevice {
    pub const MSG_TYPE: u8 = proto::TO2_HELLO_DEVICE;

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "g2");
        self.g2.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "n5");
        self.n5.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "pe");
        self.pe.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "kx");
        self.kx.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "cs");
        self.cs.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "eA");
        self.ea.encode(&mut out);
        out.push(codec::END_OBJECT);
        out
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("g2")?;
        let g2 = Guid::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("n5")?;
        let n5 = Nonce::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("pe")?;
        let pe = KeyEncoding::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("kx")?;
        let kx = KexType::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("cs")?;
        let cs = CipherSuite::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("eA")?;
        let ea = SigInfo::decode(&mut r)?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self { g2, n5, pe, kx, cs, ea })
    }
}

/// TO2.ProveOpHdr body (signed):
/// `{"sz":…,"oh":…,"hmac":…,"n5":…,"n6":…,"eB":…,"xA":…}`.
#[derive(Debug, Clone)]
pub struct To2ProveOpHdr {
    pub sz: u32,
    pub oh: VoucherHeader,
    pub hmac: HashMac,
    pub n5: Nonce,
    pub n6: Nonce,
    pub eb: SigInfo,
    pub xa: Vec<u8>,
}

/// Verbatim spans from a decoded prove-header, needed for the HMAC
/// check and the chain hashes.
#[derive(Debug, Clone)]
pub struct ProveOpHdrText {
    pub header: HeaderText,
    pub hmac: String,
}

impl To2ProveOpHdr {
    pub const MSG_TYPE: u8 = proto::TO2_PROVE_OP_HDR;

    pub fn encode(&self) -> Result<String, CodecError> {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "sz");
        codec::write_uint(&mut out, self.sz as u64, 32)?;
        out.push(codec::COMMA);
        codec::write_key(&mut out, "oh");
        self.oh.encode(&mut out).map_err(|_| CodecError::OutOfRange)?;
        out.push(codec::COMMA);
        codec::write_key(&mut out, "hmac");
        self.hmac.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "n5");
        self.n5.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "n6");
        self.n6.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "eB");
        self.eb.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "xA");
        write_kex_param(&mut out, &self.xa)?;
        out.push(codec::END_OBJECT);
        Ok(out)
    }

    pub fn decode(text: &str) -> Result<(Self, ProveOpHdrText), CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("sz")?;
        let sz = r.uint32()?;
        r.expect(codec::COMMA)?;
        r.expect_key("oh")?;
        let (oh, header) = VoucherHeader::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("hmac")?;
        let hmac_start = r.position();
        let hmac = HashMac::decode(&mut r)?;
        let hmac_text = r.span(hmac_start, r.position()).to_string();
        r.expect(codec::COMMA)?;
        r.expect_key("n5")?;
        let n5 = Nonce::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("n6")?;
        let n6 = Nonce::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("eB")?;
        let eb = SigInfo::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("xA")?;
        let xa = read_kex_param(&mut r)?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok((
            Self { sz, oh, hmac, n5, n6, eb, xa },
            ProveOpHdrText { header, hmac: hmac_text },
        ))
    }
}

/// TO2.GetOpNextEntry: `{"enn":…}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct To2GetOpNextEntry {
    pub enn: u32,
}

impl To2GetOpNextEntry {
    pub const MSG_TYPE: u8 = proto::TO2_GET_OP_NEXT_ENTRY;

    pub fn encode(&self) -> Result<String, CodecError> {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "enn");
        codec::write_uint(&mut out, self.enn as u64, 32)?;
        out.push(codec::END_OBJECT);
        Ok(out)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("enn")?;
        let enn = r.uint32()?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self { enn })
    }
}

/// TO2.OpNextEntry: `{"enn":…,"eni":…}` where `eni` is the signed
/// voucher entry.
#[derive(Debug, Clone)]
pub struct To2OpNextEntry {
    pub enn: u32,
    pub eni: SignatureBlock,
}

impl To2OpNextEntry {
    pub const MSG_TYPE: u8 = proto::TO2_OP_NEXT_ENTRY;

    pub fn encode(&self, pe: KeyEncoding) -> Result<String, CodecError> {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "enn");
        codec::write_uint(&mut out, self.enn as u64, 32)?;
        out.push(codec::COMMA);
        codec::write_key(&mut out, "eni");
        self.eni.encode(&mut out, pe).map_err(|_| CodecError::OutOfRange)?;
        out.push(codec::END_OBJECT);
        Ok(out)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("enn")?;
        let enn = r.uint32()?;
        r.expect(codec::COMMA)?;
        r.expect_key("eni")?;
        let eni = SignatureBlock::decode(&mut r)?.block;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self { enn, eni })
    }
}

/// TO2.ProveDevice body (signed):
/// `{"ai":…,"n6":…,"n7":…,"g2":…,"nn":…,"xB":…}`.
#[derive(Debug, Clone, PartialEq)]
pub struct To2ProveDevice {
    pub ai: Vec<u8>,
    pub n6: Nonce,
    pub n7: Nonce,
    pub g2: Guid,
    /// How many device service-info messages will follow.
    pub nn: u32,
    pub xb: Vec<u8>,
}

impl To2ProveDevice {
    pub const MSG_TYPE: u8 = proto::TO2_PROVE_DEVICE;

    pub fn encode(&self) -> Result<String, CodecError> {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "ai");
        write_app_id(&mut out, &self.ai)?;
        out.push(codec::COMMA);
        codec::write_key(&mut out, "n6");
        self.n6.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "n7");
        self.n7.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "g2");
        self.g2.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "nn");
        codec::write_uint(&mut out, self.nn as u64, 32)?;
        out.push(codec::COMMA);
        codec::write_key(&mut out, "xB");
        write_kex_param(&mut out, &self.xb)?;
        out.push(codec::END_OBJECT);
        Ok(out)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("ai")?;
        let ai = read_app_id(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("n6")?;
        let n6 = Nonce::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("n7")?;
        let n7 = Nonce::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("g2")?;
        let g2 = Guid::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("nn")?;
        let nn = r.uint32()?;
        r.expect(codec::COMMA)?;
        r.expect_key("xB")?;
        let xb = read_kex_param(&mut r)?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self { ai, n6, n7, g2, nn, xb })
    }
}

/// TO2.GetNextDeviceServiceInfo: `{"nn":…,"psi":…}`.
#[derive(Debug, Clone, PartialEq)]
pub struct To2GetNextDeviceServiceInfo {
    pub nn: u32,
    pub psi: PreServiceInfo,
}

impl To2GetNextDeviceServiceInfo {
    pub const MSG_TYPE: u8 = proto::TO2_GET_NEXT_DEVICE_SERVICE_INFO;

    pub fn encode(&self) -> Result<String, CodecError> {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "nn");
        codec::write_uint(&mut out, self.nn as u64, 32)?;
        out.push(codec::COMMA);
        codec::write_key(&mut out, "psi");
        self.psi.encode(&mut out);
        out.push(codec::END_OBJECT);
        Ok(out)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("nn")?;
        let nn = r.uint32()?;
        r.expect(codec::COMMA)?;
        r.expect_key("psi")?;
        let psi = PreServiceInfo::decode(&mut r)?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self { nn, psi })
    }
}

/// TO2.NextDeviceServiceInfo: `{"nn":…,"dsi":…}`.
#[derive(Debug, Clone, PartialEq)]
pub struct To2NextDeviceServiceInfo {
    pub nn: u32,
    pub dsi: ServiceInfo,
}

impl To2NextDeviceServiceInfo {
    pub const MSG_TYPE: u8 = proto::TO2_NEXT_DEVICE_SERVICE_INFO;

    pub fn encode(&self) -> Result<String, CodecError> {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "nn");
        codec::write_uint(&mut out, self.nn as u64, 32)?;
        out.push(codec::COMMA);
        codec::write_key(&mut out, "dsi");
        self.dsi.encode(&mut out);
        out.push(codec::END_OBJECT);
        Ok(out)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("nn")?;
        let nn = r.uint32()?;
        r.expect(codec::COMMA)?;
        r.expect_key("dsi")?;
        let dsi = ServiceInfo::decode(&mut r)?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self { nn, dsi })
    }
}

/// The signed "new owner header" body of TO2.SetupDevice:
/// `{"r3":…,"g3":…,"n7":…}`.
#[derive(Debug, Clone, PartialEq)]
pub struct To2SetupDeviceNoh {
    pub r3: RendezvousInfo,
    pub g3: Guid,
    pub n7: Nonce,
}

impl To2SetupDeviceNoh {
    pub fn encode(&self) -> Result<String, CodecError> {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "r3");
        self.r3.encode(&mut out)?;
        out.push(codec::COMMA);
        codec::write_key(&mut out, "g3");
        self.g3.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "n7");
        self.n7.encode(&mut out);
        out.push(codec::END_OBJECT);
        Ok(out)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("r3")?;
        let r3 = RendezvousInfo::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("g3")?;
        let g3 = Guid::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("n7")?;
        let n7 = Nonce::decode(&mut r)?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self { r3, g3, n7 })
    }
}

/// TO2.SetupDevice: `{"osinn":…,"noh":…}`.
#[derive(Debug, Clone)]
pub struct To2SetupDevice {
    /// How many owner service-info messages will follow.
    pub osinn: u32,
    pub noh: SignatureBlock,
}

impl To2SetupDevice {
    pub const MSG_TYPE: u8 = proto::TO2_SETUP_DEVICE;

    pub fn encode(&self, pe: KeyEncoding) -> Result<String, CodecError> {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "osinn");
        codec::write_uint(&mut out, self.osinn as u64, 32)?;
        out.push(codec::COMMA);
        codec::write_key(&mut out, "noh");
        self.noh.encode(&mut out, pe).map_err(|_| CodecError::OutOfRange)?;
        out.push(codec::END_OBJECT);
        Ok(out)
    }

    /// Decode, also returning the verbatim text of the `noh.pk` field
    /// for the device's new owner-key digest.
    pub fn decode(text: &str) -> Result<(Self, String), CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("osinn")?;
        let osinn = r.uint32()?;
        r.expect(codec::COMMA)?;
        r.expect_key("noh")?;
        let decoded = SignatureBlock::decode(&mut r)?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok((Self { osinn, noh: decoded.block }, decoded.pk_text))
    }
}

/// TO2.GetNextOwnerServiceInfo: `{"nn":…}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct To2GetNextOwnerServiceInfo {
    pub nn: u32,
}

impl To2GetNextOwnerServiceInfo {
    pub const MSG_TYPE: u8 = proto::TO2_GET_NEXT_OWNER_SERVICE_INFO;

    pub fn encode(&self) -> Result<String, CodecError> {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "nn");
        codec::write_uint(&mut out, self.nn as u64, 32)?;
        out.push(codec::END_OBJECT);
        Ok(out)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("nn")?;
        let nn = r.uint32()?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self { nn })
    }
}

/// TO2.OwnerServiceInfo: `{"nn":…,"sv":…}`.
#[derive(Debug, Clone, PartialEq)]
pub struct To2OwnerServiceInfo {
    pub nn: u32,
    pub sv: ServiceInfo,
}

impl To2OwnerServiceInfo {
    pub const MSG_TYPE: u8 = proto::TO2_OWNER_SERVICE_INFO;

    pub fn encode(&self) -> Result<String, CodecError> {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "nn");
        codec::write_uint(&mut out, self.nn as u64, 32)?;
        out.push(codec::COMMA);
        codec::write_key(&mut out, "sv");
        self.sv.encode(&mut out);
        out.push(codec::END_OBJECT);
        Ok(out)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("nn")?;
        let nn = r.uint32()?;
        r.expect(codec::COMMA)?;
        r.expect_key("sv")?;
        let sv = ServiceInfo::decode(&mut r)?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self { nn, sv })
    }
}

/// TO2.Done: `{"hmac":…,"n6":…}`. The HMAC is over the new voucher
/// header, or the literal reuse placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct To2Done {
    pub hmac: HashMac,
    pub n6: Nonce,
}

impl To2Done {
    pub const MSG_TYPE: u8 = proto::TO2_DONE;

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "hmac");
        self.hmac.encode(&mut out);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "n6");
        self.n6.encode(&mut out);
        out.push(codec::END_OBJECT);
        out
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("hmac")?;
        let hmac = HashMac::decode(&mut r)?;
        r.expect(codec::COMMA)?;
        r.expect_key("n6")?;
        let n6 = Nonce::decode(&mut r)?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self { hmac, n6 })
    }
}

/// TO2.Done2: `{"n7":…}`.
#[derive(Debug, Clone, PartialEq)]
pub struct To2Done2 {
    pub n7: Nonce,
}

impl To2Done2 {
    pub const MSG_TYPE: u8 = proto::TO2_DONE_2;

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "n7");
        self.n7.encode(&mut out);
        out.push(codec::END_OBJECT);
        out
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("n7")?;
        let n7 = Nonce::decode(&mut r)?;
        r.expect(codec::END_OBJECT)?;
        finish(r)?;
        Ok(Self { n7 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CipherAlgorithm, CipherMode};
    use crate::keys::{KeyKind, KeyPair};
    use crate::rendezvous::{RendezvousInstr, RvProtocol};
    use crate::types::{DigestKind, MacKind};

    #[test]
    fn hello_device_round_trip() {
        let msg = To2HelloDevice {
            g2: Guid::generate(),
            n5: Nonce::generate(),
            pe: KeyEncoding::X509,
            kx: KexType::EcdhP256,
            cs: CipherSuite::new(CipherAlgorithm::Aes128, CipherMode::Ctr, MacKind::HmacSha256),
            ea: SigInfo::for_key(KeyKind::EcdsaP256),
        };
        let text = msg.encode();
        assert_eq!(To2HelloDevice::decode(&text).unwrap(), msg);
    }

    #[test]
    fn prove_op_hdr_spans_match_wire_text() {
        let keys = KeyPair::generate_p256();
        let oh = VoucherHeader {
            pe: KeyEncoding::X509,
            r: RendezvousInfo::single(RendezvousInstr::with_host("rv", 80, RvProtocol::Http)),
            g: Guid::generate(),
            d: "dev".to_string(),
            pk: keys.public_key(),
            hdc: None,
        };
        let msg = To2ProveOpHdr {
            sz: 0,
            oh: oh.clone(),
            hmac: MacKind::HmacSha256.mac_of(b"secret", &[b"header"]),
            n5: Nonce::generate(),
            n6: Nonce::generate(),
            eb: SigInfo::for_key(KeyKind::EcdsaP256),
            xa: vec![1, 2, 3],
        };
        let text = msg.encode().unwrap();
        let (decoded, spans) = To2ProveOpHdr::decode(&text).unwrap();
        assert_eq!(decoded.sz, 0);
        assert_eq!(decoded.oh, oh);
        // spans are verbatim cutouts of the transmitted text
        assert!(text.contains(&spans.header.oh));
        assert!(text.contains(&spans.hmac));
        assert_eq!(spans.header.oh, oh.texts().unwrap().oh);
    }

    #[test]
    fn prove_device_round_trip() {
        let msg = To2ProveDevice {
            ai: vec![],
            n6: Nonce::generate(),
            n7: Nonce::generate(),
            g2: Guid::generate(),
            nn: 2,
            xb: vec![9; 40],
        };
        let text = msg.encode().unwrap();
        assert_eq!(To2ProveDevice::decode(&text).unwrap(), msg);
    }

    #[test]
    fn setup_device_captures_pk_text() {
        let keys = KeyPair::generate_p256();
        let noh_body = To2SetupDeviceNoh {
            r3: RendezvousInfo::single(RendezvousInstr::with_host("rv", 80, RvProtocol::Http)),
            g3: Guid::generate(),
            n7: Nonce::generate(),
        }
        .encode()
        .unwrap();
        let noh = SignatureBlock::sign(noh_body, keys.public_key(), &keys).unwrap();
        let msg = To2SetupDevice { osinn: 1, noh };
        let text = msg.encode(KeyEncoding::X509).unwrap();
        let (decoded, pk_text) = To2SetupDevice::decode(&text).unwrap();
        assert!(decoded.noh.verify());
        assert!(text.contains(&pk_text));
        assert!(pk_text.starts_with('['));
    }

    #[test]
    fn done_round_trip_with_reuse_placeholder() {
        let msg = To2Done { hmac: HashMac::reuse_placeholder(), n6: Nonce::generate() };
        let text = msg.encode();
        let decoded = To2Done::decode(&text).unwrap();
        assert!(decoded.hmac.is_reuse_placeholder());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn redirect_round_trip() {
        let msg = To1SdoRedirect {
            i1: None,
            dns1: Some("owner.example".to_string()),
            port1: 8042,
            to0dh: DigestKind::Sha256.digest_of(&[b"to0d"]),
        };
        let text = msg.encode().unwrap();
        assert_eq!(To1SdoRedirect::decode(&text).unwrap(), msg);
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let msg = To2GetOpNextEntry { enn: 3 };
        let mut text = msg.encode().unwrap();
        text.push('x');
        assert!(To2GetOpNextEntry::decode(&text).is_err());
    }
}
