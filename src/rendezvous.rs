//! Rendezvous instructions.
//!
//! A voucher and a device credential each carry a list of instructions
//! telling the device (and the owner's registration client) where to
//! find the rendezvous service: host or address, per-role ports,
//! protocol, and an optional inter-round delay. One instruction can
//! expand to several candidate URIs.

use std::net::IpAddr;
use std::time::Duration;

use crate::codec::{self, CodecError, Reader};

/// Restricts an instruction to one side of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Only {
    Device,
    Owner,
}

impl Only {
    fn name(self) -> &'static str {
        match self {
            Self::Device => "dev",
            Self::Owner => "owner",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "dev" => Self::Device,
            "owner" => Self::Owner,
            _ => return None,
        })
    }
}

/// Transport protocol selector; `rest` admits both schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RvProtocol {
    Rest,
    Http,
    Https,
}

impl RvProtocol {
    fn name(self) -> &'static str {
        match self {
            Self::Rest => "rest",
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "rest" => Self::Rest,
            "http" => Self::Http,
            "https" => Self::Https,
            _ => return None,
        })
    }

    fn schemes(self) -> &'static [&'static str] {
        match self {
            Self::Rest => &["https", "http"],
            Self::Http => &["http"],
            Self::Https => &["https"],
        }
    }
}

/// One rendezvous instruction.
///
/// Wire form `[nkeys,{…}]` with keys in fixed order: `delaysec`, `dn`,
/// `ip`, `only`, `po`, `pow`, `pr`; absent fields are omitted and the
/// key count prefixes the object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RendezvousInstr {
    pub delay_sec: Option<u32>,
    pub dn: Option<String>,
    pub ip: Option<IpAddr>,
    pub only: Option<Only>,
    /// Port the device should use.
    pub po: Option<u16>,
    /// Port the owner should use.
    pub pow: Option<u16>,
    pub pr: Option<RvProtocol>,
}

impl RendezvousInstr {
    /// A plain device+owner instruction for one host and port.
    pub fn with_host(dn: &str, port: u16, pr: RvProtocol) -> Self {
        Self {
            dn: Some(dn.to_string()),
            po: Some(port),
            pow: Some(port),
            pr: Some(pr),
            ..Self::default()
        }
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay_sec.map(|s| Duration::from_secs(s as u64))
    }

    /// The URIs this instruction expands to for the given side.
    ///
    /// Metadata-only instructions (no host and no address) expand to
    /// nothing; they exist for their delay.
    pub fn to_uris(&self, only_for: Only) -> Vec<String> {
        let host = if let Some(dn) = self.dn.as_ref().filter(|d| !d.is_empty()) {
            dn.clone()
        } else if let Some(ip) = self.ip {
            ip.to_string()
        } else {
            return Vec::new();
        };

        let mut uris = Vec::new();
        for scheme in self.pr.unwrap_or(RvProtocol::Rest).schemes() {
            if only_for != Only::Owner && self.only != Some(Only::Owner) {
                uris.push(build_uri(scheme, &host, self.po));
            }
            if only_for != Only::Device && self.only != Some(Only::Device) {
                uris.push(build_uri(scheme, &host, self.pow));
            }
        }
        uris
    }

    pub fn encode(&self, out: &mut String) -> Result<(), CodecError> {
        let mut body = String::new();
        let mut nkeys = 0u8;
        let mut sep = |body: &mut String, n: &mut u8| {
            if *n > 0 {
                body.push(codec::COMMA);
            }
            *n += 1;
        };
        if let Some(delay) = self.delay_sec {
            sep(&mut body, &mut nkeys);
            codec::write_key(&mut body, "delaysec");
            codec::write_uint(&mut body, delay as u64, 32)?;
        }
        if let Some(dn) = &self.dn {
            sep(&mut body, &mut nkeys);
            codec::write_key(&mut body, "dn");
            codec::write_string(&mut body, dn);
        }
        if let Some(ip) = &self.ip {
            sep(&mut body, &mut nkeys);
            codec::write_key(&mut body, "ip");
            let octets = match ip {
                IpAddr::V4(v4) => v4.octets().to_vec(),
                IpAddr::V6(v6) => v6.octets().to_vec(),
            };
            body.push(codec::BEGIN_ARRAY);
            codec::write_uint(&mut body, octets.len() as u64, 8)?;
            body.push(codec::COMMA);
            codec::write_bytes(&mut body, &octets);
            body.push(codec::END_ARRAY);
        }
        if let Some(only) = self.only {
            sep(&mut body, &mut nkeys);
            codec::write_key(&mut body, "only");
            codec::write_string(&mut body, only.name());
        }
        if self.only != Some(Only::Owner) {
            if let Some(po) = self.po {
                sep(&mut body, &mut nkeys);
                codec::write_key(&mut body, "po");
                codec::write_uint(&mut body, po as u64, 16)?;
            }
        }
        if self.only != Some(Only::Device) {
            if let Some(pow) = self.pow {
                sep(&mut body, &mut nkeys);
                codec::write_key(&mut body, "pow");
                codec::write_uint(&mut body, pow as u64, 16)?;
            }
        }
        if let Some(pr) = self.pr {
            sep(&mut body, &mut nkeys);
            codec::write_key(&mut body, "pr");
            codec::write_string(&mut body, pr.name());
        }

        out.push(codec::BEGIN_ARRAY);
        codec::write_uint(out, nkeys as u64, 8)?;
        out.push(codec::COMMA);
        out.push(codec::BEGIN_OBJECT);
        out.push_str(&body);
        out.push(codec::END_OBJECT);
        out.push(codec::END_ARRAY);
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        r.expect(codec::BEGIN_ARRAY)?;
        let nkeys = r.uint8()?;
        r.expect(codec::COMMA)?;
        r.expect(codec::BEGIN_OBJECT)?;
        let mut instr = Self::default();
        for i in 0..nkeys {
            if i > 0 {
                r.expect(codec::COMMA)?;
            }
            let at = r.position();
            let key = r.string()?;
            r.expect(codec::COLON)?;
            match key.as_str() {
                "delaysec" => instr.delay_sec = Some(r.uint32()?),
                "dn" => instr.dn = Some(r.string()?),
                "ip" => {
                    r.expect(codec::BEGIN_ARRAY)?;
                    let len = r.uint8()? as usize;
                    r.expect(codec::COMMA)?;
                    let octets = r.bytes()?;
                    r.expect(codec::END_ARRAY)?;
                    if octets.len() != len {
                        return Err(CodecError::LengthMismatch);
                    }
                    instr.ip = Some(match octets.len() {
                        4 => IpAddr::from(<[u8; 4]>::try_from(octets.as_slice()).unwrap()),
                        16 => IpAddr::from(<[u8; 16]>::try_from(octets.as_slice()).unwrap()),
                        _ => return Err(CodecError::LengthMismatch),
                    });
                }
                "only" => {
                    let name = r.string()?;
                    instr.only = Some(Only::from_name(&name).ok_or(CodecError::Unexpected(at))?);
                }
                "po" => instr.po = Some(r.uint16()?),
                "pow" => instr.pow = Some(r.uint16()?),
                "pr" => {
                    let name = r.string()?;
                    instr.pr =
                        Some(RvProtocol::from_name(&name).ok_or(CodecError::Unexpected(at))?);
                }
                _ => return Err(CodecError::Unexpected(at)),
            }
        }
        r.expect(codec::END_OBJECT)?;
        r.expect(codec::END_ARRAY)?;
        Ok(instr)
    }
}

fn build_uri(scheme: &str, host: &str, port: Option<u16>) -> String {
    match port {
        Some(p) if p != 0 => format!("{}://{}:{}", scheme, host, p),
        _ => format!("{}://{}", scheme, host),
    }
}

/// The ordered instruction list; wire form `[n,instr,…]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RendezvousInfo(pub Vec<RendezvousInstr>);

impl RendezvousInfo {
    pub fn single(instr: RendezvousInstr) -> Self {
        Self(vec![instr])
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RendezvousInstr> {
        self.0.iter()
    }

    pub fn encode(&self, out: &mut String) -> Result<(), CodecError> {
        out.push(codec::BEGIN_ARRAY);
        codec::write_uint(out, self.0.len() as u64, 8)?;
        for instr in &self.0 {
            out.push(codec::COMMA);
            instr.encode(out)?;
        }
        out.push(codec::END_ARRAY);
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        r.expect(codec::BEGIN_ARRAY)?;
        let n = r.uint8()?;
        let mut instrs = Vec::with_capacity(n as usize);
        for _ in 0..n {
            r.expect(codec::COMMA)?;
            instrs.push(RendezvousInstr::decode(r)?);
        }
        r.expect(codec::END_ARRAY)?;
        Ok(Self(instrs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instr_round_trip() {
        let instr = RendezvousInstr {
            delay_sec: Some(30),
            dn: Some("rv.example.org".to_string()),
            ip: Some("10.0.0.7".parse().unwrap()),
            only: None,
            po: Some(8040),
            pow: Some(8041),
            pr: Some(RvProtocol::Http),
        };
        let mut out = String::new();
        instr.encode(&mut out).unwrap();
        let mut r = Reader::new(&out);
        assert_eq!(RendezvousInstr::decode(&mut r).unwrap(), instr);
    }

    #[test]
    fn info_round_trip() {
        let info = RendezvousInfo(vec![
            RendezvousInstr::with_host("a.example", 80, RvProtocol::Http),
            RendezvousInstr { delay_sec: Some(10), ..Default::default() },
        ]);
        let mut out = String::new();
        info.encode(&mut out).unwrap();
        let mut r = Reader::new(&out);
        assert_eq!(RendezvousInfo::decode(&mut r).unwrap(), info);
    }

    #[test]
    fn uris_respect_roles_and_ports() {
        let instr = RendezvousInstr {
            dn: Some("rv.example".to_string()),
            po: Some(8040),
            pow: Some(8041),
            pr: Some(RvProtocol::Http),
            ..Default::default()
        };
        assert_eq!(
            instr.to_uris(Only::Device),
            vec!["http://rv.example:8040".to_string()]
        );
        assert_eq!(
            instr.to_uris(Only::Owner),
            vec!["http://rv.example:8041".to_string()]
        );
    }

    #[test]
    fn rest_expands_to_both_schemes() {
        let instr = RendezvousInstr::with_host("rv.example", 0, RvProtocol::Rest);
        let uris = instr.to_uris(Only::Device);
        assert_eq!(uris, vec!["https://rv.example".to_string(), "http://rv.example".to_string()]);
    }

    #[test]
    fn delay_only_instruction_has_no_uris() {
        let instr = RendezvousInstr { delay_sec: Some(45), ..Default::default() };
        assert!(instr.to_uris(Only::Device).is_empty());
        assert_eq!(instr.delay(), Some(Duration::from_secs(45)));
    }
}
