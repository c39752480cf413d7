//! Service-info: ordered key/value provisioning data.
//!
//! Devices and owners exchange provisioning data as ordered key/value
//! entries, packed into messages no larger than a negotiated MTU. Values
//! can be split across messages; entries keep their order. Sources
//! produce entries, sinks consume them; both sides count their outgoing
//! messages ahead of time because the protocol declares the count before
//! the loop starts.

use crate::codec::{self, CodecError, Reader};
use crate::proto::SERVICE_INFO_MTU;
use crate::types::Guid;

/// One message's worth of service-info entries; wire form
/// `{"key":"value",…}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInfo(pub Vec<(String, String)>);

impl ServiceInfo {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (String, String)> {
        self.0.iter()
    }

    pub fn encode(&self, out: &mut String) {
        out.push(codec::BEGIN_OBJECT);
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(codec::COMMA);
            }
            codec::write_string(out, key);
            out.push(codec::COLON);
            codec::write_string(out, value);
        }
        out.push(codec::END_OBJECT);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        r.expect(codec::BEGIN_OBJECT)?;
        let mut entries = Vec::new();
        loop {
            if r.consume_matching("}") {
                return Ok(Self(entries));
            }
            if !entries.is_empty() {
                r.expect(codec::COMMA)?;
            }
            let key = r.string()?;
            r.expect(codec::COLON)?;
            let value = r.string()?;
            entries.push((key, value));
        }
    }
}

/// Pre-service-info: a compact key/value payload sent before the device
/// service-info loop; wire form is one string `"k~v,k~v"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreServiceInfo(pub Vec<(String, String)>);

impl PreServiceInfo {
    pub fn encode(&self, out: &mut String) {
        let mut s = String::new();
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                s.push(',');
            }
            s.push_str(key);
            s.push('~');
            s.push_str(value);
        }
        codec::write_string(out, &s);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let s = r.string()?;
        let mut entries = Vec::new();
        for part in s.split(',') {
            if let Some((key, value)) = part.split_once('~') {
                entries.push((key.to_string(), value.to_string()));
            }
        }
        Ok(Self(entries))
    }
}

/// Supplies device-side service-info entries.
pub trait ServiceInfoSource: Send + Sync {
    fn service_info(&self) -> Vec<(String, String)>;
}

/// Supplies owner-side service-info entries for one device.
pub trait ServiceInfoMultiSource: Send + Sync {
    fn service_info(&self, guid: &Guid) -> Vec<(String, String)>;
}

/// Consumes service-info entries on the device side.
pub trait ServiceInfoSink: Send + Sync {
    fn put_service_info(&self, key: &str, value: &str);
}

/// Consumes device service-info entries on the owner side.
pub trait ServiceInfoMultiSink: Send + Sync {
    fn put_service_info(&self, guid: &Guid, key: &str, value: &str);
}

/// Supplies pre-service-info for one device.
pub trait PreServiceInfoMultiSource: Send + Sync {
    fn pre_service_info(&self, guid: &Guid) -> Vec<(String, String)>;
}

/// Packs a flat entry list into MTU-bound `ServiceInfo` messages.
///
/// Values are sized as if base64-expanded, which over-estimates plain
/// text but never under-estimates; a value that does not fit in one
/// message is continued under the same key in the next.
pub struct ServiceInfoMarshaller {
    mtu: usize,
}

impl Default for ServiceInfoMarshaller {
    fn default() -> Self {
        Self { mtu: SERVICE_INFO_MTU }
    }
}

impl ServiceInfoMarshaller {
    pub fn with_mtu(mtu: usize) -> Self {
        Self { mtu }
    }

    /// Pack `entries` into messages. The returned length is the message
    /// count the protocol declares before serving them one at a time.
    pub fn marshal(&self, entries: &[(String, String)]) -> Vec<ServiceInfo> {
        let mtu = self.mtu;
        let mut messages = Vec::new();
        let mut index = 0usize;
        let mut value_offset = 0usize;

        while index < entries.len() {
            let mut packed = 2usize; // '{' '}'
            let mut current = Vec::new();

            while packed < mtu && index < entries.len() {
                if !current.is_empty() {
                    packed += 1; // ','
                }
                packed += 5; // quotes and colon around key and value
                let (key, value) = &entries[index];
                packed += key.len();

                // find how much of the base64-expanded value fits
                let remaining = value.len() - value_offset;
                let mut fit = 0usize;
                if remaining > 0 {
                    loop {
                        let encoded = ((fit + 1 + 2) / 3) * 4;
                        if packed + encoded > mtu {
                            break;
                        }
                        fit += 1;
                        if fit == remaining {
                            break;
                        }
                    }
                    packed += ((fit + 2) / 3) * 4;
                }

                if fit == 0 && remaining > 0 {
                    break; // nothing fits, start the next message
                }

                let end = value_offset + fit;
                if fit == remaining {
                    let chunk = if value_offset == 0 {
                        value.clone()
                    } else {
                        value[value_offset..end].to_string()
                    };
                    current.push((key.clone(), chunk));
                    value_offset = 0;
                    index += 1;
                } else {
                    current.push((key.clone(), value[value_offset..end].to_string()));
                    value_offset = end;
                }
            }

            if current.is_empty() {
                // an MTU too small for even one byte of payload;
                // emit nothing rather than loop forever
                break;
            }
            messages.push(ServiceInfo(current));
        }
        messages
    }
}
