//! The owner-registration client.
//!
//! Before any device can find its owner, the owner registers with the
//! rendezvous service: it signs its voucher together with a redirect
//! record naming where devices should come, and the rendezvous service
//! answers with how long it will keep the registration. Registration is
//! retried under an injectable predicate; by default three attempts.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::kdf::CryptoLevel;
use crate::keys::SignatureBlock;
use crate::messages::*;
use crate::owner::KeysProvider;
use crate::rendezvous::Only;
use crate::result::{ClientError, ErrorCode, ProtocolError};
use crate::transport::Transport;
use crate::voucher::OwnershipVoucher;

/// Where registered devices are redirected to.
#[derive(Debug, Clone)]
pub struct OwnerLocation {
    pub i1: Option<IpAddr>,
    pub dns1: Option<String>,
    pub port1: u16,
}

/// Registers one voucher's owner with the rendezvous service.
pub struct OwnerRegistration {
    pub voucher: OwnershipVoucher,
    pub keys: Box<KeysProvider>,
    pub location: OwnerLocation,
    /// Seconds of registration lifetime to request.
    pub wait_seconds: u32,
    /// Validates the device certificate chain the first time the owner
    /// runs; `None` skips the check.
    pub cert_validator: Option<Box<dyn Fn(&[Vec<u8>]) -> bool + Send + Sync>>,
    /// Retry predicate over (voucher, attempt count, 0 = first try).
    pub keep_trying: Box<dyn Fn(&OwnershipVoucher, u32) -> bool + Send + Sync>,
    transport: Arc<dyn Transport>,
}

impl OwnerRegistration {
    pub fn new(
        voucher: OwnershipVoucher,
        keys: Box<KeysProvider>,
        location: OwnerLocation,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            voucher,
            keys,
            location,
            wait_seconds: 3600,
            cert_validator: None,
            keep_trying: Box::new(|_, count| count < 3),
            transport,
        }
    }

    /// Register with the first reachable rendezvous URI; returns the
    /// granted registration lifetime.
    pub fn run(&self) -> Result<Duration, ClientError> {
        // the owner validates any device certificate path, and this is
        // the first time the owner runs, so it happens here
        if let (Some(validator), Some(dc)) = (&self.cert_validator, &self.voucher.dc) {
            if !validator(dc) {
                return Err(ClientError::Protocol(ProtocolError::new(
                    ErrorCode::InvalidVoucher,
                    To0OwnerSign::MSG_TYPE,
                    "device certificate path is invalid",
                )));
            }
        }

        let mut attempts = 0u32;
        let mut last_error = ClientError::Exhausted;
        while (self.keep_trying)(&self.voucher, attempts) {
            for instr in self.voucher.oh.r.iter() {
                for uri in instr.to_uris(Only::Owner) {
                    match self.register(&uri) {
                        Ok(granted) => {
                            log::info!(
                                "registered with {} for {}s",
                                uri,
                                granted.as_secs()
                            );
                            return Ok(granted);
                        }
                        Err(e) => {
                            log::warn!("registration with {} failed: {}", uri, e);
                            last_error = e;
                        }
                    }
                }
                if let Some(delay) = instr.delay() {
                    std::thread::sleep(delay);
                }
            }
            attempts += 1;
        }
        Err(last_error)
    }

    // One registration exchange against one rendezvous URI.
    fn register(&self, base: &str) -> Result<Duration, ClientError> {
        let hello = To0Hello;
        let response = self.transport.post(base, To0Hello::MSG_TYPE, None, &hello.encode())?;
        let token = response.token.clone();
        let ack = To0HelloAck::decode(&response.body)?;

        let mut voucher_text = String::new();
        self.voucher.encode(&mut voucher_text).map_err(|e| {
            ClientError::Protocol(ProtocolError::internal(To0OwnerSign::MSG_TYPE, e.to_string()))
        })?;
        let to0d =
            To0OwnerSignBody { voucher_text, ws: self.wait_seconds, n3: ack.n3 }.encode()?;

        // the redirect binds to the owner-sign body by digest
        let level = CryptoLevel::from_key_kind(self.voucher.oh.pk.kind()).ok_or_else(|| {
            ClientError::Protocol(ProtocolError::new(
                ErrorCode::InvalidVoucher,
                To0OwnerSign::MSG_TYPE,
                "unsupported voucher key type",
            ))
        })?;
        let to0dh = level.digest_kind().digest_of(&[to0d.as_bytes()]);

        let redirect = To1SdoRedirect {
            i1: self.location.i1,
            dns1: self.location.dns1.clone(),
            port1: self.location.port1,
            to0dh,
        }
        .encode()?;

        let current_owner = self.voucher.current_owner_key().map_err(|e| {
            ClientError::Protocol(ProtocolError::new(
                ErrorCode::InvalidVoucher,
                To0OwnerSign::MSG_TYPE,
                e.to_string(),
            ))
        })?;
        let keys = (self.keys)(self.voucher.oh.pk.kind()).ok_or_else(|| {
            ClientError::Protocol(ProtocolError::refused(
                To0OwnerSign::MSG_TYPE,
                "no owner key for voucher key type",
            ))
        })?;
        let to1d = SignatureBlock::sign(redirect, current_owner, &keys).map_err(|e| {
            ClientError::Protocol(ProtocolError::internal(To0OwnerSign::MSG_TYPE, e.to_string()))
        })?;

        let body = To0OwnerSign { to0d_text: to0d, to1d }.encode(self.voucher.oh.pe)?;
        let response =
            self.transport.post(base, To0OwnerSign::MSG_TYPE, token.as_deref(), &body)?;
        let accept = To0AcceptOwner::decode(&response.body)?;
        Ok(Duration::from_secs(accept.ws as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyEncoding, KeyKind, KeyPair};
    use crate::rendezvous::{RendezvousInfo, RendezvousInstr, RvProtocol};
    use crate::transport::TransportResponse;
    use crate::types::{Guid, MacKind, Nonce};
    use crate::voucher::VoucherHeader;
    use std::sync::Mutex;

    struct ScriptedRendezvous {
        accepted: Mutex<Vec<String>>,
    }

    impl Transport for ScriptedRendezvous {
        fn post(
            &self,
            _base: &str,
            msg_type: u8,
            _token: Option<&str>,
            body: &str,
        ) -> Result<TransportResponse, ClientError> {
            match msg_type {
                To0Hello::MSG_TYPE => Ok(TransportResponse {
                    body: To0HelloAck { n3: Nonce::generate() }.encode(),
                    token: Some("Bearer test".to_string()),
                }),
                To0OwnerSign::MSG_TYPE => {
                    self.accepted.lock().unwrap().push(body.to_string());
                    Ok(TransportResponse {
                        body: To0AcceptOwner { ws: 1800 }.encode().unwrap(),
                        token: None,
                    })
                }
                other => panic!("unexpected message type {}", other),
            }
        }
    }

    fn test_voucher(keys: &KeyPair) -> OwnershipVoucher {
        let oh = VoucherHeader {
            pe: KeyEncoding::X509,
            r: RendezvousInfo::single(RendezvousInstr::with_host("rv", 8040, RvProtocol::Http)),
            g: Guid::generate(),
            d: "widget".to_string(),
            pk: keys.public_key(),
            hdc: None,
        };
        let texts = oh.texts().unwrap();
        let hmac = MacKind::HmacSha256.mac_of(b"secret", &[texts.oh.as_bytes()]);
        OwnershipVoucher::new(oh, hmac)
    }

    #[test]
    fn registration_round_trip() {
        let keys = KeyPair::generate_p256();
        let voucher = test_voucher(&keys);
        let transport = Arc::new(ScriptedRendezvous { accepted: Mutex::new(Vec::new()) });
        let signing = match &keys {
            KeyPair::EcP256(k) => k.clone(),
            _ => unreachable!(),
        };
        let reg = OwnerRegistration::new(
            voucher,
            Box::new(move |kind| {
                (kind == KeyKind::EcdsaP256).then(|| KeyPair::EcP256(signing.clone()))
            }),
            OwnerLocation { i1: None, dns1: Some("owner.example".to_string()), port1: 8042 },
            transport.clone(),
        );
        let granted = reg.run().unwrap();
        assert_eq!(granted, Duration::from_secs(1800));

        // the accepted owner-sign carries a redirect signed by the owner
        let accepted = transport.accepted.lock().unwrap();
        let body = &accepted[0];
        let to1d_at = body.find("\"to1d\":").unwrap() + 7;
        let signed = SignatureBlock::decode_str(&body[to1d_at..body.len() - 1]).unwrap().block;
        assert!(signed.verify());
        let redirect = To1SdoRedirect::decode(&signed.bo).unwrap();
        assert_eq!(redirect.dns1.as_deref(), Some("owner.example"));
        assert_eq!(redirect.port1, 8042);
    }

    #[test]
    fn default_retry_stops_after_three_rounds() {
        struct AlwaysDown;
        impl Transport for AlwaysDown {
            fn post(
                &self,
                _base: &str,
                _msg_type: u8,
                _token: Option<&str>,
                _body: &str,
            ) -> Result<TransportResponse, ClientError> {
                Err(ClientError::Io("connection refused".to_string()))
            }
        }
        let keys = KeyPair::generate_p256();
        let voucher = test_voucher(&keys);
        let reg = OwnerRegistration::new(
            voucher,
            Box::new(|_| None),
            OwnerLocation { i1: None, dns1: Some("owner.example".to_string()), port1: 0 },
            Arc::new(AlwaysDown),
        );
        assert!(matches!(reg.run().unwrap_err(), ClientError::Io(_)));
    }
}
