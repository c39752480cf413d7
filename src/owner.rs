//! The owner-side ownership-transfer responder.
//!
//! One `OwnerSession` runs one device's transfer. It accepts one
//! message at a time and answers with the next protocol message;
//! ordering is enforced by the state the session is in, and any
//! validation failure ends the session for good. Messages after
//! prove-device travel inside the authenticated encrypted envelope.
//!
//! Shared collaborators (voucher storage, signing keys, service-info
//! modules, the group-signature verifier) live in an `OwnerContext`
//! that many sessions can share; a session itself is single-threaded.

use std::sync::Arc;

use crate::cipher::{CipherSuite, SessionCipher};
use crate::envelope::{Envelope, EnvelopeError};
use crate::epid::{EpidVerifier, EpidVersion};
use crate::kdf::{derive_sek, derive_svk, CryptoLevel};
use crate::kex::{KexError, KexType, KeyExchange, Role};
use crate::keys::{KeyKind, KeyPair, PublicKey, SignatureBlock};
use crate::messages::*;
use crate::proto;
use crate::rendezvous::RendezvousInfo;
use crate::result::{ErrorCode, ProtocolError};
use crate::serviceinfo::{
    PreServiceInfo, PreServiceInfoMultiSource, ServiceInfo, ServiceInfoMarshaller,
    ServiceInfoMultiSink, ServiceInfoMultiSource,
};
use crate::storage::ObjectStorage;
use crate::types::{Guid, Nonce};
use crate::voucher::{OwnershipVoucher, VoucherHeader};

/// Provider of owner signing keys by key type.
pub type KeysProvider = dyn Fn(KeyKind) -> Option<KeyPair> + Send + Sync;

/// Long-lived owner-side collaborators, shared across sessions.
pub struct OwnerContext {
    pub voucher_storage: Arc<dyn ObjectStorage<Guid, OwnershipVoucher>>,
    pub keys: Box<KeysProvider>,
    /// Chooses the replacement GUID; `None` keeps the current one.
    pub g3: Box<dyn Fn(&OwnershipVoucher) -> Option<Guid> + Send + Sync>,
    /// Chooses the replacement rendezvous info; `None` keeps the
    /// current one.
    pub r3: Box<dyn Fn(&OwnershipVoucher) -> Option<RendezvousInfo> + Send + Sync>,
    pub service_info_sources: Vec<Box<dyn ServiceInfoMultiSource>>,
    pub service_info_sinks: Vec<Box<dyn ServiceInfoMultiSink>>,
    pub pre_service_info_sources: Vec<Box<dyn PreServiceInfoMultiSource>>,
    pub epid: Option<Box<dyn EpidVerifier>>,
    /// Receives device-reported `Error` messages; they terminate the
    /// session but are not raised as local failures.
    pub device_error_handler: Box<dyn Fn(Option<Guid>, &ProtocolError) + Send + Sync>,
    pub service_info_mtu: usize,
}

impl OwnerContext {
    pub fn new(
        voucher_storage: Arc<dyn ObjectStorage<Guid, OwnershipVoucher>>,
        keys: Box<KeysProvider>,
    ) -> Self {
        Self {
            voucher_storage,
            keys,
            g3: Box::new(|_| None),
            r3: Box::new(|_| None),
            service_info_sources: Vec::new(),
            service_info_sinks: Vec::new(),
            pre_service_info_sources: Vec::new(),
            epid: None,
            device_error_handler: Box::new(|guid, error| {
                log::error!("device reported error for {:?}: {}", guid, error);
            }),
            service_info_mtu: proto::SERVICE_INFO_MTU,
        }
    }
}

/// An outgoing protocol message.
#[derive(Debug, Clone)]
pub struct Reply {
    pub msg_type: u8,
    pub body: String,
}

// Post-handshake cipher state, one per session.
struct Crypt {
    cipher: SessionCipher,
    envelope: Envelope,
}

impl Crypt {
    fn seal(&mut self, msg_type: u8, plain: String) -> Result<Reply, ProtocolError> {
        log::debug!("pre-encipher: {}", plain);
        let body = self
            .envelope
            .seal(&mut self.cipher, &plain)
            .map_err(|e| ProtocolError::internal(msg_type, e.to_string()))?;
        Ok(Reply { msg_type, body })
    }

    fn open(&self, msg_type: u8, body: &str) -> Result<String, ProtocolError> {
        match self.envelope.open(&self.cipher, body) {
            Ok(plain) => {
                log::debug!("post-decipher: {}", plain);
                Ok(plain)
            }
            Err(EnvelopeError::HmacVerification) => {
                Err(ProtocolError::refused(msg_type, "message HMAC verification failed"))
            }
            Err(EnvelopeError::Parse(e)) => Err(ProtocolError::syntax(msg_type, e.to_string())),
            Err(e) => Err(ProtocolError::internal(msg_type, e.to_string())),
        }
    }
}

// Session state, with the fields each phase actually has.
enum State {
    AwaitHello,
    /// Header sent; serving voucher entries until prove-device.
    ServingHeader {
        voucher: OwnershipVoucher,
        kex: KeyExchange,
        suite: CipherSuite,
        n6: Nonce,
    },
    /// Collecting device service-info messages.
    DeviceInfoLoop {
        voucher: OwnershipVoucher,
        crypt: Crypt,
        n6: Nonce,
        n7: Nonce,
        nn: u32,
    },
    /// Serving owner service-info; ends with done.
    OwnerInfoLoop {
        voucher: OwnershipVoucher,
        crypt: Crypt,
        n6: Nonce,
        n7: Nonce,
        g3: Guid,
        r3: RendezvousInfo,
        infos: Vec<ServiceInfo>,
        served: usize,
    },
    Done,
}

/// One device's transfer session on the owner side.
pub struct OwnerSession {
    ctx: Arc<OwnerContext>,
    state: State,
}

impl OwnerSession {
    pub fn new(ctx: Arc<OwnerContext>) -> Self {
        Self { ctx, state: State::AwaitHello }
    }

    /// Whether a message opens a session.
    pub fn is_hello(version: u32, msg_type: u8) -> bool {
        version == proto::PROTOCOL_VERSION && msg_type == proto::TO2_HELLO_DEVICE
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Feed one message; produce the next one.
    ///
    /// `Ok(None)` means the peer reported an error and the session is
    /// over with nothing to send. Any `Err` also ends the session; the
    /// host encodes it as the wire error body.
    pub fn next(
        &mut self,
        version: u32,
        msg_type: u8,
        body: &str,
    ) -> Result<Option<Reply>, ProtocolError> {
        if self.is_done() {
            return Err(ProtocolError::refused(msg_type, "session is finished"));
        }
        if version != proto::PROTOCOL_VERSION {
            self.state = State::Done;
            return Err(ProtocolError::refused(msg_type, format!("invalid version {}", version)));
        }

        // Any error path leaves the session finished; only a successful
        // transition writes a live state back.
        let state = std::mem::replace(&mut self.state, State::Done);
        let (state, reply) = self.dispatch(state, msg_type, body)?;
        self.state = state;
        Ok(reply)
    }

    fn dispatch(
        &self,
        state: State,
        msg_type: u8,
        body: &str,
    ) -> Result<(State, Option<Reply>), ProtocolError> {
        if msg_type == proto::MSG_ERROR {
            let error = ProtocolError::decode(body)
                .map_err(|e| ProtocolError::syntax(msg_type, e.to_string()))?;
            let guid = match &state {
                State::ServingHeader { voucher, .. }
                | State::DeviceInfoLoop { voucher, .. }
                | State::OwnerInfoLoop { voucher, .. } => Some(voucher.uuid()),
                _ => None,
            };
            (self.ctx.device_error_handler)(guid, &error);
            return Ok((State::Done, None));
        }

        match (state, msg_type) {
            (State::AwaitHello, proto::TO2_HELLO_DEVICE) => self.on_hello(body),
            (
                State::ServingHeader { voucher, kex, suite, n6 },
                proto::TO2_GET_OP_NEXT_ENTRY,
            ) => Self::on_get_op_next_entry(voucher, kex, suite, n6, body),
            (State::ServingHeader { voucher, kex, suite, n6 }, proto::TO2_PROVE_DEVICE) => {
                self.on_prove_device(voucher, kex, suite, n6, body)
            }
            (
                State::DeviceInfoLoop { voucher, crypt, n6, n7, nn },
                proto::TO2_NEXT_DEVICE_SERVICE_INFO,
            ) => self.on_next_device_service_info(voucher, crypt, n6, n7, nn, body),
            (state @ State::OwnerInfoLoop { .. }, proto::TO2_GET_NEXT_OWNER_SERVICE_INFO) => {
                Self::on_get_next_owner_service_info(state, body)
            }
            (State::OwnerInfoLoop { voucher, crypt, n6, n7, g3, r3, .. }, proto::TO2_DONE) => {
                self.on_done(voucher, crypt, n6, n7, g3, r3, body)
            }
            (_, t) => Err(ProtocolError::refused(t, "message not valid in current state")),
        }
    }

    fn owner_keys_for(&self, kind: KeyKind, cause: u8) -> Result<KeyPair, ProtocolError> {
        (self.ctx.keys)(kind)
            .ok_or_else(|| ProtocolError::refused(cause, "no owner key for voucher key type"))
    }

    // Resolve the RSA keypair for an asymmetric exchange, falling back
    // from the restricted 2048-bit type to an unrestricted key of the
    // right length.
    fn asym_key_exchange(&self, kx: KexType, cause: u8) -> Result<KeyExchange, ProtocolError> {
        use rsa::traits::PublicKeyParts;
        let candidates: &[KeyKind] = match kx {
            KexType::Asym2048 => &[KeyKind::Rsa2048Restr, KeyKind::RsaUr],
            _ => &[KeyKind::RsaUr],
        };
        for kind in candidates {
            if let Some(KeyPair::Rsa(keys)) = (self.ctx.keys)(*kind) {
                if keys.n().bits() == kx.asym_modulus_bits() {
                    return KeyExchange::new_asym_owner(kx, keys)
                        .map_err(|e| ProtocolError::internal(cause, e.to_string()));
                }
            }
        }
        Err(ProtocolError::refused(cause, "no usable owner key for asymmetric exchange"))
    }

    fn on_hello(&self, body: &str) -> Result<(State, Option<Reply>), ProtocolError> {
        const CAUSE: u8 = proto::TO2_HELLO_DEVICE;
        let hello = To2HelloDevice::decode(body)
            .map_err(|e| ProtocolError::syntax(CAUSE, e.to_string()))?;

        // first sight of the voucher UUID; load it or give up
        let voucher = self.ctx.voucher_storage.load(&hello.g2).ok_or_else(|| {
            ProtocolError::new(
                ErrorCode::ResourceNotFound,
                CAUSE,
                format!("no voucher for {}", hello.g2),
            )
        })?;

        let kex = match hello.kx {
            KexType::Asym2048 | KexType::Asym3072 => self.asym_key_exchange(hello.kx, CAUSE)?,
            ty => KeyExchange::new(ty, Role::Owner)
                .map_err(|e| ProtocolError::internal(CAUSE, e.to_string()))?,
        };

        let n6 = Nonce::generate();
        let current_owner = voucher
            .current_owner_key()
            .map_err(|e| ProtocolError::new(ErrorCode::InvalidVoucher, CAUSE, e.to_string()))?;
        let prove = To2ProveOpHdr {
            sz: voucher.en.len() as u32,
            oh: voucher.oh.clone(),
            hmac: voucher.hmac.clone(),
            n5: hello.n5,
            n6,
            // non-group-signature devices get their advertisement echoed
            eb: hello.ea.clone(),
            xa: kex.message().map_err(|e| ProtocolError::internal(CAUSE, e.to_string()))?,
        };
        let bo = prove.encode().map_err(|e| ProtocolError::internal(CAUSE, e.to_string()))?;

        let keys = self.owner_keys_for(voucher.oh.pk.kind(), CAUSE)?;
        let signed = SignatureBlock::sign(bo, current_owner, &keys)
            .map_err(|e| ProtocolError::internal(CAUSE, e.to_string()))?;
        let mut response = String::new();
        signed
            .encode(&mut response, voucher.oh.pe)
            .map_err(|e| ProtocolError::internal(CAUSE, e.to_string()))?;

        log::info!("transfer session opened for {}", voucher.uuid());
        Ok((
            State::ServingHeader { voucher, kex, suite: hello.cs, n6 },
            Some(Reply { msg_type: proto::TO2_PROVE_OP_HDR, body: response }),
        ))
    }

    fn on_get_op_next_entry(
        voucher: OwnershipVoucher,
        kex: KeyExchange,
        suite: CipherSuite,
        n6: Nonce,
        body: &str,
    ) -> Result<(State, Option<Reply>), ProtocolError> {
        const CAUSE: u8 = proto::TO2_GET_OP_NEXT_ENTRY;
        let request = To2GetOpNextEntry::decode(body)
            .map_err(|e| ProtocolError::syntax(CAUSE, e.to_string()))?;
        let Some(entry) = voucher.en.get(request.enn as usize) else {
            return Err(ProtocolError::refused(CAUSE, "entry index out of range"));
        };
        let response = To2OpNextEntry { enn: request.enn, eni: entry.clone() }
            .encode(voucher.oh.pe)
            .map_err(|e| ProtocolError::internal(CAUSE, e.to_string()))?;
        Ok((
            State::ServingHeader { voucher, kex, suite, n6 },
            Some(Reply { msg_type: proto::TO2_OP_NEXT_ENTRY, body: response }),
        ))
    }

    fn on_prove_device(
        &self,
        voucher: OwnershipVoucher,
        kex: KeyExchange,
        suite: CipherSuite,
        n6: Nonce,
        body: &str,
    ) -> Result<(State, Option<Reply>), ProtocolError> {
        const CAUSE: u8 = proto::TO2_PROVE_DEVICE;
        let signed = SignatureBlock::decode_str(body)
            .map_err(|e| ProtocolError::syntax(CAUSE, e.to_string()))?
            .block;
        let prove = To2ProveDevice::decode(&signed.bo)
            .map_err(|e| ProtocolError::syntax(CAUSE, e.to_string()))?;

        // a null pk means the verification key comes from the device
        // certificate chain in the voucher
        let device_key = if signed.pk.is_none() {
            voucher.device_cert_key().ok_or_else(|| {
                ProtocolError::refused(CAUSE, "no device key: pk null and cert chain absent")
            })?
        } else {
            signed.pk.clone()
        };

        // n6 proves both freshness and that we are in the right state;
        // group-signature checks need it, so test it first
        if prove.n6 != n6 {
            return Err(ProtocolError::new(ErrorCode::InvalidNonce, CAUSE, "n6 mismatch"));
        }

        let verified = if let PublicKey::Epid(group_key) = &device_key {
            let Some(verifier) = self.ctx.epid.as_ref() else {
                return Err(ProtocolError::refused(CAUSE, "no group-signature verifier"));
            };
            verifier
                .verify(
                    EpidVersion::V2_0,
                    group_key,
                    signed.bo.as_bytes(),
                    &signed.sg,
                    &n6,
                    &prove.ai,
                )
                .map_err(|e| ProtocolError::internal(CAUSE, e.to_string()))?
        } else {
            device_key.verify(&signed.bo, &signed.sg)
        };
        if !verified {
            return Err(ProtocolError::new(
                ErrorCode::InvalidSignature,
                CAUSE,
                "device signature invalid",
            ));
        }

        // the key exchange begun at hello completes here; everything
        // after this message is enciphered
        let level = CryptoLevel::from_kex_type(kex.kex_type());
        let shared = kex.shared_secret(&prove.xb).map_err(|e| match e {
            KexError::Malformed => ProtocolError::refused(CAUSE, e.to_string()),
            _ => ProtocolError::internal(CAUSE, e.to_string()),
        })?;
        let sek = derive_sek(level, suite.algorithm, shared.as_bytes());
        let svk = derive_svk(level, shared.as_bytes());
        drop(shared);
        let cipher = SessionCipher::new(sek, suite)
            .map_err(|e| ProtocolError::internal(CAUSE, e.to_string()))?;
        let envelope =
            Envelope::new(svk).map_err(|e| ProtocolError::internal(CAUSE, e.to_string()))?;
        let mut crypt = Crypt { cipher, envelope };

        // the mandatory device module means at least one message follows
        if prove.nn < 1 {
            return Err(ProtocolError::refused(CAUSE, "device service-info count is zero"));
        }

        let mut psi = PreServiceInfo::default();
        for source in &self.ctx.pre_service_info_sources {
            psi.0.extend(source.pre_service_info(&voucher.uuid()));
        }
        let request = To2GetNextDeviceServiceInfo { nn: 0, psi }
            .encode()
            .map_err(|e| ProtocolError::internal(CAUSE, e.to_string()))?;
        let reply = crypt.seal(proto::TO2_GET_NEXT_DEVICE_SERVICE_INFO, request)?;

        Ok((
            State::DeviceInfoLoop { voucher, crypt, n6, n7: prove.n7, nn: prove.nn },
            Some(reply),
        ))
    }

    fn on_next_device_service_info(
        &self,
        voucher: OwnershipVoucher,
        mut crypt: Crypt,
        n6: Nonce,
        n7: Nonce,
        nn: u32,
        body: &str,
    ) -> Result<(State, Option<Reply>), ProtocolError> {
        const CAUSE: u8 = proto::TO2_NEXT_DEVICE_SERVICE_INFO;
        let plain = crypt.open(CAUSE, body)?;
        let info = To2NextDeviceServiceInfo::decode(&plain)
            .map_err(|e| ProtocolError::syntax(CAUSE, e.to_string()))?;

        for sink in &self.ctx.service_info_sinks {
            for (key, value) in info.dsi.iter() {
                sink.put_service_info(&voucher.uuid(), key, value);
            }
        }

        let next = info.nn + 1;
        if next < nn {
            // the sequence is not exhausted; ask for the next one
            let request = To2GetNextDeviceServiceInfo { nn: next, psi: PreServiceInfo::default() }
                .encode()
                .map_err(|e| ProtocolError::internal(CAUSE, e.to_string()))?;
            let reply = crypt.seal(proto::TO2_GET_NEXT_DEVICE_SERVICE_INFO, request)?;
            return Ok((State::DeviceInfoLoop { voucher, crypt, n6, n7, nn }, Some(reply)));
        }

        // device list complete; move on to setup-device
        let r3 = (self.ctx.r3)(&voucher).unwrap_or_else(|| voucher.oh.r.clone());
        let g3 = (self.ctx.g3)(&voucher).unwrap_or_else(|| voucher.uuid());

        let noh_body = To2SetupDeviceNoh { r3: r3.clone(), g3, n7 }
            .encode()
            .map_err(|e| ProtocolError::internal(CAUSE, e.to_string()))?;
        let current_owner = voucher
            .current_owner_key()
            .map_err(|e| ProtocolError::new(ErrorCode::InvalidVoucher, CAUSE, e.to_string()))?;
        let keys = self.owner_keys_for(voucher.oh.pk.kind(), CAUSE)?;
        let noh = SignatureBlock::sign(noh_body, current_owner, &keys)
            .map_err(|e| ProtocolError::internal(CAUSE, e.to_string()))?;

        // count the outgoing service-info messages by producing them
        let mut entries = Vec::new();
        for source in &self.ctx.service_info_sources {
            entries.extend(source.service_info(&voucher.uuid()));
        }
        let infos = ServiceInfoMarshaller::with_mtu(self.ctx.service_info_mtu).marshal(&entries);

        let response = To2SetupDevice { osinn: infos.len() as u32, noh }
            .encode(voucher.oh.pe)
            .map_err(|e| ProtocolError::internal(CAUSE, e.to_string()))?;
        let reply = crypt.seal(proto::TO2_SETUP_DEVICE, response)?;

        Ok((
            State::OwnerInfoLoop { voucher, crypt, n6, n7, g3, r3, infos, served: 0 },
            Some(reply),
        ))
    }

    fn on_get_next_owner_service_info(
        state: State,
        body: &str,
    ) -> Result<(State, Option<Reply>), ProtocolError> {
        const CAUSE: u8 = proto::TO2_GET_NEXT_OWNER_SERVICE_INFO;
        let State::OwnerInfoLoop { voucher, mut crypt, n6, n7, g3, r3, infos, served } = state
        else {
            unreachable!("dispatched on state");
        };
        let plain = crypt.open(CAUSE, body)?;
        let request = To2GetNextOwnerServiceInfo::decode(&plain)
            .map_err(|e| ProtocolError::syntax(CAUSE, e.to_string()))?;
        let Some(sv) = infos.get(served) else {
            return Err(ProtocolError::refused(CAUSE, "owner service-info exhausted"));
        };
        let response = To2OwnerServiceInfo { nn: request.nn, sv: sv.clone() }
            .encode()
            .map_err(|e| ProtocolError::internal(CAUSE, e.to_string()))?;
        let reply = crypt.seal(proto::TO2_OWNER_SERVICE_INFO, response)?;
        Ok((
            State::OwnerInfoLoop { voucher, crypt, n6, n7, g3, r3, infos, served: served + 1 },
            Some(reply),
        ))
    }

    fn on_done(
        &self,
        voucher: OwnershipVoucher,
        mut crypt: Crypt,
        n6: Nonce,
        n7: Nonce,
        g3: Guid,
        r3: RendezvousInfo,
        body: &str,
    ) -> Result<(State, Option<Reply>), ProtocolError> {
        const CAUSE: u8 = proto::TO2_DONE;
        let plain = crypt.open(CAUSE, body)?;
        let done =
            To2Done::decode(&plain).map_err(|e| ProtocolError::syntax(CAUSE, e.to_string()))?;

        if done.n6 != n6 {
            return Err(ProtocolError::new(ErrorCode::InvalidNonce, CAUSE, "n6 mismatch"));
        }

        if done.hmac.is_reuse_placeholder() {
            // reuse protocol: the device kept its credentials, so the
            // stored voucher must not be overwritten
            log::info!("credential reuse detected for {}", g3);
        } else {
            let current_owner = voucher
                .current_owner_key()
                .map_err(|e| ProtocolError::new(ErrorCode::InvalidVoucher, CAUSE, e.to_string()))?;
            let new_header = VoucherHeader {
                pe: voucher.oh.pe,
                r: r3,
                g: g3,
                d: voucher.oh.d.clone(),
                pk: current_owner,
                hdc: voucher.oh.hdc.clone(),
            };
            let mut regenerated = OwnershipVoucher::new(new_header, done.hmac);
            regenerated.dc = voucher.dc.clone();
            self.ctx.voucher_storage.store(g3, regenerated);
            log::info!("voucher regenerated under {}", g3);
        }

        let response = To2Done2 { n7 }.encode();
        let reply = crypt.seal(proto::TO2_DONE_2, response)?;
        Ok((State::Done, Some(reply)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CipherAlgorithm, CipherMode};
    use crate::keys::{KeyEncoding, SigInfo};
    use crate::rendezvous::{RendezvousInstr, RvProtocol};
    use crate::storage::MemoryStorage;
    use crate::types::MacKind;

    fn test_context(owner_keys: KeyPair) -> (Arc<OwnerContext>, OwnershipVoucher) {
        let owner_pub = owner_keys.public_key();
        let oh = VoucherHeader {
            pe: KeyEncoding::X509,
            r: RendezvousInfo::single(RendezvousInstr::with_host("rv", 80, RvProtocol::Http)),
            g: Guid::generate(),
            d: "widget".to_string(),
            pk: owner_pub,
            hdc: None,
        };
        let texts = oh.texts().unwrap();
        let hmac = MacKind::HmacSha256.mac_of(b"device-secret", &[texts.oh.as_bytes()]);
        let voucher = OwnershipVoucher::new(oh, hmac);

        let storage: Arc<MemoryStorage<Guid, OwnershipVoucher>> = Arc::new(MemoryStorage::new());
        storage.store(voucher.uuid(), voucher.clone());
        let ctx = OwnerContext::new(
            storage,
            Box::new(move |kind| match kind {
                KeyKind::EcdsaP256 => Some(KeyPair::EcP256(match &owner_keys {
                    KeyPair::EcP256(k) => k.clone(),
                    _ => unreachable!(),
                })),
                _ => None,
            }),
        );
        (Arc::new(ctx), voucher)
    }

    fn hello_for(voucher: &OwnershipVoucher) -> To2HelloDevice {
        To2HelloDevice {
            g2: voucher.uuid(),
            n5: Nonce::generate(),
            pe: KeyEncoding::X509,
            kx: KexType::EcdhP256,
            cs: CipherSuite::new(CipherAlgorithm::Aes128, CipherMode::Ctr, MacKind::HmacSha256),
            ea: SigInfo::for_key(KeyKind::EcdsaP256),
        }
    }

    #[test]
    fn hello_yields_signed_prove_header() {
        let (ctx, voucher) = test_context(KeyPair::generate_p256());
        let mut session = OwnerSession::new(ctx);
        let hello = hello_for(&voucher);
        let reply = session
            .next(proto::PROTOCOL_VERSION, proto::TO2_HELLO_DEVICE, &hello.encode())
            .unwrap()
            .unwrap();
        assert_eq!(reply.msg_type, proto::TO2_PROVE_OP_HDR);
        let signed = SignatureBlock::decode_str(&reply.body).unwrap().block;
        assert!(signed.verify());
        let (prove, _) = To2ProveOpHdr::decode(&signed.bo).unwrap();
        assert_eq!(prove.n5, hello.n5);
        assert_eq!(prove.sz, 0);
        assert!(!session.is_done());
    }

    #[test]
    fn unknown_guid_is_resource_not_found() {
        let (ctx, voucher) = test_context(KeyPair::generate_p256());
        let mut session = OwnerSession::new(ctx);
        let mut hello = hello_for(&voucher);
        hello.g2 = Guid::generate();
        let err = session
            .next(proto::PROTOCOL_VERSION, proto::TO2_HELLO_DEVICE, &hello.encode())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ResourceNotFound);
        assert!(session.is_done());
    }

    #[test]
    fn out_of_order_message_is_refused() {
        let (ctx, _voucher) = test_context(KeyPair::generate_p256());
        let mut session = OwnerSession::new(ctx);
        let err = session
            .next(proto::PROTOCOL_VERSION, proto::TO2_PROVE_DEVICE, "{}")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MessageRefused);
        assert!(session.is_done());
    }

    #[test]
    fn wrong_version_is_refused() {
        let (ctx, voucher) = test_context(KeyPair::generate_p256());
        let mut session = OwnerSession::new(ctx);
        let hello = hello_for(&voucher);
        let err = session.next(112, proto::TO2_HELLO_DEVICE, &hello.encode()).unwrap_err();
        assert_eq!(err.code, ErrorCode::MessageRefused);
    }

    #[test]
    fn entry_index_out_of_range_is_refused() {
        let (ctx, voucher) = test_context(KeyPair::generate_p256());
        let mut session = OwnerSession::new(ctx);
        let hello = hello_for(&voucher);
        session
            .next(proto::PROTOCOL_VERSION, proto::TO2_HELLO_DEVICE, &hello.encode())
            .unwrap();
        let request = To2GetOpNextEntry { enn: 0 }.encode().unwrap();
        let err = session
            .next(proto::PROTOCOL_VERSION, proto::TO2_GET_OP_NEXT_ENTRY, &request)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MessageRefused);
    }

    #[test]
    fn session_refuses_input_after_done() {
        let (ctx, _voucher) = test_context(KeyPair::generate_p256());
        let mut session = OwnerSession::new(ctx);
        // force a failure to finish the session
        let _ = session.next(proto::PROTOCOL_VERSION, proto::TO2_DONE, "{}");
        assert!(session.is_done());
        let err = session
            .next(proto::PROTOCOL_VERSION, proto::TO2_HELLO_DEVICE, "{}")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MessageRefused);
    }

    #[test]
    fn peer_error_finishes_session_quietly() {
        let (ctx, voucher) = test_context(KeyPair::generate_p256());
        let mut session = OwnerSession::new(ctx);
        let hello = hello_for(&voucher);
        session
            .next(proto::PROTOCOL_VERSION, proto::TO2_HELLO_DEVICE, &hello.encode())
            .unwrap();
        let error = ProtocolError::refused(proto::TO2_PROVE_OP_HDR, "device says no").encode();
        let reply = session.next(proto::PROTOCOL_VERSION, proto::MSG_ERROR, &error).unwrap();
        assert!(reply.is_none());
        assert!(session.is_done());
    }
}
