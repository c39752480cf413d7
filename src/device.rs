//! The device-side orchestrator.
//!
//! Runs owner discovery (TO1) against the rendezvous instructions in
//! the device credentials, retrying with instruction or default delays
//! until a signed redirect appears, then runs the ownership transfer
//! (TO2) against the redirect target, racing the HTTP and HTTPS
//! candidates and taking the first to finish.
//!
//! The TO2 client mirrors the owner's state machine from the other side
//! of the wire: it verifies the prove-header signature and, now that
//! the owner key is known, the earlier redirect's signature; walks the
//! voucher chain entry by entry as each is fetched; completes the key
//! exchange; drives both service-info loops; and decides locally
//! whether the reuse protocol applies before rotating its credentials.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use arrayvec::ArrayVec;
use rand::Rng;

use crate::cipher::{CipherAlgorithm, CipherMode, CipherSuite, SessionCipher};
use crate::credentials::{DeviceCredentials, DeviceState, OwnerBlock};
use crate::envelope::Envelope;
use crate::kdf::{self, CryptoLevel};
use crate::kex::{KexType, KeyExchange, Role};
use crate::keys::{KeyKind, KeyPair, PublicKey, SigInfo, SignatureBlock};
use crate::messages::*;
use crate::proto;
use crate::rendezvous::Only;
use crate::result::{ClientError, ErrorCode, ProtocolError};
use crate::serviceinfo::{ServiceInfoMarshaller, ServiceInfoSink, ServiceInfoSource};
use crate::transport::Transport;
use crate::types::Nonce;
use crate::voucher::{ChainError, ChainVerifier, VoucherHeader};

// Default inter-round delay for discovery when no instruction names one.
const DISCOVERY_DELAY_SECS: i64 = 120;
const DISCOVERY_JITTER_SECS: i64 = 30;

// At most this many transport candidates race for one transfer.
const MAX_TRANSPORT_CANDIDATES: usize = 4;

/// The device-side protocol driver.
pub struct DeviceClient {
    pub credentials: DeviceCredentials,
    keys: KeyPair,
    cipher_mode: CipherMode,
    transport: std::sync::Arc<dyn Transport>,
    pub service_info_sources: Vec<Box<dyn ServiceInfoSource>>,
    pub service_info_sinks: Vec<Box<dyn ServiceInfoSink>>,
    /// Called with the attempt count after each failed discovery round;
    /// returning false stops the loop. The default never stops.
    pub keep_trying: Box<dyn Fn(u32) -> bool + Send + Sync>,
    /// Receives protocol errors reported by peers before the attempt is
    /// abandoned or retried.
    pub peer_error_handler: Box<dyn Fn(&ProtocolError) + Send + Sync>,
}

impl DeviceClient {
    pub fn new(
        credentials: DeviceCredentials,
        keys: KeyPair,
        cipher_mode: CipherMode,
        transport: std::sync::Arc<dyn Transport>,
    ) -> Self {
        Self {
            credentials,
            keys,
            cipher_mode,
            transport,
            service_info_sources: Vec::new(),
            service_info_sinks: Vec::new(),
            keep_trying: Box::new(|_| true),
            peer_error_handler: Box::new(|error| {
                log::warn!("peer reported: {}", error);
            }),
        }
    }

    /// Run discovery then transfer. `Ok(None)` means the reuse protocol
    /// applied and the stored credentials stand; `Ok(Some(_))` carries
    /// the rotated credentials for the host to persist.
    pub fn run(&self) -> Result<Option<DeviceCredentials>, ClientError> {
        let redirect = self.discover()?;
        self.transfer_ownership(&redirect)
    }

    /* ----- TO1 ----- */

    /// Loop over the rendezvous instructions until a signed redirect is
    /// obtained. Not-found answers are expected (the owner simply has
    /// not registered yet) and only pace the loop.
    pub fn discover(&self) -> Result<SignatureBlock, ClientError> {
        let rendezvous = self.credentials.o.r.clone();
        let mut attempts = 0u32;

        loop {
            let mut slept = false;
            for instr in rendezvous.iter() {
                log::debug!("discovery instruction: {:?}", instr);
                for uri in instr.to_uris(Only::Device) {
                    match self.to1(&uri) {
                        Ok(redirect) => return Ok(redirect),
                        Err(ClientError::Protocol(e)) if e.code == ErrorCode::ResourceNotFound => {
                            // the owner has not finished registering
                            log::info!("rendezvous service says: {}", e.detail);
                        }
                        Err(ClientError::Protocol(e)) => {
                            log::warn!("rendezvous service says: {}", e.detail);
                        }
                        Err(e) => log::warn!("discovery attempt failed: {}", e),
                    }
                }
                if let Some(delay) = instr.delay() {
                    log::info!("instruction delay, pausing {}s", delay.as_secs());
                    thread::sleep(delay);
                    slept = true;
                } else {
                    slept = false;
                }
            }

            // no delay instruction closed the round: 120s +- random(30)
            if !slept {
                let jitter =
                    rand::thread_rng().gen_range(-DISCOVERY_JITTER_SECS..DISCOVERY_JITTER_SECS);
                let delay = (DISCOVERY_DELAY_SECS + jitter) as u64;
                log::info!("rendezvous instructions exhausted, pausing {}s", delay);
                thread::sleep(Duration::from_secs(delay));
            }

            attempts += 1;
            if !(self.keep_trying)(attempts) {
                return Err(ClientError::Exhausted);
            }
        }
    }

    // One discovery exchange against one rendezvous URI.
    fn to1(&self, base: &str) -> Result<SignatureBlock, ClientError> {
        let g2 = self.credentials.guid();
        let hello = To1HelloSdo { g2, ea: SigInfo::for_key(self.keys.kind()) };
        let response = self.post(base, To1HelloSdo::MSG_TYPE, None, &hello.encode())?;
        let token = response.token.clone();

        let ack = To1HelloSdoAck::decode(&response.body)?;
        // eB is unused: this device does not hold a group-signature key

        let prove = To1ProveToSdo { ai: Vec::new(), n4: ack.n4, g2 };
        let bo = prove.encode()?;
        let sg = self
            .keys
            .sign(&bo)
            .map_err(|e| local_error(ErrorCode::InternalError, To1ProveToSdo::MSG_TYPE, e))?;
        // pk is null on the wire; the rendezvous knows the key from DI
        let signed = SignatureBlock { bo, pk: PublicKey::None, sg };
        let mut body = String::new();
        signed
            .encode(&mut body, self.credentials.o.pe)
            .map_err(|e| local_error(ErrorCode::InternalError, To1ProveToSdo::MSG_TYPE, e))?;

        let response = self.post(base, To1ProveToSdo::MSG_TYPE, token.as_deref(), &body)?;
        // the redirect signature cannot be checked until the owner key
        // is known in TO2; trust the TO2 client to do it then
        Ok(SignatureBlock::decode_str(&response.body)?.block)
    }

    /* ----- TO2 ----- */

    /// Race the transfer against every transport candidate the redirect
    /// expands to, taking the first success.
    pub fn transfer_ownership(
        &self,
        to1_redirect: &SignatureBlock,
    ) -> Result<Option<DeviceCredentials>, ClientError> {
        let redirect = To1SdoRedirect::decode(&to1_redirect.bo)?;
        let host = if let Some(dns) = redirect.dns1.as_ref().filter(|d| !d.is_empty()) {
            dns.clone()
        } else if let Some(ip) = redirect.i1 {
            ip.to_string()
        } else {
            return Err(local_error(
                ErrorCode::InvalidAddress,
                To1SdoRedirect::MSG_TYPE,
                "redirect names no host",
            ));
        };

        // the redirect does not say which scheme the owner serves;
        // try both, only one will ever work
        let mut candidates: ArrayVec<String, MAX_TRANSPORT_CANDIDATES> = ArrayVec::new();
        for scheme in ["http", "https"] {
            let base = if redirect.port1 != 0 {
                format!("{}://{}:{}", scheme, host, redirect.port1)
            } else {
                format!("{}://{}", scheme, host)
            };
            candidates.push(base);
        }
        self.race(&candidates, to1_redirect)
    }

    // First successful candidate wins; the rest are left to fail on
    // their own. A candidate on the wrong scheme dies on its first
    // request, so the race settles quickly.
    fn race(
        &self,
        candidates: &[String],
        to1_redirect: &SignatureBlock,
    ) -> Result<Option<DeviceCredentials>, ClientError> {
        let (tx, rx) = mpsc::channel();
        thread::scope(|scope| {
            for base in candidates {
                let tx = tx.clone();
                scope.spawn(move || {
                    let _ = tx.send(self.transfer2(base, to1_redirect));
                });
            }
            drop(tx);

            let mut last_error = ClientError::Exhausted;
            for outcome in rx {
                match outcome {
                    Ok(result) => return Ok(result),
                    Err(e) => {
                        // expected from all but one candidate
                        log::debug!("transfer candidate failed: {}", e);
                        last_error = e;
                    }
                }
            }
            Err(last_error)
        })
    }

    /// One complete transfer session against one owner URI.
    pub fn transfer2(
        &self,
        base: &str,
        to1_redirect: &SignatureBlock,
    ) -> Result<Option<DeviceCredentials>, ClientError> {
        /* Phase 1: validate the ownership voucher. */

        let creds = &self.credentials;
        let g2 = creds.guid();
        let n5 = Nonce::generate();
        let kx = kex_type_for(self.keys.kind())?;
        let level = CryptoLevel::from_kex_type(kx);
        let suite = suite_for(level, self.cipher_mode);

        let hello = To2HelloDevice {
            g2,
            n5,
            pe: creds.o.pe,
            kx,
            cs: suite,
            ea: SigInfo::for_key(self.keys.kind()),
        };
        let response = self.post(base, To2HelloDevice::MSG_TYPE, None, &hello.encode())?;
        let mut token = response.token.clone();

        let signed_hdr = SignatureBlock::decode_str(&response.body)?.block;
        if !signed_hdr.verify() {
            return Err(local_error(
                ErrorCode::InvalidSignature,
                To2ProveOpHdr::MSG_TYPE,
                "prove-header signature invalid",
            ));
        }

        // now that the owner key is in hand, the redirect that brought
        // us here can finally be checked
        if !signed_hdr.pk.verify(&to1_redirect.bo, &to1_redirect.sg) {
            return Err(local_error(
                ErrorCode::InvalidSignature,
                To1SdoRedirect::MSG_TYPE,
                "redirect signature invalid",
            ));
        }

        let (prove_hdr, spans) = To2ProveOpHdr::decode(&signed_hdr.bo)?;

        // repeat the header MAC with our secret; it must match
        let actual_mac = prove_hdr
            .hmac
            .kind
            .mac_of(creds.secret.as_bytes(), &[spans.header.oh.as_bytes()]);
        if actual_mac != prove_hdr.hmac {
            return Err(local_error(
                ErrorCode::InvalidVoucher,
                To2ProveOpHdr::MSG_TYPE,
                "header HMAC invalid",
            ));
        }

        if prove_hdr.n5 != n5 {
            return Err(local_error(
                ErrorCode::InvalidNonce,
                To2ProveOpHdr::MSG_TYPE,
                "n5 mismatch",
            ));
        }

        // walk the voucher chain one fetched entry at a time
        let owner_level = CryptoLevel::from_key_kind(prove_hdr.oh.pk.kind()).ok_or_else(|| {
            local_error(
                ErrorCode::InvalidVoucher,
                To2ProveOpHdr::MSG_TYPE,
                "unsupported voucher key type",
            )
        })?;
        let digest = owner_level.digest_kind();
        let mut verifier =
            ChainVerifier::new(digest, &spans.header, &spans.hmac, prove_hdr.oh.pk.clone());

        for enn in 0..prove_hdr.sz {
            let request = To2GetOpNextEntry { enn }.encode()?;
            let response =
                self.post(base, To2GetOpNextEntry::MSG_TYPE, token.as_deref(), &request)?;
            token = response.token.or(token);
            let entry = To2OpNextEntry::decode(&response.body)?;
            if entry.enn != enn {
                return Err(local_error(
                    ErrorCode::MessageRefused,
                    To2OpNextEntry::MSG_TYPE,
                    "entry index mismatch",
                ));
            }
            verifier.feed(&entry.eni).map_err(chain_error)?;
        }
        let owner_key = verifier.finish(&signed_hdr.pk).map_err(chain_error)?;

        /* Phase 2: prove the device, run the device service-info loop. */

        let kex = KeyExchange::new(kx, Role::Device)
            .map_err(|e| local_error(ErrorCode::InternalError, To2ProveDevice::MSG_TYPE, e))?;
        let xb = kex
            .message()
            .map_err(|e| local_error(ErrorCode::InternalError, To2ProveDevice::MSG_TYPE, e))?;
        let n7 = Nonce::generate();

        let mut entries = device_base_info();
        for source in &self.service_info_sources {
            entries.extend(source.service_info());
        }
        let infos = ServiceInfoMarshaller::default().marshal(&entries);

        let prove = To2ProveDevice {
            ai: Vec::new(),
            n6: prove_hdr.n6,
            n7,
            g2,
            nn: infos.len() as u32,
            xb,
        };
        let bo = prove.encode()?;
        let sg = self
            .keys
            .sign(&bo)
            .map_err(|e| local_error(ErrorCode::InternalError, To2ProveDevice::MSG_TYPE, e))?;
        let signed = SignatureBlock { bo, pk: PublicKey::None, sg };
        let mut body = String::new();
        signed
            .encode(&mut body, creds.o.pe)
            .map_err(|e| local_error(ErrorCode::InternalError, To2ProveDevice::MSG_TYPE, e))?;
        let mut response = self.post(base, To2ProveDevice::MSG_TYPE, token.as_deref(), &body)?;
        token = response.token.clone().or(token);

        // both sides can now derive the session keys; everything from
        // here on is enciphered
        let shared = kex
            .shared_secret(&prove_hdr.xa)
            .map_err(|e| local_error(ErrorCode::MessageRefused, To2ProveOpHdr::MSG_TYPE, e))?;
        let sek = kdf::derive_sek(level, suite.algorithm, shared.as_bytes());
        let svk = kdf::derive_svk(level, shared.as_bytes());
        drop(shared);
        let mut cipher = SessionCipher::new(sek, suite)
            .map_err(|e| local_error(ErrorCode::InternalError, To2ProveDevice::MSG_TYPE, e))?;
        let envelope = Envelope::new(svk)
            .map_err(|e| local_error(ErrorCode::InternalError, To2ProveDevice::MSG_TYPE, e))?;

        for info in &infos {
            let plain = self.open(&envelope, &cipher, &response.body)?;
            let request = To2GetNextDeviceServiceInfo::decode(&plain)?;
            for (key, value) in &request.psi.0 {
                for sink in &self.service_info_sinks {
                    sink.put_service_info(key, value);
                }
            }
            let next = To2NextDeviceServiceInfo { nn: request.nn, dsi: info.clone() }.encode()?;
            let sealed = self.seal(&envelope, &mut cipher, &next)?;
            response =
                self.post(base, To2NextDeviceServiceInfo::MSG_TYPE, token.as_deref(), &sealed)?;
            token = response.token.clone().or(token);
        }

        /* Phase 3: setup-device, owner service-info, done. */

        let plain = self.open(&envelope, &cipher, &response.body)?;
        let (setup, pk_text) = To2SetupDevice::decode(&plain)?;
        // the digest of the verbatim pk text becomes the new owner-key
        // digest in rotated credentials
        let pkh = digest.digest_of(&[pk_text.as_bytes()]);

        if !setup.noh.verify() {
            return Err(local_error(
                ErrorCode::InvalidSignature,
                To2SetupDevice::MSG_TYPE,
                "new-owner-header signature invalid",
            ));
        }
        let noh = To2SetupDeviceNoh::decode(&setup.noh.bo)?;
        if noh.n7 != n7 {
            return Err(local_error(
                ErrorCode::InvalidNonce,
                To2SetupDevice::MSG_TYPE,
                "n7 mismatch",
            ));
        }

        for nn in 0..setup.osinn {
            let request = To2GetNextOwnerServiceInfo { nn }.encode()?;
            let sealed = self.seal(&envelope, &mut cipher, &request)?;
            let response =
                self.post(base, To2GetNextOwnerServiceInfo::MSG_TYPE, token.as_deref(), &sealed)?;
            token = response.token.or(token);
            let plain = self.open(&envelope, &cipher, &response.body)?;
            let info = To2OwnerServiceInfo::decode(&plain)?;
            for (key, value) in info.sv.iter() {
                for sink in &self.service_info_sinks {
                    sink.put_service_info(key, value);
                }
            }
        }

        // the reuse protocol: unchanged GUID, rendezvous info and owner
        // key mean the credentials stand and the owner must not rewrite
        // its stored voucher
        let reuse = noh.g3 == prove_hdr.oh.g
            && noh.r3 == prove_hdr.oh.r
            && setup.noh.pk == owner_key;

        let (done, result) = if reuse {
            log::info!("reuse protocol in effect for {}", g2);
            let done = To2Done { hmac: crate::types::HashMac::reuse_placeholder(), n6: prove_hdr.n6 };
            (done, None)
        } else {
            let device_level = CryptoLevel::from_key_kind(self.keys.kind()).ok_or_else(|| {
                local_error(
                    ErrorCode::InternalError,
                    To2Done::MSG_TYPE,
                    "unsupported device key type",
                )
            })?;
            let new_secret = kdf::fresh_hmac_secret(device_level);
            let new_header = VoucherHeader {
                pe: prove_hdr.oh.pe,
                r: noh.r3.clone(),
                g: noh.g3,
                d: prove_hdr.oh.d.clone(),
                pk: setup.noh.pk.clone(),
                hdc: prove_hdr.oh.hdc.clone(),
            };
            let header_text = new_header
                .texts()
                .map_err(|e| local_error(ErrorCode::InternalError, To2Done::MSG_TYPE, e))?;
            let new_hmac = device_level
                .mac_kind()
                .mac_of(new_secret.as_bytes(), &[header_text.oh.as_bytes()]);
            let rotated = DeviceCredentials {
                st: DeviceState::ReadyN,
                secret: new_secret,
                m: creds.m.clone(),
                o: OwnerBlock { pe: creds.o.pe, g: noh.g3, r: noh.r3, pkh },
            };
            (To2Done { hmac: new_hmac, n6: prove_hdr.n6 }, Some(rotated))
        };

        let sealed = self.seal(&envelope, &mut cipher, &done.encode())?;
        let response = self.post(base, To2Done::MSG_TYPE, token.as_deref(), &sealed)?;
        let plain = self.open(&envelope, &cipher, &response.body)?;
        let done2 = To2Done2::decode(&plain)?;
        if done2.n7 != n7 {
            return Err(local_error(ErrorCode::InvalidNonce, To2Done2::MSG_TYPE, "n7 mismatch"));
        }

        log::info!("ownership transfer complete for {}", g2);
        Ok(result)
    }

    // Posting wrapper: peer-reported protocol errors go through the
    // caller's handler before the failure propagates.
    fn post(
        &self,
        base: &str,
        msg_type: u8,
        token: Option<&str>,
        body: &str,
    ) -> Result<crate::transport::TransportResponse, ClientError> {
        match self.transport.post(base, msg_type, token, body) {
            Err(ClientError::Protocol(e)) => {
                (self.peer_error_handler)(&e);
                Err(ClientError::Protocol(e))
            }
            other => other,
        }
    }

    fn seal(
        &self,
        envelope: &Envelope,
        cipher: &mut SessionCipher,
        plain: &str,
    ) -> Result<String, ClientError> {
        envelope
            .seal(cipher, plain)
            .map_err(|e| local_error(ErrorCode::InternalError, proto::MSG_ERROR, e))
    }

    fn open(
        &self,
        envelope: &Envelope,
        cipher: &SessionCipher,
        body: &str,
    ) -> Result<String, ClientError> {
        envelope.open(cipher, body).map_err(|e| match e {
            crate::envelope::EnvelopeError::HmacVerification => {
                local_error(ErrorCode::MessageRefused, proto::MSG_ERROR, e)
            }
            e => local_error(ErrorCode::SyntaxError, proto::MSG_ERROR, e),
        })
    }
}

fn local_error(
    code: ErrorCode,
    cause: u8,
    detail: impl std::fmt::Display,
) -> ClientError {
    ClientError::Protocol(ProtocolError::new(code, cause, detail.to_string()))
}

fn chain_error(e: ChainError) -> ClientError {
    let code = match e {
        ChainError::EntrySignature { .. } => ErrorCode::InvalidSignature,
        _ => ErrorCode::InvalidVoucher,
    };
    local_error(code, To2OpNextEntry::MSG_TYPE, e)
}

// The exchange a device requests follows its attestation key.
fn kex_type_for(kind: KeyKind) -> Result<KexType, ClientError> {
    Ok(match kind {
        KeyKind::Rsa2048Restr => KexType::DhGroup14,
        KeyKind::RsaUr => KexType::DhGroup15,
        KeyKind::EcdsaP256 => KexType::EcdhP256,
        KeyKind::EcdsaP384 => KexType::EcdhP384,
        _ => {
            return Err(local_error(
                ErrorCode::InternalError,
                To2HelloDevice::MSG_TYPE,
                "unsupported device attestation key",
            ))
        }
    })
}

fn suite_for(level: CryptoLevel, mode: CipherMode) -> CipherSuite {
    match level {
        CryptoLevel::Level0 => {
            CipherSuite::new(CipherAlgorithm::Aes128, mode, crate::types::MacKind::HmacSha256)
        }
        CryptoLevel::Level1 => {
            CipherSuite::new(CipherAlgorithm::Aes256, mode, crate::types::MacKind::HmacSha384)
        }
    }
}

// The built-in device module; guarantees the service-info count the
// protocol requires is never zero.
fn device_base_info() -> Vec<(String, String)> {
    vec![("devmod:active".to_string(), "1".to_string())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kex_follows_attestation_key() {
        assert_eq!(kex_type_for(KeyKind::EcdsaP256).unwrap(), KexType::EcdhP256);
        assert_eq!(kex_type_for(KeyKind::EcdsaP384).unwrap(), KexType::EcdhP384);
        assert_eq!(kex_type_for(KeyKind::Rsa2048Restr).unwrap(), KexType::DhGroup14);
        assert_eq!(kex_type_for(KeyKind::RsaUr).unwrap(), KexType::DhGroup15);
        assert!(kex_type_for(KeyKind::None).is_err());
    }

    #[test]
    fn suite_follows_level() {
        let s = suite_for(CryptoLevel::Level0, CipherMode::Ctr);
        assert_eq!(s.algorithm, CipherAlgorithm::Aes128);
        let s = suite_for(CryptoLevel::Level1, CipherMode::Cbc);
        assert_eq!(s.algorithm, CipherAlgorithm::Aes256);
    }

    #[test]
    fn base_info_is_never_empty() {
        assert!(!device_base_info().is_empty());
    }
}
