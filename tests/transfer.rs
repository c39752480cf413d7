//! End-to-end ownership transfer: a device client wired straight to an
//! owner session through an in-memory transport, plus the discovery
//! (TO1) path against a scripted rendezvous.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use onboard::cipher::CipherMode;
use onboard::credentials::{DeviceCredentials, DeviceState, ManufacturerBlock, OwnerBlock};
use onboard::keys::{KeyEncoding, KeyKind, KeyPair, SignatureBlock};
use onboard::messages::{To1HelloSdoAck, To1SdoRedirect};
use onboard::owner::{OwnerContext, OwnerSession};
use onboard::proto;
use onboard::rendezvous::{RendezvousInfo, RendezvousInstr, RvProtocol};
use onboard::result::{ClientError, ErrorCode, ProtocolError};
use onboard::serviceinfo::{ServiceInfoMultiSource, ServiceInfoSink, ServiceInfoSource};
use onboard::storage::{MemoryStorage, ObjectStorage};
use onboard::transport::{Transport, TransportResponse};
use onboard::types::{DigestKind, Guid, MacKind, Nonce};
use onboard::voucher::{OwnershipVoucher, VoucherHeader};
use onboard::DeviceClient;

const SESSION_TOKEN: &str = "Bearer test-session";

/// Voucher storage that counts writes, so tests can assert the reuse
/// protocol left stored state alone.
struct CountingStore {
    inner: MemoryStorage<Guid, OwnershipVoucher>,
    stores: AtomicUsize,
}

impl CountingStore {
    fn new() -> Self {
        Self { inner: MemoryStorage::new(), stores: AtomicUsize::new(0) }
    }
}

impl ObjectStorage<Guid, OwnershipVoucher> for CountingStore {
    fn load(&self, key: &Guid) -> Option<OwnershipVoucher> {
        self.inner.load(key)
    }

    fn store(&self, key: Guid, value: OwnershipVoucher) {
        self.stores.fetch_add(1, Ordering::SeqCst);
        self.inner.store(key, value);
    }
}

struct CollectingSink(Mutex<Vec<(String, String)>>);

impl ServiceInfoSink for CollectingSink {
    fn put_service_info(&self, key: &str, value: &str) {
        self.0.lock().unwrap().push((key.to_string(), value.to_string()));
    }
}

struct StaticSource(Vec<(String, String)>);

impl ServiceInfoSource for StaticSource {
    fn service_info(&self) -> Vec<(String, String)> {
        self.0.clone()
    }
}

struct StaticMultiSource(Vec<(String, String)>);

impl ServiceInfoMultiSource for StaticMultiSource {
    fn service_info(&self, _guid: &Guid) -> Vec<(String, String)> {
        self.0.clone()
    }
}

/// The whole network in one object: a scripted rendezvous for TO1 and a
/// live owner session for TO2. HTTPS candidates are refused so the
/// transport race settles on HTTP.
struct TestNetwork {
    ctx: Arc<OwnerContext>,
    session: Mutex<Option<OwnerSession>>,
    redirect_body: String,
    rendezvous_misses: AtomicUsize,
}

impl TestNetwork {
    fn new(ctx: Arc<OwnerContext>, redirect: &SignatureBlock) -> Self {
        let mut redirect_body = String::new();
        redirect.encode(&mut redirect_body, KeyEncoding::X509).unwrap();
        Self {
            ctx,
            session: Mutex::new(None),
            redirect_body,
            rendezvous_misses: AtomicUsize::new(0),
        }
    }
}

impl Transport for TestNetwork {
    fn post(
        &self,
        base: &str,
        msg_type: u8,
        token: Option<&str>,
        body: &str,
    ) -> Result<TransportResponse, ClientError> {
        if base.starts_with("https://") {
            return Err(ClientError::Io("connection refused".to_string()));
        }
        match msg_type {
            proto::TO1_HELLO_SDO => {
                // the first rendezvous host has no registration yet
                if base.contains("rv-a") {
                    self.rendezvous_misses.fetch_add(1, Ordering::SeqCst);
                    return Err(ClientError::Protocol(ProtocolError::new(
                        ErrorCode::ResourceNotFound,
                        msg_type,
                        "owner not registered",
                    )));
                }
                Ok(TransportResponse {
                    body: To1HelloSdoAck {
                        n4: Nonce::generate(),
                        eb: onboard::keys::SigInfo::for_key(KeyKind::EcdsaP256),
                    }
                    .encode(),
                    token: Some(SESSION_TOKEN.to_string()),
                })
            }
            proto::TO1_PROVE_TO_SDO => Ok(TransportResponse {
                body: self.redirect_body.clone(),
                token: token.map(str::to_string),
            }),
            _ => {
                let mut guard = self.session.lock().unwrap();
                if msg_type == proto::TO2_HELLO_DEVICE {
                    *guard = Some(OwnerSession::new(self.ctx.clone()));
                } else if token != Some(SESSION_TOKEN) {
                    return Err(ClientError::Protocol(ProtocolError::new(
                        ErrorCode::InvalidToken,
                        msg_type,
                        "missing or wrong session token",
                    )));
                }
                let session = guard
                    .as_mut()
                    .ok_or_else(|| ClientError::Io("no open session".to_string()))?;
                match session.next(proto::PROTOCOL_VERSION, msg_type, body) {
                    Ok(Some(reply)) => Ok(TransportResponse {
                        body: reply.body,
                        token: Some(SESSION_TOKEN.to_string()),
                    }),
                    Ok(None) => Err(ClientError::Io("owner had nothing to say".to_string())),
                    Err(e) => Err(ClientError::Protocol(e)),
                }
            }
        }
    }
}

struct Fixture {
    storage: Arc<CountingStore>,
    network: Arc<TestNetwork>,
    device: DeviceClient,
    voucher: OwnershipVoucher,
}

/// Build a manufacturer-fresh device + owner pair sharing one voucher.
fn fixture(configure: impl FnOnce(&mut OwnerContext)) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let owner_keys = KeyPair::generate_p256();
    let device_keys = KeyPair::generate_p256();
    let secret = b"manufacturing-hmac-secret";

    let rendezvous = RendezvousInfo(vec![
        RendezvousInstr::with_host("rv-a.example", 8040, RvProtocol::Http),
        RendezvousInstr::with_host("rv-b.example", 8040, RvProtocol::Http),
    ]);
    let oh = VoucherHeader {
        pe: KeyEncoding::X509,
        r: rendezvous.clone(),
        g: Guid::generate(),
        d: "widget-3000".to_string(),
        pk: owner_keys.public_key(),
        hdc: None,
    };
    let texts = oh.texts().unwrap();
    let hmac = MacKind::HmacSha256.mac_of(secret, &[texts.oh.as_bytes()]);
    let voucher = OwnershipVoucher::new(oh, hmac);

    let storage = Arc::new(CountingStore::new());
    storage.store(voucher.uuid(), voucher.clone());

    let provider_keys = owner_keys.clone();
    let mut ctx = OwnerContext::new(
        storage.clone(),
        Box::new(move |kind| (kind == KeyKind::EcdsaP256).then(|| provider_keys.clone())),
    );
    configure(&mut ctx);
    let ctx = Arc::new(ctx);

    // the redirect a completed TO0 would have left at the rendezvous
    let redirect_bo = To1SdoRedirect {
        i1: None,
        dns1: Some("owner.example".to_string()),
        port1: 8042,
        to0dh: DigestKind::Sha256.digest_of(&[b"to0d"]),
    }
    .encode()
    .unwrap();
    let redirect =
        SignatureBlock::sign(redirect_bo, owner_keys.public_key(), &owner_keys).unwrap();

    let network = Arc::new(TestNetwork::new(ctx, &redirect));

    let credentials = DeviceCredentials {
        st: DeviceState::Ready1,
        secret: onboard::secret::SecretBytes::from_slice(secret),
        m: ManufacturerBlock { d: "widget-3000".to_string() },
        o: OwnerBlock {
            pe: KeyEncoding::X509,
            g: voucher.uuid(),
            r: rendezvous,
            pkh: DigestKind::Sha256.digest_of(&[b"factory"]),
        },
    };
    let device = DeviceClient::new(credentials, device_keys, CipherMode::Ctr, network.clone());

    Fixture { storage, network, device, voucher }
}

#[test]
fn reuse_protocol_keeps_credentials_and_storage() {
    // default owner context proposes the same guid, rendezvous and key,
    // so the reuse protocol must apply
    let f = fixture(|_| {});
    let result = f.device.run().unwrap();
    assert!(result.is_none(), "device must not rotate credentials on reuse");
    assert_eq!(f.storage.stores.load(Ordering::SeqCst), 1, "only the fixture's own seed store");
    assert_eq!(f.storage.load(&f.voucher.uuid()).unwrap(), f.voucher);
    // discovery passed through the unregistered rendezvous first
    assert!(f.network.rendezvous_misses.load(Ordering::SeqCst) >= 1);
}

#[test]
fn changed_guid_causes_normal_rotation() {
    let new_guid = Guid::generate();
    let f = fixture(move |ctx| {
        ctx.g3 = Box::new(move |_| Some(new_guid));
    });
    let rotated = f.device.run().unwrap().expect("credentials must rotate");
    assert_eq!(rotated.o.g, new_guid);
    assert_eq!(rotated.st, DeviceState::ReadyN);
    assert_ne!(rotated.o.pkh, f.device.credentials.o.pkh);

    // the owner persisted a regenerated voucher under the new guid,
    // bound to the device's new hmac
    assert_eq!(f.storage.stores.load(Ordering::SeqCst), 2);
    let regenerated = f.storage.load(&new_guid).expect("voucher under new guid");
    assert_eq!(regenerated.oh.g, new_guid);
    assert_eq!(regenerated.oh.d, "widget-3000");
    let header_text = regenerated.oh.texts().unwrap();
    let expected =
        MacKind::HmacSha256.mac_of(rotated.secret.as_bytes(), &[header_text.oh.as_bytes()]);
    assert_eq!(regenerated.hmac, expected);
}

#[test]
fn service_info_flows_both_ways() {
    let owner_payload = vec![
        ("fdo:install".to_string(), "agent".to_string()),
        ("fdo:config".to_string(), "x".repeat(2000)),
    ];
    let payload = owner_payload.clone();
    let mut f = fixture(move |ctx| {
        ctx.service_info_sources = vec![Box::new(StaticMultiSource(payload.clone()))];
        ctx.service_info_sinks = vec![];
    });
    let device_sink = Arc::new(CollectingSink(Mutex::new(Vec::new())));
    struct SharedSink(Arc<CollectingSink>);
    impl ServiceInfoSink for SharedSink {
        fn put_service_info(&self, key: &str, value: &str) {
            self.0.put_service_info(key, value)
        }
    }
    f.device.service_info_sinks = vec![Box::new(SharedSink(device_sink.clone()))];
    f.device.service_info_sources =
        vec![Box::new(StaticSource(vec![("devmod:os".to_string(), "linux".to_string())]))];

    f.device.run().unwrap();

    // the device received every owner entry, in order, values reassembled
    let received = device_sink.0.lock().unwrap();
    let mut rebuilt: Vec<(String, String)> = Vec::new();
    for (key, value) in received.iter() {
        match rebuilt.last_mut() {
            Some(last) if last.0 == *key => last.1.push_str(value),
            _ => rebuilt.push((key.clone(), value.clone())),
        }
    }
    assert_eq!(rebuilt, owner_payload);
}

#[test]
fn discovery_returns_signed_redirect() {
    let f = fixture(|_| {});
    let redirect = f.device.discover().unwrap();
    let parsed = To1SdoRedirect::decode(&redirect.bo).unwrap();
    assert_eq!(parsed.dns1.as_deref(), Some("owner.example"));
    assert_eq!(parsed.port1, 8042);
}

#[test]
fn race_survives_a_dead_candidate() {
    // transfer_ownership tries https (always refused here) and http
    let f = fixture(|_| {});
    let redirect = f.device.discover().unwrap();
    let result = f.device.transfer_ownership(&redirect).unwrap();
    assert!(result.is_none());
}

#[test]
fn prove_device_with_wrong_nonce_is_rejected() {
    use onboard::cipher::{CipherAlgorithm, CipherSuite};
    use onboard::kex::{KexType, KeyExchange, Role};
    use onboard::keys::SigInfo;
    use onboard::messages::{To2HelloDevice, To2ProveDevice};

    let f = fixture(|_| {});
    let device_keys = KeyPair::generate_p256();
    let mut session = OwnerSession::new(f.network.ctx.clone());

    let hello = To2HelloDevice {
        g2: f.voucher.uuid(),
        n5: Nonce::generate(),
        pe: KeyEncoding::X509,
        kx: KexType::EcdhP256,
        cs: CipherSuite::new(CipherAlgorithm::Aes128, CipherMode::Ctr, MacKind::HmacSha256),
        ea: SigInfo::for_key(KeyKind::EcdsaP256),
    };
    session
        .next(proto::PROTOCOL_VERSION, proto::TO2_HELLO_DEVICE, &hello.encode())
        .unwrap();

    // a prove-device carrying a replayed (wrong) n6
    let kex = KeyExchange::new(KexType::EcdhP256, Role::Device).unwrap();
    let prove = To2ProveDevice {
        ai: Vec::new(),
        n6: Nonce::generate(),
        n7: Nonce::generate(),
        g2: f.voucher.uuid(),
        nn: 1,
        xb: kex.message().unwrap(),
    };
    let bo = prove.encode().unwrap();
    let sg = device_keys.sign(&bo).unwrap();
    let signed = SignatureBlock { bo, pk: device_keys.public_key(), sg };
    let mut body = String::new();
    signed.encode(&mut body, KeyEncoding::X509).unwrap();
    let err = session
        .next(proto::PROTOCOL_VERSION, proto::TO2_PROVE_DEVICE, &body)
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidNonce);
    assert!(session.is_done());
}

#[test]
fn extended_voucher_chain_is_walked_over_the_wire() {
    // hand the voucher from the maker to a second owner, then transfer
    let maker_keys = KeyPair::generate_p256();
    let owner_keys = KeyPair::generate_p256();
    let device_keys = KeyPair::generate_p256();
    let secret = b"device-secret";

    let rendezvous =
        RendezvousInfo(vec![RendezvousInstr::with_host("rv-b.example", 8040, RvProtocol::Http)]);
    let oh = VoucherHeader {
        pe: KeyEncoding::X509,
        r: rendezvous.clone(),
        g: Guid::generate(),
        d: "widget".to_string(),
        pk: maker_keys.public_key(),
        hdc: None,
    };
    let texts = oh.texts().unwrap();
    let hmac = MacKind::HmacSha256.mac_of(secret, &[texts.oh.as_bytes()]);
    let mut voucher = OwnershipVoucher::new(oh, hmac);
    voucher.extend(&maker_keys, &owner_keys.public_key()).unwrap();

    let storage = Arc::new(CountingStore::new());
    storage.store(voucher.uuid(), voucher.clone());
    let provider_keys = owner_keys.clone();
    let ctx = Arc::new(OwnerContext::new(
        storage,
        Box::new(move |kind| (kind == KeyKind::EcdsaP256).then(|| provider_keys.clone())),
    ));

    let redirect_bo = To1SdoRedirect {
        i1: None,
        dns1: Some("owner.example".to_string()),
        port1: 8042,
        to0dh: DigestKind::Sha256.digest_of(&[b"to0d"]),
    }
    .encode()
    .unwrap();
    let redirect =
        SignatureBlock::sign(redirect_bo, owner_keys.public_key(), &owner_keys).unwrap();
    let network = Arc::new(TestNetwork::new(ctx, &redirect));

    let credentials = DeviceCredentials {
        st: DeviceState::Ready1,
        secret: onboard::secret::SecretBytes::from_slice(secret),
        m: ManufacturerBlock { d: "widget".to_string() },
        o: OwnerBlock {
            pe: KeyEncoding::X509,
            g: voucher.uuid(),
            r: rendezvous,
            pkh: DigestKind::Sha256.digest_of(&[b"factory"]),
        },
    };
    let device = DeviceClient::new(credentials, device_keys, CipherMode::Cbc, network);

    // one signed entry fetched and verified over the wire; same owner
    // key throughout, so the reuse protocol applies
    let result = device.run().unwrap();
    assert!(result.is_none());
}
