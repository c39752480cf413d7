//! A secure device-onboarding protocol engine.
//!
//! Transfers cryptographic trust in a device from its manufacturer to
//! its eventual owner over an untrusted network: ownership vouchers
//! carry a signed chain of custody, a mutual-authentication handshake
//! derives per-session keys, and provisioning data flows over an
//! HMAC-authenticated encrypted channel.
//!
//! The crate is transport-shy on purpose: the owner side is a pure
//! state machine fed one message at a time, and the device side drives
//! any [`transport::Transport`] implementation. Storage, signing keys,
//! service-info plugins and the legacy group-signature verifier are
//! seams the host fills in.

pub mod cipher;
pub mod codec;
pub mod credentials;
pub mod device;
pub mod envelope;
pub mod epid;
pub mod kdf;
pub mod kex;
pub mod keys;
pub mod messages;
pub mod owner;
pub mod proto;
pub mod rendezvous;
pub mod result;
pub mod secret;
pub mod serviceinfo;
pub mod storage;
pub mod to0;
pub mod transport;
pub mod types;
pub mod voucher;

pub use cipher::{CipherAlgorithm, CipherMode, CipherSuite, SessionCipher};
pub use credentials::{DeviceCredentials, DeviceState};
pub use device::DeviceClient;
pub use envelope::Envelope;
pub use kdf::CryptoLevel;
pub use kex::{KexType, KeyExchange, Role};
pub use keys::{KeyEncoding, KeyKind, KeyPair, PublicKey, SignatureBlock};
pub use owner::{OwnerContext, OwnerSession, Reply};
pub use result::{ClientError, ErrorCode, ProtocolError};
pub use storage::{MemoryStorage, ObjectStorage, RedirectRecord};
pub use to0::{OwnerLocation, OwnerRegistration};
pub use transport::{HttpTransport, Transport, TransportResponse};
pub use types::{Guid, HashDigest, HashMac, Nonce};
pub use voucher::{ChainError, ChainVerifier, OwnershipVoucher, VoucherEntry, VoucherHeader};
