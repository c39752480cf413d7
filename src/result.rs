//! Protocol error taxonomy.
//!
//! Every failure a protocol peer can be told about is a `ProtocolError`:
//! an error code, the type number of the message that provoked it, and a
//! free-text detail. The same type is the wire `Error` message body, so
//! converting a local failure into an outgoing error message is a plain
//! `encode` call.

use crate::codec::{self, CodecError, Reader};
use crate::proto;

/// Protocol error codes.
///
/// `ResourceNotFound` is the only code that is routinely expected in a
/// healthy deployment: a rendezvous service returns it until the owner
/// has registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A session token was missing, unknown, or used out of state.
    InvalidToken,
    /// An ownership voucher or its chain of entries failed validation.
    InvalidVoucher,
    /// A signature did not verify.
    InvalidSignature,
    /// A nonce was missing, wrong, or replayed.
    InvalidNonce,
    /// A network address or GUID was malformed or unusable.
    InvalidAddress,
    /// A requested voucher or redirect record does not exist.
    ResourceNotFound,
    /// The message body could not be parsed.
    SyntaxError,
    /// The message was well formed but not acceptable in this state.
    MessageRefused,
    /// An unexpected local failure; not attributable to the peer.
    InternalError,
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        match self {
            Self::InvalidToken => 1,
            Self::InvalidVoucher => 2,
            Self::InvalidSignature => 3,
            Self::InvalidNonce => 4,
            Self::InvalidAddress => 5,
            Self::ResourceNotFound => 6,
            Self::SyntaxError => 100,
            Self::MessageRefused => 101,
            Self::InternalError => 500,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::InvalidToken,
            2 => Self::InvalidVoucher,
            3 => Self::InvalidSignature,
            4 => Self::InvalidNonce,
            5 => Self::InvalidAddress,
            6 => Self::ResourceNotFound,
            100 => Self::SyntaxError,
            101 => Self::MessageRefused,
            500 => Self::InternalError,
            _ => return None,
        })
    }
}

/// A protocol failure; also the body of the wire `Error` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    /// What went wrong.
    pub code: ErrorCode,
    /// Type number of the message that provoked the error.
    pub cause: u8,
    /// Human-readable detail.
    pub detail: String,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, cause: u8, detail: impl Into<String>) -> Self {
        Self { code, cause, detail: detail.into() }
    }

    pub fn syntax(cause: u8, detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::SyntaxError, cause, detail)
    }

    pub fn refused(cause: u8, detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::MessageRefused, cause, detail)
    }

    pub fn internal(cause: u8, detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, cause, detail)
    }

    /// Encode as the wire `Error` body: `{"ec":…,"emsg":…,"em":…}`.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(codec::BEGIN_OBJECT);
        codec::write_key(&mut out, "ec");
        // codes are small and fixed, the width check cannot fail
        let _ = codec::write_uint(&mut out, self.code.code() as u64, 32);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "emsg");
        let _ = codec::write_uint(&mut out, self.cause as u64, 8);
        out.push(codec::COMMA);
        codec::write_key(&mut out, "em");
        codec::write_string(&mut out, &self.detail);
        out.push(codec::END_OBJECT);
        out
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut r = Reader::new(text);
        let value = Self::decode_from(&mut r)?;
        Ok(value)
    }

    pub fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        r.expect(codec::BEGIN_OBJECT)?;
        r.expect_key("ec")?;
        let at = r.position();
        let ec = r.uint32()?;
        let code = ErrorCode::from_code(ec).ok_or(CodecError::Unexpected(at))?;
        r.expect(codec::COMMA)?;
        r.expect_key("emsg")?;
        let cause = r.uint8()?;
        r.expect(codec::COMMA)?;
        r.expect_key("em")?;
        let detail = r.string()?;
        r.expect(codec::END_OBJECT)?;
        Ok(Self { code, cause, detail })
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "error {} (message type {}): {}",
            self.code.code(),
            self.cause,
            self.detail
        )
    }
}

impl std::error::Error for ProtocolError {}

impl From<CodecError> for ProtocolError {
    fn from(e: CodecError) -> Self {
        Self::syntax(proto::MSG_ERROR, e.to_string())
    }
}

/// An error on the client (device or owner-registration) side.
///
/// Protocol errors received from or attributable to a peer are kept
/// distinct from plain transport failures so discovery loops can treat
/// an expected `ResourceNotFound` differently from a dead host.
#[derive(Debug)]
pub enum ClientError {
    /// The peer answered with a protocol `Error` message, or a local
    /// validation failed with a protocol-shaped error.
    Protocol(ProtocolError),
    /// The transport failed below the protocol layer.
    Io(String),
    /// Every candidate in a round of connection attempts failed.
    Exhausted,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "{}", e),
            Self::Io(detail) => write!(f, "transport failure: {}", detail),
            Self::Exhausted => write!(f, "all connection attempts failed"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<CodecError> for ClientError {
    fn from(e: CodecError) -> Self {
        Self::Protocol(e.into())
    }
}
