//! The HTTP message transport contract.
//!
//! Messages are POSTed to a path keyed by protocol version and message
//! type number, `Content-Type: application/json`. The first response of
//! a session may issue an `Authorization` token which must be echoed on
//! every later request of that session. Non-200 responses carry a
//! protocol `Error` body when the peer produced one; the transport
//! surfaces that as a protocol error, anything else as an IO failure.
//!
//! The trait exists so protocol engines never touch sockets: tests wire
//! a device client straight to an owner session through an in-memory
//! implementation.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};

use crate::proto::message_path;
use crate::result::{ClientError, ProtocolError};

/// A successful message exchange.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub body: String,
    /// Session token issued or echoed by the peer, if any.
    pub token: Option<String>,
}

/// Posts one protocol message and returns the peer's reply body.
pub trait Transport: Send + Sync {
    fn post(
        &self,
        base: &str,
        msg_type: u8,
        token: Option<&str>,
        body: &str,
    ) -> Result<TransportResponse, ClientError>;
}

/// The production transport over a blocking HTTP client.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, ClientError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ClientError::Io(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn post(
        &self,
        base: &str,
        msg_type: u8,
        token: Option<&str>,
        body: &str,
    ) -> Result<TransportResponse, ClientError> {
        let url = format!("{}{}", base.trim_end_matches('/'), message_path(msg_type));
        log::debug!("POST {} {}", url, body);
        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string());
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            request = request.header(AUTHORIZATION, token);
        }
        let response = request.send().map_err(|e| ClientError::Io(e.to_string()))?;

        let status = response.status();
        let token = response
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().map_err(|e| ClientError::Io(e.to_string()))?;
        log::debug!("{} {}", status, text);

        if status.as_u16() == 200 {
            Ok(TransportResponse { body: text, token })
        } else if let Ok(error) = ProtocolError::decode(&text) {
            // the peer refused at the protocol level
            Err(ClientError::Protocol(error))
        } else {
            Err(ClientError::Io(format!("HTTP {}: {}", status, text)))
        }
    }
}
