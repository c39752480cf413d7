//! Protocol constants.

/// Wire protocol version (1.13).
pub const PROTOCOL_VERSION: u32 = 113;

/// Nonces are always 16 raw bytes.
pub const NONCE_SIZE: usize = 16;

/// Device GUIDs are 16 raw bytes.
pub const GUID_SIZE: usize = 16;

/// AES block size; also the width of a CTR/CBC IV.
pub const CIPHER_BLOCK_SIZE: usize = 16;

/// Per-session random prefix of a CTR IV.
pub const CTR_NONCE_SIZE: usize = 12;

/// Label baked into every key-derivation HMAC.
pub const KDF_LABEL: &[u8] = b"MarshalPointKDF";

/// Default maximum service-info message length, per protocol suggestion.
pub const SERVICE_INFO_MTU: usize = 1300;

/// The single-byte HMAC placeholder a device sends in TO2.Done when the
/// credential-reuse protocol is in effect.
pub const REUSE_MAC_BYTE: u8 = b'=';

/* Message type numbers. */

pub const TO0_HELLO: u8 = 20;
pub const TO0_HELLO_ACK: u8 = 21;
pub const TO0_OWNER_SIGN: u8 = 22;
pub const TO0_ACCEPT_OWNER: u8 = 23;

pub const TO1_HELLO_SDO: u8 = 30;
pub const TO1_HELLO_SDO_ACK: u8 = 31;
pub const TO1_PROVE_TO_SDO: u8 = 32;
pub const TO1_SDO_REDIRECT: u8 = 33;

pub const TO2_HELLO_DEVICE: u8 = 40;
pub const TO2_PROVE_OP_HDR: u8 = 41;
pub const TO2_GET_OP_NEXT_ENTRY: u8 = 42;
pub const TO2_OP_NEXT_ENTRY: u8 = 43;
pub const TO2_PROVE_DEVICE: u8 = 44;
pub const TO2_GET_NEXT_DEVICE_SERVICE_INFO: u8 = 45;
pub const TO2_NEXT_DEVICE_SERVICE_INFO: u8 = 46;
pub const TO2_SETUP_DEVICE: u8 = 47;
pub const TO2_GET_NEXT_OWNER_SERVICE_INFO: u8 = 48;
pub const TO2_OWNER_SERVICE_INFO: u8 = 49;
pub const TO2_DONE: u8 = 50;
pub const TO2_DONE_2: u8 = 51;

pub const MSG_ERROR: u8 = 255;

/// The URL path a message of the given type is POSTed to.
pub fn message_path(msg_type: u8) -> String {
    format!("/mp/{}/msg/{}", PROTOCOL_VERSION, msg_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_carry_version_and_type() {
        assert_eq!(message_path(TO2_HELLO_DEVICE), "/mp/113/msg/40");
        assert_eq!(message_path(MSG_ERROR), "/mp/113/msg/255");
    }
}
