//! Wire protocol for synckit: binary frame codec and message types.
//!
//! Binary frame layout (network byte order):
//!
//! ```text
//! +--------------+----------------+-----------------+---------------+
//! | type (1 byte)| timestamp (8B) | payload len (4B) | payload (N B) |
//! +--------------+----------------+-----------------+---------------+
//! ```
//!
//! `payload` is UTF-8 JSON text. If the first byte of a frame is `{` or
//! `[`, the whole frame is instead parsed as a textual JSON message whose
//! `type` field names the message kind.

mod codec;
mod types;

pub use codec::{decode_message, encode_message, CodecError, DecodedMessage};
pub use types::*;

/// Minimum size of a binary frame: 1 (type) + 8 (timestamp) + 4 (length).
pub const HEADER_LEN: usize = 13;

/// Message type names, matching the wire-compatible string form.
pub mod message_type {
    pub const AUTH: &str = "auth";
    pub const AUTH_SUCCESS: &str = "auth_success";
    pub const AUTH_ERROR: &str = "auth_error";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const SYNC_REQUEST: &str = "sync_request";
    pub const SYNC_RESPONSE: &str = "sync_response";
    pub const SYNC_STEP1: &str = "sync_step1";
    pub const SYNC_STEP2: &str = "sync_step2";
    pub const DELTA: &str = "delta";
    pub const ACK: &str = "ack";
    pub const DELTA_BATCH: &str = "delta_batch";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const AWARENESS_UPDATE: &str = "awareness_update";
    pub const AWARENESS_SUBSCRIBE: &str = "awareness_subscribe";
    pub const AWARENESS_STATE: &str = "awareness_state";
    pub const ERROR: &str = "error";
}

/// Frozen wire error codes (§6 of the design).
pub mod error_codes {
    pub const AUTH_REQUIRED: &str = "AUTH_REQUIRED";
    pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
    pub const NOT_AUTHENTICATED: &str = "NOT_AUTHENTICATED";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const ACCESS_DENIED: &str = "ACCESS_DENIED";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const INVALID_DOCUMENT_ID: &str = "INVALID_DOCUMENT_ID";
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
    pub const UNKNOWN_MESSAGE_TYPE: &str = "UNKNOWN_MESSAGE_TYPE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Maps a type code byte to its wire type name. Unknown codes map to `error`.
#[must_use]
pub fn code_to_name(code: u8) -> &'static str {
    use message_type::*;
    match code {
        0x01 => AUTH,
        0x02 => AUTH_SUCCESS,
        0x03 => AUTH_ERROR,
        0x10 => SUBSCRIBE,
        0x11 => UNSUBSCRIBE,
        0x12 => SYNC_REQUEST,
        0x13 => SYNC_RESPONSE,
        0x14 => SYNC_STEP1,
        0x15 => SYNC_STEP2,
        0x20 => DELTA,
        0x21 => ACK,
        0x22 => DELTA_BATCH,
        0x30 => PING,
        0x31 => PONG,
        0x40 => AWARENESS_UPDATE,
        0x41 => AWARENESS_SUBSCRIBE,
        0x42 => AWARENESS_STATE,
        _ => ERROR,
    }
}

/// Maps a wire type name to its type code byte. Unknown names map to `error`'s code (0xFF).
#[must_use]
pub fn name_to_code(name: &str) -> u8 {
    use message_type::*;
    match name {
        AUTH => 0x01,
        AUTH_SUCCESS => 0x02,
        AUTH_ERROR => 0x03,
        SUBSCRIBE => 0x10,
        UNSUBSCRIBE => 0x11,
        SYNC_REQUEST => 0x12,
        SYNC_RESPONSE => 0x13,
        SYNC_STEP1 => 0x14,
        SYNC_STEP2 => 0x15,
        DELTA => 0x20,
        ACK => 0x21,
        DELTA_BATCH => 0x22,
        PING => 0x30,
        PONG => 0x31,
        AWARENESS_UPDATE => 0x40,
        AWARENESS_SUBSCRIBE => 0x41,
        AWARENESS_STATE => 0x42,
        _ => 0xFF,
    }
}

/// Set of message type names the dispatcher will accept as syntactically valid.
/// Anything outside this set (but otherwise well-formed) is `UNKNOWN_MESSAGE_TYPE`.
#[must_use]
pub fn is_known_type(name: &str) -> bool {
    use message_type::*;
    matches!(
        name,
        AUTH | AUTH_SUCCESS
            | AUTH_ERROR
            | SUBSCRIBE
            | UNSUBSCRIBE
            | SYNC_REQUEST
            | SYNC_RESPONSE
            | SYNC_STEP1
            | SYNC_STEP2
            | DELTA
            | ACK
            | DELTA_BATCH
            | PING
            | PONG
            | AWARENESS_UPDATE
            | AWARENESS_SUBSCRIBE
            | AWARENESS_STATE
            | ERROR
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_table_round_trips_every_known_name() {
        for name in [
            message_type::AUTH,
            message_type::AUTH_SUCCESS,
            message_type::AUTH_ERROR,
            message_type::SUBSCRIBE,
            message_type::UNSUBSCRIBE,
            message_type::SYNC_REQUEST,
            message_type::SYNC_RESPONSE,
            message_type::SYNC_STEP1,
            message_type::SYNC_STEP2,
            message_type::DELTA,
            message_type::ACK,
            message_type::DELTA_BATCH,
            message_type::PING,
            message_type::PONG,
            message_type::AWARENESS_UPDATE,
            message_type::AWARENESS_SUBSCRIBE,
            message_type::AWARENESS_STATE,
        ] {
            let code = name_to_code(name);
            assert_eq!(code_to_name(code), name, "round trip failed for {name}");
        }
    }

    #[test]
    fn unknown_code_decodes_to_error_sentinel() {
        assert_eq!(code_to_name(0x99), message_type::ERROR);
    }

    #[test]
    fn unknown_name_encodes_to_error_code() {
        assert_eq!(name_to_code("not_a_real_type"), 0xFF);
    }

    #[test]
    fn type_codes_match_the_frozen_table() {
        assert_eq!(name_to_code(message_type::AUTH), 0x01);
        assert_eq!(name_to_code(message_type::AUTH_SUCCESS), 0x02);
        assert_eq!(name_to_code(message_type::AUTH_ERROR), 0x03);
        assert_eq!(name_to_code(message_type::SUBSCRIBE), 0x10);
        assert_eq!(name_to_code(message_type::UNSUBSCRIBE), 0x11);
        assert_eq!(name_to_code(message_type::SYNC_REQUEST), 0x12);
        assert_eq!(name_to_code(message_type::SYNC_RESPONSE), 0x13);
        assert_eq!(name_to_code(message_type::SYNC_STEP1), 0x14);
        assert_eq!(name_to_code(message_type::SYNC_STEP2), 0x15);
        assert_eq!(name_to_code(message_type::DELTA), 0x20);
        assert_eq!(name_to_code(message_type::ACK), 0x21);
        assert_eq!(name_to_code(message_type::DELTA_BATCH), 0x22);
        assert_eq!(name_to_code(message_type::PING), 0x30);
        assert_eq!(name_to_code(message_type::PONG), 0x31);
        assert_eq!(name_to_code(message_type::AWARENESS_UPDATE), 0x40);
        assert_eq!(name_to_code(message_type::AWARENESS_SUBSCRIBE), 0x41);
        assert_eq!(name_to_code(message_type::AWARENESS_STATE), 0x42);
        assert_eq!(name_to_code(message_type::ERROR), 0xFF);
    }
}
