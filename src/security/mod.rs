pub mod document_id;
pub mod rate_limit;

pub use document_id::{can_access_document, validate_document_id};
pub use rate_limit::SecurityManager;

/// Shape check applied before dispatch (§4.8): the decoded type name must
/// be one of the known wire types. Anything else is `UNKNOWN_MESSAGE_TYPE`,
/// not a framing failure — the frame itself decoded fine.
#[must_use]
pub fn is_valid_message_type(type_name: &str) -> bool {
    synckit_protocol::is_known_type(type_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_are_valid() {
        assert!(is_valid_message_type(synckit_protocol::message_type::PING));
        assert!(is_valid_message_type(synckit_protocol::message_type::DELTA_BATCH));
    }

    #[test]
    fn unknown_type_is_invalid() {
        assert!(!is_valid_message_type("not_a_real_type"));
    }
}
