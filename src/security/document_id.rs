use once_cell::sync::Lazy;
use regex::Regex;

pub const MAX_DOCUMENT_ID_LEN: usize = 256;
pub const PLAYGROUND_DOC_ID: &str = "playground";

static DOCUMENT_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_:-]+$").expect("pattern is a valid regex literal"));

/// Validates document-id syntax (§4.4): non-empty, at most 256 chars,
/// `[A-Za-z0-9_:-]+`. Returns a descriptive reason on failure.
pub fn validate_document_id(doc_id: &str) -> Result<(), &'static str> {
    if doc_id.is_empty() {
        return Err("document id must not be empty");
    }
    if doc_id.len() > MAX_DOCUMENT_ID_LEN {
        return Err("document id exceeds 256 characters");
    }
    if !DOCUMENT_ID_PATTERN.is_match(doc_id) {
        return Err("document id contains characters outside [A-Za-z0-9_:-]");
    }
    Ok(())
}

/// Total function: never panics, always returns a boolean (§8).
#[must_use]
pub fn can_access_document(doc_id: &str) -> bool {
    if doc_id == PLAYGROUND_DOC_ID || doc_id.starts_with("playground:") {
        return true;
    }
    if doc_id == "wordwall" || doc_id.starts_with("wordwall:") {
        return true;
    }
    if doc_id.starts_with("room:") {
        return true;
    }
    let first_segment = doc_id.split(':').next().unwrap_or("");
    first_segment.len() >= 13 && first_segment.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_namespace_cases_from_the_spec() {
        assert!(can_access_document("playground"));
        assert!(can_access_document("playground:abc"));
        assert!(can_access_document("wordwall:x"));
        assert!(can_access_document("room:alpha"));
        assert!(can_access_document("1700000000000"));
        assert!(!can_access_document("foo"));
        assert!(!can_access_document("12345"));
    }

    #[test]
    fn timestamp_prefix_must_be_at_least_13_digits() {
        assert!(!can_access_document("1234567890123".get(..12).unwrap()));
        assert!(can_access_document("1234567890123"));
        assert!(can_access_document("12345678901234:page"));
    }

    #[test]
    fn bare_wordwall_without_colon_is_public() {
        assert!(can_access_document("wordwall"));
    }

    #[test]
    fn never_panics_on_arbitrary_input() {
        for s in ["", ":", "::::", "💥", "room", "playgroundx"] {
            let _ = can_access_document(s);
        }
    }

    #[test]
    fn empty_id_is_rejected() {
        assert!(validate_document_id("").is_err());
    }

    #[test]
    fn overlong_id_is_rejected() {
        let id = "a".repeat(257);
        assert!(validate_document_id(&id).is_err());
    }

    #[test]
    fn id_at_the_length_limit_is_accepted() {
        let id = "a".repeat(256);
        assert!(validate_document_id(&id).is_ok());
    }

    #[test]
    fn disallowed_characters_are_rejected() {
        assert!(validate_document_id("bad id!").is_err());
        assert!(validate_document_id("doc/with/slash").is_err());
    }

    #[test]
    fn allowed_characters_are_accepted() {
        assert!(validate_document_id("room:alpha-1_2:3").is_ok());
    }
}
