//! Recoverability classifier for error messages.
//!
//! A message matching one of these signatures means the session is presumed
//! dead: it is discarded and the call is re-issued on a fresh process.

/// Ordered signature table, matched case-insensitively as substrings.
pub const RECOVERABLE_SIGNATURES: &[&str] = &[
    "connection closed",
    "not connected",
    "broken pipe",
    "epipe",
    "econnreset",
    "connection reset",
    "transport error",
    "transport closed",
    "client is closed",
];

/// The first signature contained in `message`, if any.
pub fn matching_signature(message: &str) -> Option<&'static str> {
    let lower = message.to_ascii_lowercase();
    RECOVERABLE_SIGNATURES
        .iter()
        .copied()
        .find(|sig| lower.contains(sig))
}

/// Whether `message` describes a dead or broken session.
pub fn is_recoverable_message(message: &str) -> bool {
    matching_signature(message).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_signatures_match() {
        let cases = [
            ("MCP error -32000: Connection closed", "connection closed"),
            ("Not connected", "not connected"),
            ("write EPIPE", "epipe"),
            ("Broken pipe (os error 32)", "broken pipe"),
            ("read ECONNRESET", "econnreset"),
            ("Connection reset by peer", "connection reset"),
            ("Client is closed", "client is closed"),
            ("transport error: stdout closed", "transport error"),
        ];
        for (message, expected) in cases {
            assert_eq!(matching_signature(message), Some(expected), "{message}");
        }
    }

    #[test]
    fn test_application_messages_do_not_match() {
        for message in [
            "Entity not found: notes/missing",
            "Text to replace not found: 'foo'",
            "Section '## Tasks' not found",
            "Invalid params: missing field `identifier`",
        ] {
            assert!(!is_recoverable_message(message), "{message}");
        }
    }

    #[test]
    fn test_table_order_decides_first_match() {
        // "Broken pipe" is listed before "epipe"; both would match "EPIPE broken pipe".
        assert_eq!(matching_signature("EPIPE broken pipe"), Some("broken pipe"));
    }
}
