//! ID and timestamp utilities for fundlink
//!
//! Provides message ids for request envelopes and the epoch clock stamped
//! into them.

use uuid::Uuid;

/// Get current timestamp in seconds since Unix epoch
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Generate a unique message ID
///
/// Format: hyphenated UUID v4 without braces
/// Example: `67e55044-10b1-426f-9247-bb680e5fe0c8`
pub fn generate_msg_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_now_secs_returns_reasonable_timestamp() {
        let ts = now_secs();
        // Should be after 2020-01-01 and before 2100-01-01
        assert!(ts > 1577836800);
        assert!(ts < 4102444800);
    }

    #[test]
    fn test_generate_msg_id_format() {
        let id = generate_msg_id();
        assert_eq!(id.len(), 36);
        assert!(!id.starts_with('{'));
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 5);
        assert!(parts.iter().all(|p| p.chars().all(|c| c.is_ascii_hexdigit())));
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_generate_msg_id_uniqueness() {
        let ids: HashSet<String> = (0..10_000).map(|_| generate_msg_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }
}
