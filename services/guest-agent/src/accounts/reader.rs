//! Desired accounts from the `windows-keys` instance attribute.

use std::collections::HashSet;

use gce_metadata::MetadataDocument;
use gce_reconcile::Reader;
use tracing::debug;

use super::key::WindowsKey;

/// Instance attribute holding one JSON key per line.
pub const WINDOWS_KEYS: &str = "windows-keys";

/// Instance attribute that disables account management.
pub const DISABLE_ACCOUNT_MANAGER: &str = "disable-account-manager";

/// Desired accounts, keyed by public-key identity.
pub type KeySet = HashSet<WindowsKey>;

/// Parse the raw attribute value into valid, unexpired keys.
///
/// Lines that are not JSON, or that fail validation, are dropped.
pub fn parse_windows_keys(raw: &str) -> KeySet {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match WindowsKey::from_line(line) {
            Ok(key) => Some(key),
            Err(e) => {
                debug!(error = %e, "Dropping malformed windows-key line");
                None
            }
        })
        .filter(WindowsKey::is_valid)
        .collect()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AccountsReader;

impl Reader<KeySet> for AccountsReader {
    fn extract(&self, document: &MetadataDocument) -> Option<KeySet> {
        let attributes = document.instance_attributes()?;
        Some(
            attributes
                .get(WINDOWS_KEYS)
                .map(parse_windows_keys)
                .unwrap_or_default(),
        )
    }

    fn equal(&self, a: Option<&KeySet>, b: Option<&KeySet>) -> bool {
        a == b
    }

    fn is_enabled(&self, document: &MetadataDocument) -> bool {
        !document
            .instance_attributes()
            .and_then(|a| a.flag(DISABLE_ACCOUNT_MANAGER))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn line(user: &str, modulus: &str) -> String {
        json!({"userName": user, "modulus": modulus, "exponent": "AQAB"}).to_string()
    }

    fn document(attributes: serde_json::Value) -> MetadataDocument {
        MetadataDocument::from_slice(
            json!({"instance": {"attributes": attributes}}).to_string().as_bytes(),
        )
        .unwrap()
    }

    fn users(keys: &KeySet) -> Vec<String> {
        let mut users: Vec<String> = keys.iter().map(|k| k.user_name.clone()).collect();
        users.sort();
        users
    }

    #[test]
    fn test_extract_two_users() {
        let raw = format!("{}\n{}", line("alice", "m1"), line("bob", "m2"));
        let keys = AccountsReader.extract(&document(json!({"windows-keys": raw}))).unwrap();

        assert_eq!(users(&keys), vec!["alice", "bob"]);
    }

    #[test]
    fn test_malformed_and_invalid_lines_dropped() {
        let expired = json!({
            "userName": "old", "modulus": "m3", "exponent": "AQAB",
            "expireOn": "2001-01-01T00:00:00Z"
        })
        .to_string();
        let unparsable_expiry = json!({
            "userName": "carol", "modulus": "m4", "exponent": "AQAB",
            "expireOn": "someday"
        })
        .to_string();
        let raw = [
            line("alice", "m1"),
            "{not json".to_string(),
            line("", "m2"),
            expired,
            unparsable_expiry,
            String::new(),
        ]
        .join("\r\n");

        let keys = AccountsReader.extract(&document(json!({"windows-keys": raw}))).unwrap();
        assert_eq!(users(&keys), vec!["alice", "carol"]);
    }

    #[test]
    fn test_null_optional_fields_keep_key() {
        let raw = r#"{"userName":"alice","modulus":"bW9k","exponent":"AQAB","email":null,"expireOn":null}"#;
        let keys = parse_windows_keys(raw);

        assert_eq!(users(&keys), vec!["alice"]);
    }

    #[test]
    fn test_absent_attribute_is_empty_set() {
        let keys = AccountsReader.extract(&document(json!({"other": "x"}))).unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn test_absent_attributes_is_none() {
        assert!(AccountsReader.extract(&MetadataDocument::default()).is_none());
    }

    #[test]
    fn test_equal_null_handling() {
        let empty = KeySet::new();
        let one = parse_windows_keys(&line("alice", "m1"));

        assert!(AccountsReader.equal(None, None));
        assert!(!AccountsReader.equal(None, Some(&one)));
        assert!(!AccountsReader.equal(Some(&one), None));
        assert!(AccountsReader.equal(Some(&empty), Some(&KeySet::new())));
    }

    #[test]
    fn test_disable_flag() {
        assert!(AccountsReader.is_enabled(&MetadataDocument::default()));
        assert!(AccountsReader.is_enabled(&document(json!({}))));
        assert!(!AccountsReader.is_enabled(&document(json!({"disable-account-manager": "true"}))));
        assert!(AccountsReader.is_enabled(&document(json!({"disable-account-manager": "false"}))));
        assert!(AccountsReader.is_enabled(&document(json!({"disable-account-manager": "maybe"}))));
    }

    proptest! {
        #[test]
        fn prop_order_insensitive(moduli in prop::collection::hash_set("[a-z]{4,8}", 0..8), seed in any::<u64>()) {
            let lines: Vec<String> = moduli.iter().map(|m| line("user", m)).collect();
            let mut shuffled = lines.clone();
            // Deterministic rotation stands in for a permutation.
            if !shuffled.is_empty() {
                let by = (seed as usize) % shuffled.len();
                shuffled.rotate_left(by);
                shuffled.reverse();
            }

            let a = parse_windows_keys(&lines.join("\n"));
            let b = parse_windows_keys(&shuffled.join("\n"));
            prop_assert!(AccountsReader.equal(Some(&a), Some(&b)));
        }

        #[test]
        fn prop_identity_is_public_key_only(modulus in "[a-z]{4,8}", u1 in "[a-z]{1,8}", u2 in "[a-z]{1,8}") {
            let a = parse_windows_keys(&line(&u1, &modulus));
            let b = parse_windows_keys(&line(&u2, &modulus));
            prop_assert!(AccountsReader.equal(Some(&a), Some(&b)));
        }
    }
}
