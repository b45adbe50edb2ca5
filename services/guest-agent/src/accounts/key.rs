//! The `windows-keys` credential entry.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

/// One line of the `windows-keys` attribute.
///
/// Identity is the public key alone: two entries with the same modulus and
/// exponent are the same key even if the user name, expiry, or email differ.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowsKey {
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "String::is_empty"
    )]
    pub email: String,

    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "String::is_empty"
    )]
    pub expire_on: String,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub exponent: String,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub modulus: String,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub user_name: String,

    /// OAEP hash requested by the client (`sha1` when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_function: Option<String>,
}

/// Missing and `null` string fields both read as empty.
fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl WindowsKey {
    /// Parse one JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Serialized form recorded in the side-store.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// All identity fields and the user name are present.
    pub fn is_complete(&self) -> bool {
        !self.modulus.is_empty() && !self.exponent.is_empty() && !self.user_name.is_empty()
    }

    /// Parsed expiry. `None` when absent or unparsable.
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        if self.expire_on.is_empty() {
            return None;
        }

        if let Ok(at) = DateTime::parse_from_rfc3339(&self.expire_on) {
            return Some(at.with_timezone(&Utc));
        }

        // Timestamps without an offset are taken as UTC.
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(&self.expire_on, fmt).ok())
            .map(|naive| naive.and_utc())
    }

    /// Whether the key expired strictly before `now`.
    ///
    /// An expiry that cannot be parsed never expires.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiry() {
            Some(at) => now > at,
            None => {
                if !self.expire_on.is_empty() {
                    debug!(
                        user = %self.user_name,
                        expire_on = %self.expire_on,
                        "Expiration timestamp could not be parsed, not expiring key"
                    );
                }
                false
            }
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Usable for account creation right now.
    pub fn is_valid(&self) -> bool {
        self.is_complete() && !self.is_expired()
    }
}

impl PartialEq for WindowsKey {
    fn eq(&self, other: &Self) -> bool {
        self.modulus == other.modulus && self.exponent == other.exponent
    }
}

impl Eq for WindowsKey {}

impl Hash for WindowsKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.modulus.hash(state);
        self.exponent.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;

    fn key(user: &str, modulus: &str, expire_on: &str) -> WindowsKey {
        WindowsKey {
            user_name: user.to_string(),
            modulus: modulus.to_string(),
            exponent: "AQAB".to_string(),
            expire_on: expire_on.to_string(),
            ..WindowsKey::default()
        }
    }

    #[test]
    fn test_identity_ignores_user_and_expiry() {
        let a = key("alice", "m1", "");
        let b = WindowsKey {
            email: "someone@example.com".to_string(),
            ..key("bob", "m1", "2030-01-01T00:00:00Z")
        };

        assert_eq!(a, b);
        assert_eq!(HashSet::from([a]), HashSet::from([b]));
        assert_ne!(key("alice", "m1", ""), key("alice", "m2", ""));
    }

    #[test]
    fn test_parse_line() {
        let line = r#"{"userName":"alice","modulus":"mod","exponent":"AQAB","email":"a@example.com","expireOn":"2030-01-01T00:00:00Z","hashFunction":"sha256"}"#;
        let key = WindowsKey::from_line(line).unwrap();

        assert_eq!(key.user_name, "alice");
        assert_eq!(key.email, "a@example.com");
        assert_eq!(key.hash_function.as_deref(), Some("sha256"));
        assert!(key.is_complete());
    }

    #[test]
    fn test_to_line_skips_empty_optionals() {
        let line = key("alice", "mod", "").to_line().unwrap();
        assert_eq!(line, r#"{"exponent":"AQAB","modulus":"mod","userName":"alice"}"#);
        assert_eq!(WindowsKey::from_line(&line).unwrap(), key("alice", "mod", ""));
    }

    #[test]
    fn test_null_fields_read_as_empty() {
        let line = r#"{"userName":"alice","modulus":"bW9k","exponent":"AQAB","email":null,"expireOn":null,"hashFunction":null}"#;
        let key = WindowsKey::from_line(line).unwrap();

        assert!(key.email.is_empty());
        assert!(key.expire_on.is_empty());
        assert!(key.hash_function.is_none());
        assert!(key.is_valid());

        let key = WindowsKey::from_line(r#"{"userName":null,"modulus":"bW9k","exponent":"AQAB"}"#)
            .unwrap();
        assert!(!key.is_complete());
    }

    #[test]
    fn test_unparsable_expiry_stays_below_info() {
        let (logs, _guard) = crate::testing::CapturedLogs::install(tracing::Level::INFO);
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let k = key("alice", "m", "next tuesday");

        for _ in 0..3 {
            assert!(!k.is_expired_at(now));
        }
        assert_eq!(logs.count("could not be parsed"), 0);
    }

    #[rstest]
    #[case("", false)]
    #[case("2020-01-01T00:00:00Z", true)]
    #[case("2020-01-01T00:00:00+02:00", true)]
    #[case("2020-01-01T00:00:00", true)]
    #[case("2020-01-01T00:00:00.123", true)]
    #[case("2099-01-01T00:00:00Z", false)]
    #[case("not a date", false)]
    fn test_expiry(#[case] expire_on: &str, #[case] expired: bool) {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(key("alice", "m", expire_on).is_expired_at(now), expired);
    }

    #[test]
    fn test_expiry_boundary_is_strict() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let k = key("alice", "m", "2024-06-01T00:00:00Z");

        assert!(!k.is_expired_at(at));
        assert!(k.is_expired_at(at + chrono::Duration::seconds(1)));
    }

    #[rstest]
    #[case(key("", "m", ""))]
    #[case(key("alice", "", ""))]
    #[case(WindowsKey { exponent: String::new(), ..key("alice", "m", "") })]
    fn test_incomplete_keys_invalid(#[case] key: WindowsKey) {
        assert!(!key.is_complete());
        assert!(!key.is_valid());
    }
}
