//! Key definitions.

use crate::{define_key, IdError};

/// Maximum length of any key, in bytes.
///
/// Matches the EC2 tag value limit, which is the tightest of the systems a
/// correlation key travels through.
pub const MAX_KEY_LEN: usize = 255;

define_key!(CorrelationKey, "correlation key");
define_key!(NodeId, "node id");
define_key!(InstanceId, "instance id");

#[doc(hidden)]
pub fn validate_key(kind: &'static str, s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty { kind });
    }

    if s.len() > MAX_KEY_LEN {
        return Err(IdError::TooLong {
            kind,
            len: s.len(),
            max: MAX_KEY_LEN,
        });
    }

    if let Some((index, ch)) = s
        .char_indices()
        .find(|(_, c)| c.is_whitespace() || c.is_control())
    {
        return Err(IdError::InvalidCharacter { kind, ch, index });
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_correlation_key_roundtrip() {
        let key: CorrelationKey = "caa1dd48-bd8a-4bc0-907a-76fa0207ce33".parse().unwrap();
        assert_eq!(key.as_str(), "caa1dd48-bd8a-4bc0-907a-76fa0207ce33");
        assert_eq!(key.to_string(), "caa1dd48-bd8a-4bc0-907a-76fa0207ce33");
    }

    #[test]
    fn test_empty_rejected() {
        let err = CorrelationKey::parse("").unwrap_err();
        assert!(err.is_empty());
        assert_eq!(err.to_string(), "correlation key cannot be empty");
    }

    #[test]
    fn test_whitespace_rejected() {
        let err = InstanceId::parse("i-123 ").unwrap_err();
        assert_eq!(
            err,
            IdError::InvalidCharacter {
                kind: "instance id",
                ch: ' ',
                index: 5
            }
        );
    }

    #[test]
    fn test_control_character_rejected() {
        assert!(NodeId::parse("node\u{0}1").is_err());
    }

    #[test]
    fn test_too_long_rejected() {
        let long = "a".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(
            CorrelationKey::parse(&long),
            Err(IdError::TooLong { len: 256, .. })
        ));
        assert!(CorrelationKey::parse(&long[..MAX_KEY_LEN]).is_ok());
    }

    #[test]
    fn test_try_from_string_validates() {
        let key = CorrelationKey::try_from("abc-1".to_string()).unwrap();
        assert_eq!(key.as_str(), "abc-1");
        assert!(matches!(
            InstanceId::try_from(String::new()),
            Err(IdError::Empty { .. })
        ));
        assert!(InstanceId::try_from("i-0 1".to_string()).is_err());
    }

    proptest! {
        #[test]
        fn prop_printable_keys_accepted(s in "[A-Za-z0-9._:/-]{1,255}") {
            let key = CorrelationKey::parse(&s).unwrap();
            prop_assert_eq!(key.as_str(), s.as_str());
        }
    }
}
