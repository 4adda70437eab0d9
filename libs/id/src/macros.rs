//! Macros for defining validated string key types.

/// Macro to define an opaque, validated string key.
///
/// This generates a newtype wrapper around `String` with:
/// - A `KIND` constant used in error messages
/// - `parse()` to validate and wrap a string
/// - `as_str()` to borrow the raw value
/// - `Display`, `FromStr` and validating `TryFrom<String>` implementations
/// - `Ord`, `Hash`, and other standard traits
///
/// Validation rejects empty values, values longer than
/// [`MAX_KEY_LEN`](crate::MAX_KEY_LEN) bytes, and values containing
/// whitespace or control characters.
///
/// # Example
///
/// ```ignore
/// define_key!(CorrelationKey, "correlation key");
///
/// let key: CorrelationKey = "caa1dd48-bd8a-4bc0-907a-76fa0207ce33".parse()?;
/// ```
#[macro_export]
macro_rules! define_key {
    ($name:ident, $kind:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Human-readable name of this key kind.
            pub const KIND: &'static str = $kind;

            /// Validates and wraps a key.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::validate_key(Self::KIND, s)?;
                Ok(Self(s.to_string()))
            }

            /// Returns the raw key value.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = $crate::IdError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                $crate::validate_key(Self::KIND, &s)?;
                Ok(Self(s))
            }
        }
    };
}
