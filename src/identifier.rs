//! Identifier classification.
//!
//! Callers hand the engine a mix of integers and strings. Each raw input is
//! classified exactly once, before any network access, into an
//! [`Identifier`]: a database [`Key`], a compound [`Identifier::Name`], or a
//! [`Identifier::Structure`] string (SMILES and friends, treated as opaque).
//!
//! # Example
//!
//! ```
//! use chemfetch_core::identifier::{Identifier, Key, RawIdentifier, classify};
//!
//! assert_eq!(classify(&RawIdentifier::from(2244)), Ok(Identifier::Key(Key::new(2244).unwrap())));
//! assert_eq!(classify(&"aspirin".into()), Ok(Identifier::Name("aspirin".to_string())));
//! assert!(matches!(classify(&"CC(=O)O".into()), Ok(Identifier::Structure(_))));
//! assert!(classify(&RawIdentifier::from(0)).is_err());
//! ```

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Characters that never appear in a plain compound name but are common in
/// line notations. A whitespace-free string carrying one of them is a structure.
const STRUCTURAL_CHARS: &[char] = &['=', '#', '[', ']', '(', ')', '@', '/', '\\'];

#[allow(clippy::expect_used)]
static SMILES_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[=#\[\]()]|\d|Br|Cl|Si").expect("SMILES token regex is valid")
});

/// The remote service's canonical integer identifier for a compound (a CID).
///
/// Always strictly positive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Key(u64);

impl Key {
    /// Creates a key, rejecting zero.
    #[must_use]
    pub fn new(value: u64) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    /// Returns the raw integer value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An identifier exactly as the caller supplied it.
///
/// Integers and text are classified by [`classify`]; [`RawIdentifier::Structure`]
/// lets the caller force structure handling for text the heuristics would read
/// as a name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawIdentifier {
    /// An integer input.
    Integer(i64),
    /// A text input.
    Text(String),
    /// Text explicitly flagged as a structure string.
    Structure(String),
}

impl RawIdentifier {
    /// Flags `value` as a structure string.
    #[must_use]
    pub fn structure(value: impl Into<String>) -> Self {
        Self::Structure(value.into())
    }
}

impl fmt::Display for RawIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Text(value) | Self::Structure(value) => f.write_str(value),
        }
    }
}

impl From<i64> for RawIdentifier {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for RawIdentifier {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for RawIdentifier {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<Key> for RawIdentifier {
    fn from(key: Key) -> Self {
        Self::Integer(i64::try_from(key.get()).unwrap_or(i64::MAX))
    }
}

impl From<&str> for RawIdentifier {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for RawIdentifier {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// A classified identifier. Never re-inspected by type downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// A remote database key.
    Key(Key),
    /// A compound name (trimmed).
    Name(String),
    /// A structure line notation (trimmed, otherwise untouched).
    Structure(String),
}

impl Identifier {
    /// Short label for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Key(_) => "key",
            Self::Name(_) => "name",
            Self::Structure(_) => "structure",
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => write!(f, "{key}"),
            Self::Name(value) | Self::Structure(value) => f.write_str(value),
        }
    }
}

/// Why a raw input could not be classified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidIdentifier {
    /// Empty or whitespace-only text.
    #[error("identifier is empty")]
    Empty,

    /// Zero or negative key.
    #[error("key must be a positive integer, got {value}")]
    NonPositiveKey {
        /// The offending input.
        value: String,
    },

    /// Numeric text too large for a key.
    #[error("key {value} is out of range")]
    KeyOutOfRange {
        /// The offending input.
        value: String,
    },
}

/// Classifies a raw input. Pure; no network access.
///
/// # Errors
///
/// Returns [`InvalidIdentifier`] for empty text and for keys that are zero,
/// negative, or out of range.
pub fn classify(raw: &RawIdentifier) -> Result<Identifier, InvalidIdentifier> {
    match raw {
        RawIdentifier::Integer(value) => u64::try_from(*value)
            .ok()
            .and_then(Key::new)
            .map(Identifier::Key)
            .ok_or_else(|| InvalidIdentifier::NonPositiveKey {
                value: value.to_string(),
            }),
        RawIdentifier::Structure(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(InvalidIdentifier::Empty);
            }
            Ok(Identifier::Structure(trimmed.to_string()))
        }
        RawIdentifier::Text(value) => classify_text(value),
    }
}

fn classify_text(value: &str) -> Result<Identifier, InvalidIdentifier> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(InvalidIdentifier::Empty);
    }

    if is_all_digits(trimmed) {
        let parsed = trimmed
            .parse::<u64>()
            .map_err(|_| InvalidIdentifier::KeyOutOfRange {
                value: trimmed.to_string(),
            })?;
        return Key::new(parsed)
            .map(Identifier::Key)
            .ok_or_else(|| InvalidIdentifier::NonPositiveKey {
                value: trimmed.to_string(),
            });
    }

    if let Some(digits) = trimmed.strip_prefix('-')
        && is_all_digits(digits)
    {
        return Err(InvalidIdentifier::NonPositiveKey {
            value: trimmed.to_string(),
        });
    }

    if !trimmed.chars().any(char::is_whitespace) && trimmed.contains(STRUCTURAL_CHARS) {
        return Ok(Identifier::Structure(trimmed.to_string()));
    }

    Ok(Identifier::Name(trimmed.to_string()))
}

fn is_all_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// Loose check used for the name → structure lookup fallback.
///
/// Matches anything carrying bond symbols, ring-closure digits or the
/// two-letter organic-subset atoms.
#[must_use]
pub fn looks_like_smiles(value: &str) -> bool {
    !value.chars().any(char::is_whitespace) && SMILES_TOKENS.is_match(value)
}
