//! Content-hash identifiers for packages in the remote archive

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of hex characters in a SHA-256 digest
pub const IDENTIFIER_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("expected {IDENTIFIER_LEN} hex characters, got {0}")]
    InvalidLength(usize),

    #[error("invalid character {0:?} in identifier")]
    InvalidCharacter(char),
}

/// Validated SHA-256 identifier of one package.
///
/// Accepts either case and stores the upper-case form, which is how the
/// remote index lists hashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        let raw = raw.trim();

        if let Some(bad) = raw.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(IdentifierError::InvalidCharacter(bad));
        }
        if raw.len() != IDENTIFIER_LEN {
            return Err(IdentifierError::InvalidLength(raw.len()));
        }

        Ok(Self(raw.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines
    pub fn short(&self) -> &str {
        &self.0[..10]
    }

    /// Compare against a hex digest computed elsewhere (any case)
    pub fn matches_digest(&self, hex_digest: &str) -> bool {
        self.0.eq_ignore_ascii_case(hex_digest)
    }
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identifier {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
