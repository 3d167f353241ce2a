//! Hash identifiers for concrete specs.
//!
//! A [`ConcreteHash`] is the complete 32-character DAG hash of a concrete
//! spec. A [`HashPrefix`] is what a user types after `/`: any lowercase
//! prefix of such a hash. Containment is prefix matching.

use crate::spec::SpecError;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::ops::Deref;

/// Length of a complete DAG hash, in characters.
pub const FULL_HASH_STRING_LENGTH: usize = 32;

/// Characters shown when a hash is abbreviated for display.
pub const SHORT_HASH_LENGTH: usize = 7;

macro_rules! hash_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                $name::parse(&text).map_err(serde::de::Error::custom)
            }
        }

        impl std::str::FromStr for $name {
            type Err = SpecError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $name::parse(s)
            }
        }
    };
}

hash_newtype!(
    /// A lowercase prefix of a DAG hash, at most [`FULL_HASH_STRING_LENGTH`] long.
    HashPrefix
);

hash_newtype!(
    /// A complete DAG hash, exactly [`FULL_HASH_STRING_LENGTH`] characters.
    ConcreteHash
);

fn normalize(text: &str) -> Result<String, SpecError> {
    let text = text.trim().trim_start_matches('/').to_ascii_lowercase();
    if text.is_empty()
        || text.len() > FULL_HASH_STRING_LENGTH
        || !text.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return Err(SpecError::InvalidHash(text));
    }
    Ok(text)
}

impl HashPrefix {
    /// Accepts an optional leading `/`; upper case is folded.
    pub fn parse(text: &str) -> Result<Self, SpecError> {
        normalize(text).map(Self)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl ConcreteHash {
    pub fn parse(text: &str) -> Result<Self, SpecError> {
        let text = normalize(text)?;
        if text.len() != FULL_HASH_STRING_LENGTH {
            return Err(SpecError::InvalidHash(text));
        }
        Ok(Self(text))
    }

    /// Hash of `bytes`: the first 32 hex characters of its blake3 digest.
    pub fn digest(bytes: &[u8]) -> Self {
        let hex = blake3::hash(bytes).to_hex();
        Self(hex[..FULL_HASH_STRING_LENGTH].to_owned())
    }

    pub fn short(&self) -> &str {
        &self.0[..SHORT_HASH_LENGTH]
    }

    pub fn to_prefix(&self) -> HashPrefix {
        HashPrefix(self.0.clone())
    }
}

/// Anything usable as a lookup key against complete hashes.
pub trait PartialHash {
    fn prefix(&self) -> &str;

    /// `self in full`: the complete hash starts with this prefix.
    fn is_prefix_of(&self, full: &ConcreteHash) -> bool {
        full.as_str().starts_with(self.prefix())
    }
}

/// A hash that identifies exactly one concrete spec.
pub trait CompleteHash: PartialHash {
    fn complete(&self) -> &ConcreteHash;
}

impl PartialHash for HashPrefix {
    fn prefix(&self) -> &str {
        &self.0
    }
}

impl PartialHash for ConcreteHash {
    fn prefix(&self) -> &str {
        &self.0
    }
}

impl CompleteHash for ConcreteHash {
    fn complete(&self) -> &ConcreteHash {
        self
    }
}
