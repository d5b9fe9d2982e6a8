//! Store path identifiers.
//!
//! Fetched source trees and build artifacts are both referred to by
//! their store path, a direct child of [STORE_DIR] made of a
//! nixbase32-encoded digest and a name.

use std::{fmt, str::FromStr};

use data_encoding::HEXLOWER;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::nixbase32;

pub const DIGEST_SIZE: usize = 20;
pub const ENCODED_DIGEST_SIZE: usize = nixbase32::encode_len(DIGEST_SIZE);

/// The store dir prefix, without trailing slash.
pub const STORE_DIR: &str = "/nix/store";
pub const STORE_DIR_WITH_SLASH: &str = "/nix/store/";

/// Errors that can occur when parsing a literal store path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("'{0}' is not in the Nix store")]
    MissingStoreDir(String),
    #[error("store path '{0}' is too short")]
    InvalidLength(String),
    #[error("store path '{path}' has an invalid digest: {error}")]
    InvalidDigest {
        path: String,
        error: nixbase32::DecodeError,
    },
    #[error("store path '{0}' is missing the dash between digest and name")]
    MissingDash(String),
    #[error("store path name '{name}' has an invalid character at position {position}")]
    InvalidName { name: String, position: usize },
}

/// A path in the Nix store, without any subpath inside it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath {
    digest: [u8; DIGEST_SIZE],
    name: String,
}

impl StorePath {
    /// Parses the `$digest-$name` part following [STORE_DIR_WITH_SLASH].
    pub fn from_base_name(s: &str) -> Result<Self, Error> {
        if s.len() < ENCODED_DIGEST_SIZE + 2 {
            return Err(Error::InvalidLength(s.to_string()));
        }

        let (encoded, rest) = s.as_bytes().split_at(ENCODED_DIGEST_SIZE);
        let digest = nixbase32::decode(encoded).map_err(|error| Error::InvalidDigest {
            path: s.to_string(),
            error,
        })?;

        let name = rest
            .strip_prefix(b"-")
            .ok_or_else(|| Error::MissingDash(s.to_string()))?;
        let name = std::str::from_utf8(name).map_err(|e| Error::InvalidName {
            name: String::from_utf8_lossy(name).into_owned(),
            position: e.valid_up_to(),
        })?;

        Ok(StorePath {
            digest: digest
                .try_into()
                .map_err(|_| Error::InvalidLength(s.to_string()))?,
            name: validate_name(name)?,
        })
    }

    /// Parses an absolute path like `/nix/store/$digest-$name`.
    pub fn from_absolute_path(s: &str) -> Result<Self, Error> {
        match s.strip_prefix(STORE_DIR_WITH_SLASH) {
            Some(base_name) => Self::from_base_name(base_name),
            None => Err(Error::MissingStoreDir(s.to_string())),
        }
    }

    /// Computes the path a source tree with the given NAR sha256 digest is
    /// stored at, the same way fixed-output sources are addressed.
    pub fn for_source(nar_sha256: &[u8; 32], name: &str) -> Result<Self, Error> {
        let name = validate_name(name)?;
        let fingerprint = format!(
            "source:sha256:{}:{}:{}",
            HEXLOWER.encode(nar_sha256),
            STORE_DIR,
            name
        );
        let digest = Sha256::digest(fingerprint.as_bytes());

        Ok(StorePath {
            digest: compress_hash(&digest),
            name,
        })
    }

    pub fn digest(&self) -> &[u8; DIGEST_SIZE] {
        &self.digest
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Derivations are store paths whose name ends in `.drv`.
    pub fn is_derivation(&self) -> bool {
        self.name.ends_with(".drv")
    }

    pub fn to_absolute_path(&self) -> String {
        format!("{}{}", STORE_DIR_WITH_SLASH, self)
    }
}

/// XOR-folds a digest down to [DIGEST_SIZE] bytes.
fn compress_hash(input: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut output = [0; DIGEST_SIZE];
    for (i, b) in input.iter().enumerate() {
        output[i % DIGEST_SIZE] ^= b;
    }
    output
}

fn validate_name(name: &str) -> Result<String, Error> {
    if name.is_empty() {
        return Err(Error::InvalidLength(name.to_string()));
    }

    for (position, c) in name.bytes().enumerate() {
        let valid = c.is_ascii_alphanumeric()
            || (c == b'.' && position != 0)
            || matches!(c, b'-' | b'_' | b'+' | b'?' | b'=');

        if !valid {
            return Err(Error::InvalidName {
                name: name.to_string(),
                position,
            });
        }
    }

    Ok(name.to_string())
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", nixbase32::encode(&self.digest), self.name)
    }
}

impl FromStr for StorePath {
    type Err = Error;

    /// Accepts both absolute paths and bare `$digest-$name` strings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('/') {
            Self::from_absolute_path(s)
        } else {
            Self::from_base_name(s)
        }
    }
}

impl Serialize for StorePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_absolute_path())
    }
}

impl<'de> Deserialize<'de> for StorePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
