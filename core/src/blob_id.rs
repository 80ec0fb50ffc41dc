use std::{fmt, str::FromStr};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix marking a string as a blob reference.
pub const BLOB_SIGIL: char = '&';
const HASH_SUFFIX: &str = ".sha256";
const DIGEST_LEN: usize = 32;

/// Errors produced when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input does not start with the blob sigil.
    #[error("missing blob sigil in {0:?}")]
    MissingSigil(String),
    /// The input is not a sha256 reference.
    #[error("unsupported hash algorithm in {0:?}")]
    UnsupportedAlgorithm(String),
    /// The digest is not valid base64.
    #[error("invalid digest encoding in {input:?}: {reason}")]
    InvalidDigest {
        /// The rejected input
        input: String,
        /// Decoder failure
        reason: String,
    },
    /// The digest decoded to the wrong number of bytes.
    #[error("digest must be {DIGEST_LEN} bytes, got {0}")]
    DigestLength(usize),
}

/// A validated reference to a blob, in its external sigiled form `&<base64 sha256>.sha256`.
///
/// Blob stores key content by the desigiled form, see [`BlobId::desigiled`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobId(String);

impl BlobId {
    /// Parse a sigiled blob reference.
    pub fn parse(input: &str) -> Result<Self, IdError> {
        let rest = input
            .strip_prefix(BLOB_SIGIL)
            .ok_or_else(|| IdError::MissingSigil(input.to_owned()))?;
        let digest = rest
            .strip_suffix(HASH_SUFFIX)
            .ok_or_else(|| IdError::UnsupportedAlgorithm(input.to_owned()))?;
        let bytes = STANDARD
            .decode(digest)
            .map_err(|err| IdError::InvalidDigest {
                input: input.to_owned(),
                reason: err.to_string(),
            })?;
        if bytes.len() != DIGEST_LEN {
            return Err(IdError::DigestLength(bytes.len()));
        }
        Ok(Self(input.to_owned()))
    }

    /// Construct from a storage key, i.e. a hash without the sigil.
    pub fn from_desigiled(key: &str) -> Result<Self, IdError> {
        Self::parse(&resigil(key))
    }

    /// Compute the reference of the given content.
    pub fn for_bytes(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Self(format!(
            "{}{}{}",
            BLOB_SIGIL,
            STANDARD.encode(digest),
            HASH_SUFFIX
        ))
    }

    /// The storage key of this blob, the reference without its sigil.
    pub fn desigiled(&self) -> &str {
        &self.0[BLOB_SIGIL.len_utf8()..]
    }

    /// The sigiled reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Reports if the input is a well formed blob reference.
pub fn is_blob_ref(input: &str) -> bool {
    BlobId::parse(input).is_ok()
}

/// Strip the sigil from a blob reference. Other strings are returned unchanged.
pub fn desigil(input: &str) -> &str {
    if is_blob_ref(input) {
        &input[BLOB_SIGIL.len_utf8()..]
    } else {
        input
    }
}

/// Prefix a storage key with the blob sigil.
pub fn resigil(key: &str) -> String {
    format!("{BLOB_SIGIL}{key}")
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.0)
    }
}

impl FromStr for BlobId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BlobId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BlobId> for String {
    fn from(value: BlobId) -> Self {
        value.0
    }
}

impl AsRef<str> for BlobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
