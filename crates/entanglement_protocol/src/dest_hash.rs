//! Peer identities.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

const NI_SCHEME: &str = "ni://";
const NI_ALGORITHM: &str = "/sha-256;";

/// A 32-byte SHA-256 identity of a destination.
///
/// Rendered as an RFC 6920 URI, `ni:///sha-256;<url-safe base64>`.
/// Ordering is bytewise and decides which side yields when two
/// endpoints dial each other at the same time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestHash([u8; 32]);

impl DestHash {
    /// Length of the hash in bytes.
    pub const LEN: usize = 32;

    /// Wraps raw hash bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Wraps a slice that must be exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> ProtocolResult<Self> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidDestHash(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hashes an arbitrary UTF-8 string.
    pub fn from_string(s: &str) -> Self {
        Self(Sha256::digest(s.as_bytes()).into())
    }

    /// Hashes a DER-encoded X.509 certificate.
    pub fn from_certificate_der(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }

    /// Derives an identity from Unix socket peer credentials.
    ///
    /// Colons in the path are replaced so the encoding stays prefix free.
    pub fn from_unix_dest_info(path: &str, pid: u32, uid: u32, gid: u32) -> Self {
        let path = path.replace(':', "_");
        Self::from_string(&format!("{path}:{pid}:{uid}:{gid}"))
    }
}

impl fmt::Display for DestHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{NI_SCHEME}{NI_ALGORITHM}{}",
            base64::encode_config(self.0, base64::URL_SAFE)
        )
    }
}

impl fmt::Debug for DestHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DestHash({self})")
    }
}

impl FromStr for DestHash {
    type Err = ProtocolError;

    /// Accepts the full `ni://` URI or the bare base64 text.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = match s.strip_prefix(NI_SCHEME) {
            Some(rest) => {
                let start = rest
                    .find(NI_ALGORITHM)
                    .ok_or_else(|| ProtocolError::InvalidDestHash(s.to_string()))?;
                let authority = &rest[..start];
                if authority.contains('/') {
                    return Err(ProtocolError::InvalidDestHash(s.to_string()));
                }
                &rest[start + NI_ALGORITHM.len()..]
            }
            None => s,
        };
        let bytes = base64::decode_config(encoded, base64::URL_SAFE)
            .map_err(|e| ProtocolError::InvalidDestHash(format!("{s}: {e}")))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for DestHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DestHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
