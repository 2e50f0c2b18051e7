//! Node ID generation and parsing
//!
//! IDs are 16 bytes rendered as 32 lowercase hex chars:
//! `{4-byte unix time}{4-byte remote digest}{8 random bytes}`.
//! Example: `6530a1f2c0a80001b7e15163a9d2f4c1`

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::RelayError;

/// Length of a node id in bytes
pub const NODE_ID_LEN: usize = 16;

/// Opaque node identifier, used only as a registry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Derive a fresh id for a remote endpoint (usually its IP address)
    ///
    /// Repeated calls with the same identifier (e.g. many nodes behind one
    /// NAT) produce distinct ids thanks to the random tail.
    pub fn from_remote(remote: &str) -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];

        let timestamp = chrono::Utc::now().timestamp() as u32;
        bytes[..4].copy_from_slice(&timestamp.to_be_bytes());

        let digest = Sha256::digest(remote.as_bytes());
        bytes[4..8].copy_from_slice(&digest[..4]);

        rand::rng().fill_bytes(&mut bytes[8..]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Unix timestamp (seconds) embedded at creation
    pub fn created_at(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Check whether this id was derived from the given remote identifier
    pub fn matches_remote(&self, remote: &str) -> bool {
        let digest = Sha256::digest(remote.as_bytes());
        self.0[4..8] == digest[..4]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for NodeId {
    type Err = RelayError;

    /// Anything that is not a well-formed id can't be registered either
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; NODE_ID_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| RelayError::NotRegistered(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl serde::Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
