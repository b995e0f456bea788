//! Tunnel tokens
//!
//! A token correlates a tunnel request signaled over a client's control
//! channel with the data connection the client dials back. Tokens are
//! 128-bit random values and are never reused; their canonical wire form is
//! the hyphenated lowercase UUID string.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a pending or bound tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(Uuid);

/// Error parsing a tunnel token from its wire form.
#[derive(Debug, thiserror::Error)]
#[error("invalid tunnel token: {0}")]
pub struct TokenParseError(#[from] uuid::Error);

impl TunnelId {
    /// Generate a fresh random token.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TunnelId {
    type Err = TokenParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}
