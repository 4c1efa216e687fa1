//! Opt-in (consent) records and codewords.

use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Codeword alphabet: uppercase ASCII letters and digits.
const CODEWORD_ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Number of characters in a generated codeword.
pub const CODEWORD_LEN: usize = 10;

/// Largest multiple of the alphabet size that fits in a byte. Bytes at or
/// above it are rejected so every character is drawn uniformly.
const REJECTION_BOUND: u8 = (256 / CODEWORD_ALPHABET.len() * CODEWORD_ALPHABET.len()) as u8;

/// Consent state of a single phone number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptInStatus {
    /// Consent has not been requested yet.
    #[serde(rename = "ask")]
    Ask,
    /// The opt-in question has been sent; awaiting a reply.
    #[serde(rename = "asked")]
    Asked,
    /// The number has opted in.
    #[serde(rename = "true")]
    True,
    /// The number has opted out.
    #[serde(rename = "false")]
    False,
}

impl OptInStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ask => "ask",
            Self::Asked => "asked",
            Self::True => "true",
            Self::False => "false",
        }
    }

    /// Status after a codeword-authenticated reply.
    pub fn toggled(self) -> Self {
        match self {
            Self::True => Self::False,
            Self::False | Self::Ask | Self::Asked => Self::True,
        }
    }

    /// Whether consent is still outstanding.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Ask | Self::Asked)
    }
}

impl std::fmt::Display for OptInStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OptInStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ask" => Ok(Self::Ask),
            "asked" => Ok(Self::Asked),
            "true" => Ok(Self::True),
            "false" => Ok(Self::False),
            _ => Err(Error::InvalidArgument(format!("unknown opt-in status: {s}"))),
        }
    }
}

/// Per-number consent record. One row per canonical phone number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptIn {
    pub id: Uuid,
    /// Canonical phone number (unique).
    pub number: String,
    /// Shared secret included in the outbound opt-in question.
    pub codeword: String,
    pub status: OptInStatus,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl OptIn {
    /// Fresh record in `Ask` with a newly generated codeword.
    pub fn new(number: impl Into<String>) -> Result<Self, Error> {
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            number: number.into(),
            codeword: generate_codeword()?,
            status: OptInStatus::Ask,
            created: now,
            updated: now,
        })
    }

    /// Case-insensitive substring match of the codeword inside `reply`.
    ///
    /// This is the only check guarding a consent toggle. It proves the
    /// sender saw the opt-in question, not who the sender is.
    pub fn matches_codeword(&self, reply: &str) -> bool {
        !self.codeword.is_empty()
            && reply
                .to_ascii_uppercase()
                .contains(&self.codeword.to_ascii_uppercase())
    }
}

/// Generate a codeword from the operating system's secure random source.
///
/// Fails closed with [`Error::Entropy`] if the source is unavailable.
pub fn generate_codeword() -> Result<String, Error> {
    generate_codeword_with(&mut OsRng)
}

fn generate_codeword_with<R: RngCore>(rng: &mut R) -> Result<String, Error> {
    let mut codeword = String::with_capacity(CODEWORD_LEN);
    let mut buf = [0u8; 32];

    while codeword.len() < CODEWORD_LEN {
        rng.try_fill_bytes(&mut buf)
            .map_err(|e| Error::Entropy(e.to_string()))?;
        for byte in buf {
            if byte >= REJECTION_BOUND {
                continue;
            }
            codeword.push(CODEWORD_ALPHABET[(byte as usize) % CODEWORD_ALPHABET.len()] as char);
            if codeword.len() == CODEWORD_LEN {
                break;
            }
        }
    }

    Ok(codeword)
}
