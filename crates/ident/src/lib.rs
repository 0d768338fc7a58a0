//! Generation-bound identifiers for tasks and subtasks
//!
//! Identifiers are 128-bit values in UUID-v1 layout: the high-order fields
//! are time-based (ordered within a generation, collision-resistant across
//! generations), the 48-bit node field is deterministically derived from a
//! generation seed (typically the owning node's public key). Any identifier
//! claiming a generation it cannot reproduce fails [`verify_generation`],
//! the anti-spoofing check used to confirm task/subtask lineage.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Number of seed bytes folded into the node field by default.
pub const DEFAULT_SEED_LENGTH: usize = 6;

/// Width of the UUID node field in bytes.
const NODE_FIELD_LEN: usize = 6;

/// Errors raised by identifier construction and parsing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidIdentifierError {
    /// Seed shorter than the requested derivation length.
    #[error("generation seed too short: need {need} bytes, got {got}")]
    SeedTooShort {
        /// Bytes required.
        need: usize,
        /// Bytes supplied.
        got: usize,
    },

    /// Derivation length outside `1..=6`.
    #[error("invalid seed length {0}: must be between 1 and 6")]
    BadSeedLength(usize),

    /// Textual form is not a valid identifier.
    #[error("malformed identifier: {0}")]
    Malformed(String),
}

/// A time-ordered, generation-bound 128-bit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(Uuid);

impl Identifier {
    /// The raw 16 bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// The 48-bit generation (node) field.
    pub fn generation_field(&self) -> [u8; NODE_FIELD_LEN] {
        let bytes = self.0.as_bytes();
        let mut node = [0u8; NODE_FIELD_LEN];
        node.copy_from_slice(&bytes[10..16]);
        node
    }

    /// Milliseconds since the Unix epoch encoded in the time field.
    pub fn timestamp_ms(&self) -> u64 {
        match self.0.get_timestamp() {
            Some(ts) => {
                let (secs, nanos) = ts.to_unix();
                secs * 1_000 + u64::from(nanos) / 1_000_000
            }
            None => 0,
        }
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl std::str::FromStr for Identifier {
    type Err = InvalidIdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Identifier)
            .map_err(|err| InvalidIdentifierError::Malformed(err.to_string()))
    }
}

/// Derive the 48-bit node field from the first `length` seed bytes,
/// interpreted as a big-endian integer (left-padded when `length < 6`).
fn node_field_from_seed(
    seed: &[u8],
    length: usize,
) -> Result<[u8; NODE_FIELD_LEN], InvalidIdentifierError> {
    if length == 0 || length > NODE_FIELD_LEN {
        return Err(InvalidIdentifierError::BadSeedLength(length));
    }
    if seed.len() < length {
        return Err(InvalidIdentifierError::SeedTooShort {
            need: length,
            got: seed.len(),
        });
    }
    let mut node = [0u8; NODE_FIELD_LEN];
    node[NODE_FIELD_LEN - length..].copy_from_slice(&seed[..length]);
    Ok(node)
}

/// Generate a new identifier bound to `seed`, using the default seed length.
pub fn generate(seed: &[u8]) -> Result<Identifier, InvalidIdentifierError> {
    generate_with_length(seed, DEFAULT_SEED_LENGTH)
}

/// Generate a new identifier whose node field derives from the first
/// `length` bytes of `seed`.
pub fn generate_with_length(
    seed: &[u8],
    length: usize,
) -> Result<Identifier, InvalidIdentifierError> {
    let node = node_field_from_seed(seed, length)?;
    Ok(Identifier(Uuid::now_v1(&node)))
}

/// Mint a new identifier inheriting `parent`'s generation field.
///
/// Used to derive subtask ids from a task id so that lineage can later be
/// confirmed against the same generation seed.
pub fn derive(parent: &Identifier) -> Identifier {
    Identifier(Uuid::now_v1(&parent.generation_field()))
}

/// Check that `id` belongs to the generation produced by `seed`, using the
/// default seed length.
pub fn verify_generation(id: &Identifier, seed: &[u8]) -> Result<bool, InvalidIdentifierError> {
    verify_generation_with_length(id, seed, DEFAULT_SEED_LENGTH)
}

/// Check that `id` belongs to the generation produced by the first `length`
/// bytes of `seed`.
pub fn verify_generation_with_length(
    id: &Identifier,
    seed: &[u8],
    length: usize,
) -> Result<bool, InvalidIdentifierError> {
    let expected = node_field_from_seed(seed, length)?;
    Ok(id.generation_field() == expected)
}
