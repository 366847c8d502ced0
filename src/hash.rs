// src/hash.rs

//! State fingerprinting for deterministic deployments
//!
//! A [`StateHash`] is a fixed-width SHA-256 fingerprint of every input the
//! execution tree has consumed up to a point: file names, file contents,
//! rendered scripts, backup descriptors. Two runs that fold the same bytes
//! in the same order produce the same hash on every platform; that
//! determinism is the substrate the backup cache and the resume protocol
//! stand on.
//!
//! [`HashTransformer`] is the scoped accumulator: seeded with the inbound
//! hash, fed bytes and files, consumed exactly once by [`HashTransformer::finish`].
//! Ownership makes double-finalization and forgotten finalization
//! unrepresentable.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// A fixed-width fingerprint of deployment state
///
/// Total order and equality are byte-wise. Serializes as 64 lowercase hex
/// characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateHash([u8; Self::LEN]);

impl StateHash {
    /// Width of the hash in bytes
    pub const LEN: usize = 32;

    /// The fingerprint of zero bytes
    pub fn empty() -> Self {
        Self(Sha256::digest([]).into())
    }

    /// Raw hash bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Format as lowercase hex
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(Self::LEN * 2);
        for byte in &self.0 {
            s.push_str(&format!("{:02x}", byte));
        }
        s
    }

    /// Parse from hex; rejects wrong length and non-hex input
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != Self::LEN * 2 {
            return Err(Error::InvalidHash(s.to_string()));
        }

        let mut bytes = [0u8; Self::LEN];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk)
                .map_err(|_| Error::InvalidHash(s.to_string()))?;
            bytes[i] = u8::from_str_radix(pair, 16)
                .map_err(|_| Error::InvalidHash(s.to_string()))?;
        }

        Ok(Self(bytes))
    }
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateHash({:.16})", self.to_hex())
    }
}

impl FromStr for StateHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Normalize a relative path to forward slashes for hashing
///
/// Path separators differ across platforms; hashes must not.
pub fn portable_name(relative: &Path) -> String {
    let mut name = String::new();
    for component in relative.components() {
        if !name.is_empty() {
            name.push('/');
        }
        name.push_str(&component.as_os_str().to_string_lossy());
    }
    name
}

/// Scoped hash accumulator
///
/// Seeded with an inbound [`StateHash`] by folding its raw bytes into a
/// fresh SHA-256 state, then fed further input with [`update`] and
/// [`update_file`]. Feeding `a` then `b` is identical to feeding `a ‖ b`.
///
/// [`update`]: HashTransformer::update
/// [`update_file`]: HashTransformer::update_file
pub struct HashTransformer {
    hasher: Sha256,
}

impl HashTransformer {
    /// Start an accumulator seeded with `initial`
    pub fn new(initial: &StateHash) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(initial.as_bytes());
        Self { hasher }
    }

    /// Fold raw bytes into the running state
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Fold a file using its canonical encoding
    ///
    /// The encoding is: the relative name with `/` separators, one zero
    /// separator byte, the content length as little-endian u64, then the
    /// raw content. Content bytes are folded as-is; only the name is
    /// normalized. The length prefix keeps `("a", "bc")` distinct from
    /// `("ab", "c")`.
    pub fn update_file(&mut self, relative_name: &str, path: &Path) -> Result<()> {
        let len = std::fs::metadata(path)?.len();

        self.hasher.update(relative_name.as_bytes());
        self.hasher.update([0u8]);
        self.hasher.update(len.to_le_bytes());

        let mut file = File::open(path)?;
        let mut buffer = [0u8; 8192];
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            self.hasher.update(&buffer[..n]);
        }

        Ok(())
    }

    /// Finalize the accumulator, consuming it
    pub fn finish(self) -> StateHash {
        StateHash(self.hasher.finalize().into())
    }
}

/// Fold a single byte string into a hash
///
/// Shorthand for a one-shot [`HashTransformer`].
pub fn mix(initial: &StateHash, bytes: &[u8]) -> StateHash {
    let mut t = HashTransformer::new(initial);
    t.update(bytes);
    t.finish()
}
