//! Cache keys naming clips on disk: `cam<camera>_<unix-seconds>_<hex>.mp4`.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

const HASH_LEN: usize = 8;

static KEY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^cam(\d{1,9})_(\d{1,12})_([0-9a-f]{1,64})\.mp4$").expect("cache key pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("clip name does not match cam<id>_<ts>_<hex>.mp4")]
    Malformed,
    #[error("clip name component out of range")]
    OutOfRange,
}

/// Validated clip identifier. Construction goes through [`CacheKey::parse`] or
/// [`CacheKey::derive`], so a value of this type is always safe to join onto the
/// cache root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    name: String,
    camera_id: u32,
    timestamp: i64,
}

impl CacheKey {
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let caps = KEY_PATTERN.captures(raw).ok_or(KeyError::Malformed)?;
        let camera_id = caps[1].parse::<u32>().map_err(|_| KeyError::OutOfRange)?;
        let timestamp = caps[2].parse::<i64>().map_err(|_| KeyError::OutOfRange)?;
        Ok(Self {
            name: raw.to_string(),
            camera_id,
            timestamp,
        })
    }

    /// Build the key for a clip found on the recorder. The hash component is the
    /// first eight hex digits of the SHA-256 of the remote filename.
    pub fn derive(camera_id: u32, timestamp: i64, remote_filename: &str) -> Self {
        let digest = Sha256::digest(remote_filename.as_bytes());
        let hash = hex::encode(digest);
        let timestamp = timestamp.max(0);
        Self {
            name: format!("cam{camera_id}_{timestamp}_{}.mp4", &hash[..HASH_LEN]),
            camera_id,
            timestamp,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn camera_id(&self) -> u32 {
        self.camera_id
    }

    /// Target instant (UTC seconds) encoded in the key.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Sibling name used while the clip is being written.
    pub fn part_name(&self) -> String {
        format!("{}.part", self.name)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl FromStr for CacheKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.name
    }
}
