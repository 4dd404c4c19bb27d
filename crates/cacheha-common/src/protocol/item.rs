use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::protocol::error::{CacheError, Result};

/// Magic tag prepended to every value written through CacheHA.
pub const ITEM_HEADER: [u8; 4] = [0xfd, 0x37, 0xd3, 0x1b];

/// Header length: magic tag plus the 4-byte big-endian absolute expiry.
pub const HEADER_LEN: usize = 8;

/// Largest exptime memcached interprets as relative seconds.
///
/// Anything above is read by the server as an absolute unix timestamp.
pub const MAX_RELATIVE_EXPIRATION: u32 = 60 * 60 * 24 * 30;

/// A raw memcached item, exactly as a backend stores it.
///
/// `expiration` follows the memcached exptime convention: `0` never expires,
/// values up to [`MAX_RELATIVE_EXPIRATION`] are seconds from now, anything
/// larger is an absolute unix timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireItem {
    pub key: String,
    pub value: Vec<u8>,
    pub flags: u32,
    pub expiration: u32,
}

/// An item as seen by callers of the HA client.
///
/// Expiration is kept as an absolute point in time so that every node, no
/// matter when it was written or repaired, agrees on when the item dies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    /// Key, at most 250 bytes.
    pub key: String,
    pub value: Vec<u8>,
    /// Opaque flags, passed through untouched.
    pub flags: u32,
    /// Absolute expiry, or `None` for no expiry.
    pub expiration: Option<SystemTime>,
}

impl CacheItem {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            flags: 0,
            expiration: None,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_expiration(mut self, expiration: SystemTime) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Sets the absolute expiration to `ttl` from now.
    pub fn with_ttl(self, ttl: Duration) -> Self {
        self.with_expiration(SystemTime::now() + ttl)
    }

    /// Returns `true` if the item has an expiration that is not in the future.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        match self.expiration {
            Some(expiration) => expiration <= now,
            None => false,
        }
    }

    /// Encodes the item for storage on a backend, relative to the current time.
    pub fn to_wire(&self) -> WireItem {
        self.to_wire_at(SystemTime::now())
    }

    /// Encodes the item for storage on a backend, relative to `now`.
    ///
    /// The value gains the 8-byte header carrying the absolute expiry; the
    /// backend exptime is derived from it and never drops below one second,
    /// so an already-expired item dies almost immediately instead of living
    /// forever.
    pub fn to_wire_at(&self, now: SystemTime) -> WireItem {
        let absolute = self.expiration.map(unix_seconds).unwrap_or(0);

        let expiration = if self.expiration.is_some() {
            let relative = i64::from(absolute) - i64::from(unix_seconds(now));
            if relative < 1 {
                1
            } else if relative > i64::from(MAX_RELATIVE_EXPIRATION) {
                absolute
            } else {
                relative as u32
            }
        } else {
            0
        };

        let mut value = Vec::with_capacity(HEADER_LEN + self.value.len());
        value.extend_from_slice(&ITEM_HEADER);
        value.extend_from_slice(&absolute.to_be_bytes());
        value.extend_from_slice(&self.value);

        WireItem {
            key: self.key.clone(),
            value,
            flags: self.flags,
            expiration,
        }
    }

    /// Decodes an item read back from a backend.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotCacheHaItem`] if the value is shorter than the
    /// header or does not start with the magic tag.
    pub fn from_wire(wire: WireItem) -> Result<Self> {
        if wire.value.len() < HEADER_LEN || wire.value[..4] != ITEM_HEADER {
            return Err(CacheError::NotCacheHaItem);
        }

        let absolute = u32::from_be_bytes([wire.value[4], wire.value[5], wire.value[6], wire.value[7]]);
        let expiration = if absolute == 0 {
            None
        } else {
            Some(UNIX_EPOCH + Duration::from_secs(u64::from(absolute)))
        };

        let mut value = wire.value;
        value.drain(..HEADER_LEN);

        Ok(Self {
            key: wire.key,
            value,
            flags: wire.flags,
            expiration,
        })
    }
}

/// Whole unix seconds for `time`, saturated into the 4-byte wire field.
///
/// Times before the epoch map to 1 (already expired) rather than 0, which
/// would mean "never".
pub fn unix_seconds(time: SystemTime) -> u32 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX).max(1),
        Err(_) => 1,
    }
}
