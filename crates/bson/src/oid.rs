use super::Error;
use lazy_static::lazy_static;
use rand::RngCore;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

lazy_static! {
    // Five random bytes drawn once per process, shared by every id.
    static ref PROCESS_RANDOM: [u8; 5] = {
        let mut bytes = [0u8; 5];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    };
    // The 3-byte counter starts at a random offset and wraps.
    static ref COUNTER: AtomicU32 = AtomicU32::new(rand::thread_rng().next_u32() & 0x00FF_FFFF);
}

/// A 12-byte document id: 4-byte big-endian UNIX seconds, 5 bytes of
/// per-process randomness, and a 3-byte big-endian monotonic counter.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub fn new() -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();
        let count = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&seconds.to_be_bytes());
        bytes[4..9].copy_from_slice(&*PROCESS_RANDOM);
        bytes[9..12].copy_from_slice(&count.to_be_bytes()[1..4]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// Seconds since the UNIX epoch at which this id was generated.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

impl std::str::FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = hex::decode(s).map_err(|_| Error::InvalidObjectId(s.to_owned()))?;
        let bytes: [u8; 12] = decoded
            .try_into()
            .map_err(|_| Error::InvalidObjectId(s.to_owned()))?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = ObjectId::new();
        let hex = id.to_string();
        assert_eq!(hex.len(), 24);
        assert_eq!(hex.parse::<ObjectId>().unwrap(), id);

        assert!("not-an-oid".parse::<ObjectId>().is_err());
        assert!("ffffffffffffffffffffffff".parse::<ObjectId>().is_ok());
    }

    #[test]
    fn ids_are_distinct_and_ordered_in_time() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_ne!(a, b);
        // Shared process-random bytes.
        assert_eq!(a.bytes()[4..9], b.bytes()[4..9]);
        // Timestamps within the same second or adjacent.
        assert!(b.timestamp().wrapping_sub(a.timestamp()) <= 1);
    }
}
