//! Wire value envelope
//!
//! Every backing-store entry written by the cache carries its logical time
//! and a presence flag ahead of the payload:
//!
//! ```text
//! [8 bytes big-endian i64 logical time][1 byte flag: 1=present, 0=deleted][payload]
//! ```
//!
//! A zero-length entry means the record was physically purged, which is
//! distinct from the 9+ byte tombstone form.

use crate::error::{Error, Result};
use crate::types::LogicalTime;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the envelope header
pub const HEADER_LEN: usize = 9;

const FLAG_DELETED: u8 = 0;
const FLAG_PRESENT: u8 = 1;

/// Decoded backing-store record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireRecord {
    /// Logical time of the write
    pub time: LogicalTime,
    /// Whether a value is present (false = tombstone)
    pub present: bool,
    /// Payload (empty for tombstones)
    pub payload: Bytes,
}

impl WireRecord {
    /// Record carrying a value
    #[must_use]
    pub const fn present(time: LogicalTime, payload: Bytes) -> Self {
        Self {
            time,
            present: true,
            payload,
        }
    }

    /// Tombstone record
    #[must_use]
    pub const fn tombstone(time: LogicalTime) -> Self {
        Self {
            time,
            present: false,
            payload: Bytes::new(),
        }
    }

    /// Encode into the wire layout
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_i64(self.time);
        buf.put_u8(if self.present { FLAG_PRESENT } else { FLAG_DELETED });
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a backing-store entry. `Ok(None)` means physically purged.
    pub fn decode(raw: &[u8]) -> Result<Option<Self>> {
        if raw.is_empty() {
            return Ok(None);
        }
        if raw.len() < HEADER_LEN {
            return Err(Error::CorruptEnvelope(raw.len()));
        }

        let mut header = &raw[..HEADER_LEN];
        let time = header.get_i64();
        let present = match header.get_u8() {
            FLAG_PRESENT => true,
            FLAG_DELETED => false,
            _ => return Err(Error::CorruptEnvelope(raw.len())),
        };

        Ok(Some(Self {
            time,
            present,
            payload: Bytes::copy_from_slice(&raw[HEADER_LEN..]),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_empty_payload_roundtrip() {
        let record = WireRecord::present(1_700_000_000_000, Bytes::new());
        let encoded = record.encode();
        assert_eq!(encoded.len(), HEADER_LEN);

        let decoded = WireRecord::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded.time, 1_700_000_000_000);
        assert!(decoded.present);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_envelope_layout() {
        let encoded = WireRecord::present(0x0102, Bytes::from_static(b"xy")).encode();
        assert_eq!(&encoded[..], &[0, 0, 0, 0, 0, 0, 1, 2, 1, b'x', b'y']);

        let tomb = WireRecord::tombstone(-5).encode();
        assert_eq!(tomb[8], 0);
        let decoded = WireRecord::decode(&tomb).unwrap().unwrap();
        assert_eq!(decoded.time, -5);
        assert!(!decoded.present);
    }

    #[test]
    fn test_envelope_purged_and_corrupt() {
        assert_eq!(WireRecord::decode(&[]).unwrap(), None);
        assert!(matches!(
            WireRecord::decode(&[1, 2, 3]),
            Err(Error::CorruptEnvelope(3))
        ));

        let mut bad = WireRecord::present(1, Bytes::new()).encode().to_vec();
        bad[8] = 7;
        assert!(WireRecord::decode(&bad).is_err());
    }
}
