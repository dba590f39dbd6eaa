use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;

/// Partition id carried by every object; the router hashes keys into these.
pub type AddrId = u64;

/// `del` flag values. Zero is live, anything else is a tombstone.
pub const DEL_FALSE: u8 = 0;
pub const DEL_TRUE: u8 = 1;

/// An object handed to the worker by the router: a raw key and body scoped
/// to one partition.
#[derive(Clone, Debug, PartialEq)]
pub struct Object {
    pub addr_id: AddrId,
    pub key: Vec<u8>,
    pub body: Vec<u8>,
}

impl Object {
    pub fn new(addr_id: AddrId, key: impl Into<Vec<u8>>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            addr_id,
            key: key.into(),
            body: body.into(),
        }
    }
}

/// The authoritative pointer for one key, stored in the metadata index.
/// `offset` points at the record in the AVS file, `size` is that record's
/// full on-disk size including header and padding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub addr_id: AddrId,
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    pub offset: u64,
    pub size: u64,
    pub del: u8,
    /// Unix seconds at append time.
    pub timestamp: i64,
}

impl Metadata {
    pub fn is_deleted(&self) -> bool {
        self.del != DEL_FALSE
    }

    pub fn to_bytes(&self) -> CResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CResult<Metadata> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Composite index key: big-endian `addr_id` followed by the raw key, so an
/// ordered scan walks entries grouped by partition, then by key.
pub fn encode_index_key(addr_id: AddrId, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + key.len());
    buf.extend_from_slice(&addr_id.to_be_bytes());
    buf.extend_from_slice(key);
    buf
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn metadata_roundtrip() -> CResult<()> {
        let meta = Metadata {
            addr_id: 42,
            key: b"user/1/avatar".to_vec(),
            offset: 4096,
            size: 128,
            del: DEL_FALSE,
            timestamp: 1_700_000_000,
        };
        let bytes = meta.to_bytes()?;
        assert_eq!(Metadata::from_bytes(&bytes)?, meta);
        Ok(())
    }

    #[test]
    fn index_key_orders_by_addr_then_key() {
        let a = encode_index_key(1, b"zzz");
        let b = encode_index_key(2, b"aaa");
        assert!(a < b);

        let c = encode_index_key(2, b"aab");
        assert!(b < c);
    }

    #[test]
    fn index_key_prefix_covers_partition() {
        let prefix = encode_index_key(7, b"");
        let entry = encode_index_key(7, b"some/key");
        assert!(entry.starts_with(&prefix));

        let other = encode_index_key(8, b"some/key");
        assert!(!other.starts_with(&prefix));
    }
}
