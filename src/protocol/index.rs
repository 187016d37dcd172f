//! Index catalog: the list of keys a peer holds.
//!
//! Encoded as repeated `(key_len: u32 BE, key, value_len: u32 BE)` triples
//! closed by a zero key length.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::ProtocolError;

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexItem {
    pub key: Bytes,
    pub value_len: u32,
}

/// Encode a catalog.
///
/// An empty key would read back as the terminator, so it is rejected.
pub fn encode_index(items: &[IndexItem]) -> Result<BytesMut, ProtocolError> {
    let size = items.iter().map(|item| 8 + item.key.len()).sum::<usize>() + 4;
    let mut buf = BytesMut::with_capacity(size);
    for item in items {
        if item.key.is_empty() {
            return Err(ProtocolError::EmptyIndexKey);
        }
        buf.put_u32(item.key.len() as u32);
        buf.put_slice(&item.key);
        buf.put_u32(item.value_len);
    }
    buf.put_u32(0);
    Ok(buf)
}

/// Decode a catalog. Data after the terminator is ignored.
pub fn decode_index(mut data: &[u8]) -> Result<Vec<IndexItem>, ProtocolError> {
    let mut items = Vec::new();
    loop {
        if data.remaining() < 4 {
            return Err(ProtocolError::Truncated);
        }
        let key_len = data.get_u32() as usize;
        if key_len == 0 {
            return Ok(items);
        }
        if data.remaining() < key_len + 4 {
            return Err(ProtocolError::Truncated);
        }
        let key = Bytes::copy_from_slice(&data[..key_len]);
        data.advance(key_len);
        let value_len = data.get_u32();
        items.push(IndexItem { key, value_len });
    }
}
