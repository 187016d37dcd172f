//! Frame construction.

use std::io::Write;

use bytes::{BufMut, BytesMut};
use tracing::trace;

use super::auth::MessageDigest;
use super::{
    Codec, Header, HexDump, SigningMode, MAGIC, MAX_CHUNK_LEN, MESSAGE_TERMINATOR,
    PROTOCOL_VERSION, RECORD_SEPARATOR,
};

/// Incremental writer for one message.
///
/// Records are appended one at a time and split into chunks of at most
/// 65535 bytes. [`FrameBuilder::finish`] closes the message and, when signing,
/// appends the final digest.
pub struct FrameBuilder {
    buf: BytesMut,
    digest: Option<MessageDigest>,
    per_chunk: bool,
    records: usize,
}

impl FrameBuilder {
    pub fn new(codec: &Codec, header: Header) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(&MAGIC);
        buf.put_u8(PROTOCOL_VERSION);

        let (digest, per_chunk) = match codec.key() {
            Some(key) => {
                buf.put_u8(codec.signing().header_byte());
                (Some(key.digest()), codec.signing() == SigningMode::PerChunk)
            }
            None => (None, false),
        };

        let mut builder = Self {
            buf,
            digest,
            per_chunk,
            records: 0,
        };
        builder.put_signed(&[header.as_byte()]);
        builder.commit_chunk();
        builder
    }

    /// Append one record.
    pub fn record(&mut self, data: &[u8]) -> &mut Self {
        if self.records > 0 {
            self.put_signed(&[RECORD_SEPARATOR]);
            self.commit_chunk();
        }
        for chunk in data.chunks(MAX_CHUNK_LEN) {
            self.put_signed(&(chunk.len() as u16).to_be_bytes());
            self.put_signed(chunk);
            self.commit_chunk();
        }
        // end of record
        self.put_signed(&[0, 0]);
        self.records += 1;
        self
    }

    /// Terminate the message and return the encoded frame.
    pub fn finish(mut self) -> BytesMut {
        if self.records == 0 {
            self.put_signed(&[0, 0]);
        }
        self.put_signed(&[MESSAGE_TERMINATOR]);
        if let Some(digest) = &self.digest {
            let tag = digest.current();
            trace!(digest = %HexDump(&tag), "signed message");
            self.buf.put_slice(&tag);
        }
        self.buf
    }

    fn put_signed(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
        if let Some(digest) = self.digest.as_mut() {
            digest.update(data);
        }
    }

    /// Per-chunk mode: commit everything hashed so far.
    fn commit_chunk(&mut self) {
        if !self.per_chunk {
            return;
        }
        if let Some(digest) = &self.digest {
            let tag = digest.current();
            self.buf.put_slice(&tag);
        }
    }
}

/// Encode a complete message.
pub fn build_message(codec: &Codec, header: Header, records: &[&[u8]]) -> BytesMut {
    let mut builder = FrameBuilder::new(codec, header);
    for record in records {
        builder.record(record);
    }
    builder.finish()
}

/// Encode a message and write it to `writer`.
pub fn write_message<W: Write>(
    writer: &mut W,
    codec: &Codec,
    header: Header,
    records: &[&[u8]],
) -> std::io::Result<()> {
    let frame = build_message(codec, header, records);
    trace!(%header, len = frame.len(), frame = %HexDump(&frame), "sending message");
    writer.write_all(&frame)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DIGEST_LEN, SIG_HDR_CHUNK, SIG_HDR_MESSAGE};

    #[test]
    fn test_unsigned_single_record_layout() {
        let frame = build_message(&Codec::default(), Header::Get, &[b"ab"]);
        assert_eq!(
            &frame[..],
            &[b's', b'h', b'c', 1, 0x01, 0, 2, b'a', b'b', 0, 0, 0][..]
        );
    }

    #[test]
    fn test_no_records_writes_one_empty_record() {
        let frame = build_message(&Codec::default(), Header::Stats, &[]);
        assert_eq!(&frame[..], &[b's', b'h', b'c', 1, 0x32, 0, 0, 0][..]);
        assert_eq!(frame, build_message(&Codec::default(), Header::Stats, &[b""]));
    }

    #[test]
    fn test_records_are_separated() {
        let frame = build_message(&Codec::default(), Header::Set, &[b"a", b""]);
        assert_eq!(
            &frame[4..],
            &[0x02, 0, 1, b'a', 0, 0, RECORD_SEPARATOR, 0, 0, MESSAGE_TERMINATOR][..]
        );
    }

    #[test]
    fn test_large_record_is_chunked() {
        let value = vec![7u8; 70_000];
        let frame = build_message(&Codec::default(), Header::Response, &[&value]);
        assert_eq!(frame.len(), 4 + 1 + 2 + 65_535 + 2 + 4_465 + 2 + 1);
        assert_eq!(&frame[5..7], &[0xFF, 0xFF]);
        assert_eq!(&frame[7 + 65_535..9 + 65_535], &4_465u16.to_be_bytes());
    }

    #[test]
    fn test_per_message_signature() {
        let codec = Codec::new(Some(b"secret"));
        let frame = build_message(&codec, Header::Get, &[b"ab"]);
        assert_eq!(frame[4], SIG_HDR_MESSAGE);
        assert_eq!(frame.len(), 12 + 1 + DIGEST_LEN);

        let mut expected = codec.key().unwrap().digest();
        expected.update(&frame[5..frame.len() - DIGEST_LEN]);
        assert!(expected.verify(&frame[frame.len() - DIGEST_LEN..]));
    }

    #[test]
    fn test_per_chunk_signature_layout() {
        let codec = Codec::new(Some(b"secret")).with_signing(SigningMode::PerChunk);
        let frame = build_message(&codec, Header::Get, &[b"ab"]);
        assert_eq!(frame[4], SIG_HDR_CHUNK);
        // hdr, chunk, terminator each carry a digest
        assert_eq!(frame.len(), 4 + 1 + 1 + 8 + 4 + 8 + 2 + 1 + 8);

        let key = codec.key().unwrap();
        let mut running = key.digest();
        running.update(&frame[5..6]);
        assert!(running.verify(&frame[6..14]));
        running.update(&frame[14..18]);
        assert!(running.verify(&frame[18..26]));
        running.update(&frame[26..29]);
        assert!(running.verify(&frame[29..37]));
    }

    #[test]
    fn test_write_message_matches_build() {
        let mut out = Vec::new();
        write_message(&mut out, &Codec::default(), Header::Delete, &[b"k"]).unwrap();
        assert_eq!(out, build_message(&Codec::default(), Header::Delete, &[b"k"]).to_vec());
    }
}
