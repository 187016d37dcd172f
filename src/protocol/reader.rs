//! Blocking message reader.
//!
//! Reads exactly one message from a blocking stream and appends the payload
//! of all records to the caller's buffer. Record boundaries are not kept;
//! callers needing them use [`super::decoder`] instead.

use std::io::{self, Read};
use std::net::TcpStream;

use bytes::BytesMut;
use tracing::{trace, warn};

use super::auth::MessageDigest;
use super::{
    is_signature_header, Codec, Header, ProtocolError, DIGEST_LEN, MAGIC, MESSAGE_TERMINATOR,
    NOOP, PROTOCOL_VERSION, RECORD_SEPARATOR, SIG_HDR_CHUNK,
};

/// Read one message from `reader`, appending its payload to `out`.
///
/// Returns the message header on a clean terminator. On any error `out` is
/// truncated back to the length it had on entry.
pub fn read_message<R: Read>(
    reader: &mut R,
    codec: &Codec,
    out: &mut BytesMut,
) -> Result<Header, ProtocolError> {
    let initial_len = out.len();
    let result = read_inner(reader, codec, out);
    if let Err(e) = &result {
        out.truncate(initial_len);
        if e.is_auth_failure() {
            warn!(target: "peer_cache::security", error = %e, "rejected message");
        }
    }
    result
}

/// Put `stream` in blocking mode and read one message from it.
pub fn read_socket_message(
    stream: &mut TcpStream,
    codec: &Codec,
    out: &mut BytesMut,
) -> Result<Header, ProtocolError> {
    stream.set_nonblocking(false)?;
    read_message(stream, codec, out)
}

fn read_inner<R: Read>(
    reader: &mut R,
    codec: &Codec,
    out: &mut BytesMut,
) -> Result<Header, ProtocolError> {
    let mut byte = read_byte(reader)?;
    while byte == NOOP {
        byte = read_byte(reader)?;
    }

    let mut magic = [byte, 0, 0, 0];
    read_exact(reader, &mut magic[1..])?;
    if magic[..3] != MAGIC {
        return Err(ProtocolError::BadMagic);
    }
    if magic[3] > PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(magic[3]));
    }

    let mut byte = read_byte(reader)?;
    let mut per_chunk = false;
    if is_signature_header(byte) {
        if codec.key().is_none() {
            return Err(ProtocolError::UnexpectedSignature);
        }
        per_chunk = byte == SIG_HDR_CHUNK;
        byte = read_byte(reader)?;
    } else if codec.key().is_some() {
        return Err(ProtocolError::MissingSignature);
    }

    let header = Header::try_from(byte)?;
    let mut digest = codec.key().map(|key| key.digest());
    update(&mut digest, &[byte]);
    if per_chunk {
        verify(reader, &digest)?;
    }

    let max = codec.max_record_len();
    let mut record_len = 0usize;
    loop {
        let mut len = [0u8; 2];
        read_exact(reader, &mut len)?;
        update(&mut digest, &len);
        let len = u16::from_be_bytes(len) as usize;

        if len > 0 {
            if record_len + len > max {
                return Err(ProtocolError::RecordTooLarge {
                    len: record_len + len,
                    max,
                });
            }
            let start = out.len();
            out.resize(start + len, 0);
            read_exact(reader, &mut out[start..])?;
            update(&mut digest, &out[start..]);
            record_len += len;
            if per_chunk {
                verify(reader, &digest)?;
            }
            continue;
        }

        let sep = read_byte(reader)?;
        update(&mut digest, &[sep]);
        match sep {
            RECORD_SEPARATOR => {
                record_len = 0;
                if per_chunk {
                    verify(reader, &digest)?;
                }
            }
            MESSAGE_TERMINATOR => break,
            other => return Err(ProtocolError::BadSeparator(other)),
        }
    }

    verify(reader, &digest)?;
    trace!(%header, payload = out.len(), "read message");
    Ok(header)
}

fn update(digest: &mut Option<MessageDigest>, data: &[u8]) {
    if let Some(digest) = digest.as_mut() {
        digest.update(data);
    }
}

/// Read a digest from the wire and check it when signing is enabled.
fn verify<R: Read>(reader: &mut R, digest: &Option<MessageDigest>) -> Result<(), ProtocolError> {
    let Some(digest) = digest else {
        return Ok(());
    };
    let mut received = [0u8; DIGEST_LEN];
    read_exact(reader, &mut received)?;
    if digest.verify(&received) {
        Ok(())
    } else {
        Err(ProtocolError::DigestMismatch)
    }
}

fn read_byte<R: Read>(reader: &mut R) -> Result<u8, ProtocolError> {
    let mut byte = [0u8; 1];
    read_exact(reader, &mut byte)?;
    Ok(byte[0])
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ProtocolError::Truncated,
        _ => ProtocolError::Io(e),
    })
}
