//! Incremental message decoder.
//!
//! [`AsyncReadContext`] accepts input in arbitrary pieces, keeps whatever it
//! cannot consume yet, and reports each chunk to a callback as soon as the
//! chunk (and, in per-chunk signing mode, its digest) is complete. It never
//! blocks, so a reactor can drive one context per connection.
//!
//! ```text
//!   None ─► Magic ─► SigHeader ─► Header ─► Record ◄──► RecordSeparator
//!                                                           │
//!                                          Done ◄── Auth ◄──┘ (terminator)
//!   any state ─► Error | AuthError (terminal)
//! ```
//!
//! After `Done` the next call to [`AsyncReadContext::feed`] resets the
//! per-message counters, so pipelined messages on one connection reuse the
//! same context.
//!
//! In per-chunk signing mode nothing is reported until the digest covering
//! it has been verified: a chunk waits for the digest that follows it, and
//! an empty record waits for the digest after its separator or terminator.

use std::io::{self, Read};
use std::ops::ControlFlow;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::auth::{MessageDigest, SigningKey};
use super::{
    is_signature_header, Codec, Header, HexDump, ProtocolError, DIGEST_LEN, MAGIC,
    MESSAGE_TERMINATOR, NOOP, PROTOCOL_VERSION, RECORD_SEPARATOR, SIG_HDR_CHUNK,
};

/// Decoder position within the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    None,
    Magic,
    SigHeader,
    Header,
    Record,
    RecordSeparator,
    Auth,
    Done,
    Error,
    AuthError,
}

impl ReadState {
    /// `Error` and `AuthError` are final; the connection must be closed.
    pub fn is_failed(self) -> bool {
        matches!(self, ReadState::Error | ReadState::AuthError)
    }
}

/// Event delivered to the decoder callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEvent<'a> {
    /// One complete chunk of record `record`.
    Chunk { record: usize, data: &'a [u8] },
    /// Record `record` had no data and another record follows.
    EmptyRecord { record: usize },
    /// The message body consisted of a single empty record.
    EmptyBody,
}

impl ReadEvent<'_> {
    /// Record number, or `-1` for [`ReadEvent::EmptyBody`].
    pub fn record_index(&self) -> i32 {
        match self {
            ReadEvent::Chunk { record, .. } | ReadEvent::EmptyRecord { record } => *record as i32,
            ReadEvent::EmptyBody => -1,
        }
    }
}

/// Re-entrant decoder state for one connection.
pub struct AsyncReadContext<F> {
    state: ReadState,
    buf: BytesMut,
    key: Option<SigningKey>,
    max_record_len: usize,
    digest: Option<MessageDigest>,
    version: u8,
    sig_header: Option<u8>,
    header: Option<Header>,
    expected_header: Option<Header>,
    per_chunk: bool,
    /// A per-chunk digest must be read before anything else.
    pending_digest: bool,
    /// Chunk waiting for its digest before delivery.
    held_chunk: Option<Bytes>,
    /// Empty-record event waiting for its digest.
    held_empty: Option<ReadEvent<'static>>,
    chunk_len: Option<usize>,
    record: usize,
    record_len: usize,
    completed: u64,
    last_update: Instant,
    callback: F,
}

impl<F> AsyncReadContext<F>
where
    F: FnMut(ReadEvent<'_>) -> ControlFlow<()>,
{
    pub fn new(codec: &Codec, callback: F) -> Self {
        Self {
            state: ReadState::None,
            buf: BytesMut::new(),
            key: codec.key().cloned(),
            max_record_len: codec.max_record_len(),
            digest: None,
            version: 0,
            sig_header: None,
            header: None,
            expected_header: None,
            per_chunk: false,
            pending_digest: false,
            held_chunk: None,
            held_empty: None,
            chunk_len: None,
            record: 0,
            record_len: 0,
            completed: 0,
            last_update: Instant::now(),
            callback,
        }
    }

    /// Fail with [`ProtocolError::UnexpectedHeader`] as soon as a message
    /// carries any other command header, before any of its data is reported.
    pub fn expect_header(mut self, header: Header) -> Self {
        self.expected_header = Some(header);
        self
    }

    /// Consume `data` and advance as far as the buffered input allows.
    ///
    /// Feeding an empty slice processes input left over from a previous
    /// message. Once the context has failed every call returns
    /// [`ProtocolError::Terminated`].
    pub fn feed(&mut self, data: &[u8]) -> Result<ReadState, ProtocolError> {
        self.last_update = Instant::now();
        match self.state {
            ReadState::Error | ReadState::AuthError => return Err(ProtocolError::Terminated),
            ReadState::Done => self.reset(),
            _ => {}
        }
        self.buf.extend_from_slice(data);

        match self.advance() {
            Ok(()) => Ok(self.state),
            Err(e) => {
                if e.is_auth_failure() {
                    self.state = ReadState::AuthError;
                    warn!(
                        target: "peer_cache::security",
                        error = %e,
                        sig_header = ?self.sig_header,
                        "rejected message"
                    );
                } else {
                    self.state = ReadState::Error;
                    debug!(error = %e, header = ?self.header, "bad message");
                }
                Err(e)
            }
        }
    }

    /// Signal end of input.
    ///
    /// Clean only between messages and after at least one message has
    /// completed; otherwise the context fails.
    pub fn eof(&mut self) -> Result<(), ProtocolError> {
        match self.state {
            ReadState::Done => Ok(()),
            ReadState::None if self.completed > 0 => Ok(()),
            ReadState::Error | ReadState::AuthError => Err(ProtocolError::Terminated),
            _ => {
                self.state = ReadState::Error;
                Err(ProtocolError::Truncated)
            }
        }
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Command header of the current (or last completed) message.
    pub fn header(&self) -> Option<Header> {
        self.header
    }

    pub fn signature_header(&self) -> Option<u8> {
        self.sig_header
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// When input was last fed, for idle timeouts.
    pub fn last_update(&self) -> Instant {
        self.last_update
    }

    /// Messages decoded so far.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn reset(&mut self) {
        self.state = ReadState::None;
        self.digest = None;
        self.version = 0;
        self.sig_header = None;
        self.header = None;
        self.per_chunk = false;
        self.pending_digest = false;
        self.held_chunk = None;
        self.held_empty = None;
        self.chunk_len = None;
        self.record = 0;
        self.record_len = 0;
    }

    fn advance(&mut self) -> Result<(), ProtocolError> {
        loop {
            match self.state {
                ReadState::None => {
                    let noops = self.buf.iter().take_while(|&&b| b == NOOP).count();
                    self.buf.advance(noops);
                    if self.buf.is_empty() {
                        return Ok(());
                    }
                    self.state = ReadState::Magic;
                }
                ReadState::Magic => {
                    if self.buf.len() < 4 {
                        return Ok(());
                    }
                    let magic = self.buf.split_to(4);
                    if magic[..3] != MAGIC {
                        return Err(ProtocolError::BadMagic);
                    }
                    if magic[3] > PROTOCOL_VERSION {
                        return Err(ProtocolError::UnsupportedVersion(magic[3]));
                    }
                    self.version = magic[3];
                    self.state = ReadState::SigHeader;
                }
                ReadState::SigHeader => {
                    let Some(&byte) = self.buf.first() else {
                        return Ok(());
                    };
                    if is_signature_header(byte) {
                        if self.key.is_none() {
                            return Err(ProtocolError::UnexpectedSignature);
                        }
                        self.buf.advance(1);
                        self.sig_header = Some(byte);
                        self.per_chunk = byte == SIG_HDR_CHUNK;
                    } else if self.key.is_some() {
                        return Err(ProtocolError::MissingSignature);
                    }
                    self.state = ReadState::Header;
                }
                ReadState::Header => {
                    let Some(&byte) = self.buf.first() else {
                        return Ok(());
                    };
                    let header = Header::try_from(byte)?;
                    if let Some(expected) = self.expected_header {
                        if header != expected {
                            return Err(ProtocolError::UnexpectedHeader {
                                expected,
                                got: header,
                            });
                        }
                    }
                    self.buf.advance(1);
                    self.header = Some(header);
                    self.digest = self.key.as_ref().map(SigningKey::digest);
                    self.update(&[byte]);
                    self.pending_digest = self.per_chunk;
                    self.state = ReadState::Record;
                }
                ReadState::Record => {
                    if self.pending_digest {
                        if self.buf.len() < DIGEST_LEN {
                            return Ok(());
                        }
                        let received = self.buf.split_to(DIGEST_LEN);
                        self.check_digest(&received)?;
                        self.pending_digest = false;
                        self.release_held()?;
                    }

                    match self.chunk_len {
                        None => {
                            if self.buf.len() < 2 {
                                return Ok(());
                            }
                            let prefix = self.buf.split_to(2);
                            self.update(&prefix);
                            let len = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
                            if len == 0 {
                                self.state = ReadState::RecordSeparator;
                            } else {
                                let total = self.record_len + len;
                                if total > self.max_record_len {
                                    return Err(ProtocolError::RecordTooLarge {
                                        len: total,
                                        max: self.max_record_len,
                                    });
                                }
                                self.chunk_len = Some(len);
                            }
                        }
                        Some(len) => {
                            if self.buf.len() < len {
                                return Ok(());
                            }
                            let chunk = self.buf.split_to(len).freeze();
                            self.update(&chunk);
                            self.record_len += len;
                            self.chunk_len = None;
                            if self.per_chunk {
                                self.held_chunk = Some(chunk);
                                self.pending_digest = true;
                            } else {
                                let event = ReadEvent::Chunk {
                                    record: self.record,
                                    data: &chunk,
                                };
                                emit(&mut self.callback, event)?;
                            }
                        }
                    }
                }
                ReadState::RecordSeparator => {
                    let Some(&sep) = self.buf.first() else {
                        return Ok(());
                    };
                    if sep != RECORD_SEPARATOR && sep != MESSAGE_TERMINATOR {
                        return Err(ProtocolError::BadSeparator(sep));
                    }
                    self.buf.advance(1);
                    self.update(&[sep]);

                    let empty = self.record_len == 0;
                    if sep == RECORD_SEPARATOR {
                        if empty {
                            self.deliver_empty(ReadEvent::EmptyRecord {
                                record: self.record,
                            })?;
                        }
                        self.record += 1;
                        self.record_len = 0;
                        self.pending_digest = self.per_chunk;
                        self.state = ReadState::Record;
                    } else {
                        if empty {
                            let event = if self.record == 0 {
                                ReadEvent::EmptyBody
                            } else {
                                ReadEvent::EmptyRecord {
                                    record: self.record,
                                }
                            };
                            self.deliver_empty(event)?;
                        }
                        self.state = if self.key.is_some() {
                            ReadState::Auth
                        } else {
                            ReadState::Done
                        };
                    }
                }
                ReadState::Auth => {
                    if self.buf.len() < DIGEST_LEN {
                        return Ok(());
                    }
                    let received = self.buf.split_to(DIGEST_LEN);
                    self.check_digest(&received)?;
                    self.release_held()?;
                    self.digest = None;
                    self.state = ReadState::Done;
                }
                ReadState::Done => {
                    self.completed += 1;
                    trace!(header = ?self.header, records = self.record + 1, "message decoded");
                    return Ok(());
                }
                ReadState::Error | ReadState::AuthError => return Ok(()),
            }
        }
    }

    /// Report an empty record now, or hold it for its digest.
    fn deliver_empty(&mut self, event: ReadEvent<'static>) -> Result<(), ProtocolError> {
        if self.per_chunk {
            self.held_empty = Some(event);
            Ok(())
        } else {
            emit(&mut self.callback, event)
        }
    }

    /// Report whatever the digest just verified was covering.
    fn release_held(&mut self) -> Result<(), ProtocolError> {
        if let Some(chunk) = self.held_chunk.take() {
            let event = ReadEvent::Chunk {
                record: self.record,
                data: &chunk,
            };
            emit(&mut self.callback, event)?;
        }
        if let Some(event) = self.held_empty.take() {
            emit(&mut self.callback, event)?;
        }
        Ok(())
    }

    fn update(&mut self, data: &[u8]) {
        if let Some(digest) = self.digest.as_mut() {
            digest.update(data);
        }
    }

    fn check_digest(&self, received: &[u8]) -> Result<(), ProtocolError> {
        match &self.digest {
            Some(digest) if digest.verify(received) => Ok(()),
            Some(digest) => {
                debug!(
                    computed = %HexDump(&digest.current()),
                    received = %HexDump(received),
                    "digest mismatch"
                );
                Err(ProtocolError::DigestMismatch)
            }
            None => Err(ProtocolError::DigestMismatch),
        }
    }
}

fn emit<F>(callback: &mut F, event: ReadEvent<'_>) -> Result<(), ProtocolError>
where
    F: FnMut(ReadEvent<'_>) -> ControlFlow<()>,
{
    match callback(event) {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(()) => Err(ProtocolError::CallbackAborted),
    }
}

/// Decode one message from a blocking reader, streaming events to `callback`.
///
/// Input is read in 64 KiB pieces; bytes past the end of the message are
/// discarded, so the peer must not pipeline further messages behind it.
pub fn read_message_streaming<R, F>(
    reader: &mut R,
    codec: &Codec,
    callback: F,
) -> Result<Header, ProtocolError>
where
    R: Read,
    F: FnMut(ReadEvent<'_>) -> ControlFlow<()>,
{
    let mut ctx = AsyncReadContext::new(codec, callback);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            ctx.eof()?;
            return Err(ProtocolError::Truncated);
        }
        if ctx.feed(&buf[..n])? == ReadState::Done {
            return ctx.header().ok_or(ProtocolError::Truncated);
        }
    }
}
