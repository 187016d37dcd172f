//! Streaming fetch driven by the tokio runtime.
//!
//! The request is written before [`fetch_async`] returns; the response is then
//! decoded on a spawned task that hands each chunk to the caller's callback as
//! it arrives and finishes with exactly one [`FetchEvent::Done`] or
//! [`FetchEvent::Error`].

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::ClientError;
use crate::protocol::{
    build_message, AsyncReadContext, Codec, Header, HexDump, ProtocolError, ReadEvent, ReadState,
};

/// Event delivered to an async fetch callback.
#[derive(Debug)]
pub enum FetchEvent<'a> {
    /// Decoded response data.
    Data(ReadEvent<'a>),
    /// The response completed cleanly.
    Done,
    /// The fetch failed; no further events follow.
    Error(&'a ClientError),
}

/// Connection used by a fetch.
#[derive(Debug)]
pub(crate) enum Connection {
    /// Opened for this fetch and closed when it ends.
    Owned(TcpStream),
    /// Supplied by the caller and handed back when the fetch ends.
    Borrowed(TcpStream),
}

/// Handle to a running fetch.
#[derive(Debug)]
pub struct AsyncFetch {
    task: JoinHandle<Result<Option<TcpStream>, ClientError>>,
}

impl AsyncFetch {
    /// Wait for the fetch to end.
    ///
    /// Returns the caller-supplied connection, if there was one. A failed
    /// fetch consumes the connection, since its stream position is unknown.
    pub async fn wait(self) -> Result<Option<TcpStream>, ClientError> {
        self.task.await.map_err(|_| ClientError::Runtime)?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Send a fetch request on `conn` and decode the response in the background.
///
/// Uses GET_ASYNC when both `offset` and `len` are zero, GET_OFFSET otherwise.
pub(crate) async fn fetch_async<F>(
    conn: Connection,
    codec: Codec,
    io_timeout: Duration,
    key: &[u8],
    offset: u32,
    len: u32,
    callback: F,
) -> Result<AsyncFetch, ClientError>
where
    F: FnMut(FetchEvent<'_>) -> ControlFlow<()> + Send + 'static,
{
    let runtime = Handle::try_current().map_err(|_| ClientError::Runtime)?;
    let (mut stream, hand_back) = match conn {
        Connection::Owned(stream) => (stream, false),
        Connection::Borrowed(stream) => (stream, true),
    };

    let frame = if offset == 0 && len == 0 {
        build_message(&codec, Header::GetAsync, &[key])
    } else {
        let offset = offset.to_be_bytes();
        let len = len.to_be_bytes();
        build_message(&codec, Header::GetOffset, &[key, &offset[..], &len[..]])
    };
    trace!(len = frame.len(), frame = %HexDump(&frame), "sending async fetch");
    tokio::time::timeout(io_timeout, stream.write_all(&frame))
        .await
        .map_err(|_| ClientError::Timeout)??;

    let task = runtime.spawn(async move {
        let (stream, result) = drive(stream, codec, io_timeout, callback).await;
        result.map(|()| hand_back.then_some(stream))
    });
    Ok(AsyncFetch { task })
}

async fn drive<F>(
    mut stream: TcpStream,
    codec: Codec,
    io_timeout: Duration,
    mut callback: F,
) -> (TcpStream, Result<(), ClientError>)
where
    F: FnMut(FetchEvent<'_>) -> ControlFlow<()> + Send,
{
    let result = read_response(&mut stream, &codec, io_timeout, &mut callback).await;
    match &result {
        Ok(()) => {
            let _ = callback(FetchEvent::Done);
        }
        Err(e) => {
            debug!(error = %e, "async fetch failed");
            let _ = callback(FetchEvent::Error(e));
        }
    }
    (stream, result)
}

async fn read_response<F>(
    stream: &mut TcpStream,
    codec: &Codec,
    io_timeout: Duration,
    callback: &mut F,
) -> Result<(), ClientError>
where
    F: FnMut(FetchEvent<'_>) -> ControlFlow<()> + Send,
{
    let mut ctx = AsyncReadContext::new(codec, |event| callback(FetchEvent::Data(event)))
        .expect_header(Header::Response);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = tokio::time::timeout(io_timeout, stream.read(&mut buf))
            .await
            .map_err(|_| ClientError::Timeout)??;
        if n == 0 {
            // the peer hung up before a complete response arrived
            ctx.eof()?;
            return Err(ProtocolError::Truncated.into());
        }
        if ctx.feed(&buf[..n]).map_err(response_error)? == ReadState::Done {
            return Ok(());
        }
    }
}

fn response_error(e: ProtocolError) -> ClientError {
    match e {
        ProtocolError::UnexpectedHeader { expected, got } => {
            ClientError::UnexpectedResponse { expected, got }
        }
        other => other.into(),
    }
}
