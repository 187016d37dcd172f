//! Blocking peer operations.
//!
//! Every call builds one request frame, writes it, and (unless the caller
//! opted out of a reply) reads one response frame and maps it to a typed
//! result. Simple operations answer with a single status byte; fetches answer
//! with the raw value; the index call answers with an encoded catalog.

use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use super::async_fetch::{self, AsyncFetch, FetchEvent};
use super::connector::Connector;
use super::ClientError;
use crate::config::Config;
use crate::protocol::{
    decode_index, read_socket_message, status, write_message, Codec, Header, IndexItem,
};

/// Outcome of a set or add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    /// The peer stored the value.
    Stored,
    /// Add refused: the key already exists.
    Exists,
    /// Request written; no response was requested.
    Sent,
}

/// Client for the peer RPCs.
#[derive(Debug, Clone)]
pub struct PeerClient {
    codec: Codec,
    connector: Connector,
    io_timeout: Duration,
}

impl PeerClient {
    pub fn new(codec: Codec, connector: Connector, io_timeout: Duration) -> Self {
        Self {
            codec,
            connector,
            io_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Codec::from_config(&config.protocol),
            Connector::from_config(&config.peer),
            config.peer.io_timeout(),
        )
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Fetch the value of `key`. An empty value means the peer has none.
    pub fn fetch(
        &self,
        peer: &str,
        key: &[u8],
        conn: Option<&mut TcpStream>,
    ) -> Result<Bytes, ClientError> {
        debug!(peer, key = %String::from_utf8_lossy(key), "fetch");
        self.call(peer, conn, Header::Get, &[key], Header::Response)
            .map(BytesMut::freeze)
    }

    /// Fetch `len` bytes of `key`'s value starting at `offset`.
    pub fn fetch_offset(
        &self,
        peer: &str,
        key: &[u8],
        offset: u32,
        len: u32,
        conn: Option<&mut TcpStream>,
    ) -> Result<Bytes, ClientError> {
        debug!(peer, key = %String::from_utf8_lossy(key), offset, len, "fetch offset");
        let offset = offset.to_be_bytes();
        let len = len.to_be_bytes();
        self.call(
            peer,
            conn,
            Header::GetOffset,
            &[key, &offset[..], &len[..]],
            Header::Response,
        )
        .map(BytesMut::freeze)
    }

    /// Stream `key` from `peer` on the tokio runtime.
    ///
    /// The request is written before this returns; `callback` then receives
    /// the response data followed by one [`FetchEvent::Done`] or
    /// [`FetchEvent::Error`]. A connection passed in `conn` is handed back by
    /// [`AsyncFetch::wait`].
    pub async fn fetch_async<F>(
        &self,
        peer: &str,
        key: &[u8],
        offset: u32,
        len: u32,
        conn: Option<tokio::net::TcpStream>,
        callback: F,
    ) -> Result<AsyncFetch, ClientError>
    where
        F: FnMut(FetchEvent<'_>) -> std::ops::ControlFlow<()> + Send + 'static,
    {
        let stream = match conn {
            Some(stream) => async_fetch::Connection::Borrowed(stream),
            None => async_fetch::Connection::Owned(self.connector.connect_async(peer).await?),
        };
        async_fetch::fetch_async(
            stream,
            self.codec.clone(),
            self.io_timeout,
            key,
            offset,
            len,
            callback,
        )
        .await
    }

    /// Store a value. `expire` is in seconds; 0 keeps it forever.
    pub fn set(
        &self,
        peer: &str,
        key: &[u8],
        value: &[u8],
        expire: u32,
        expect_response: bool,
        conn: Option<&mut TcpStream>,
    ) -> Result<StoreStatus, ClientError> {
        self.store(peer, Header::Set, key, value, expire, expect_response, conn)
    }

    /// Store a value only if the key is absent.
    pub fn add(
        &self,
        peer: &str,
        key: &[u8],
        value: &[u8],
        expire: u32,
        expect_response: bool,
        conn: Option<&mut TcpStream>,
    ) -> Result<StoreStatus, ClientError> {
        self.store(peer, Header::Add, key, value, expire, expect_response, conn)
    }

    /// Delete `key` on its owner.
    pub fn delete(
        &self,
        peer: &str,
        key: &[u8],
        expect_response: bool,
        conn: Option<&mut TcpStream>,
    ) -> Result<(), ClientError> {
        self.drop_key(peer, Header::Delete, key, expect_response, conn)
    }

    /// Ask a non-owner peer to drop `key` from its local cache.
    pub fn evict(
        &self,
        peer: &str,
        key: &[u8],
        expect_response: bool,
        conn: Option<&mut TcpStream>,
    ) -> Result<(), ClientError> {
        self.drop_key(peer, Header::Evict, key, expect_response, conn)
    }

    pub fn exists(
        &self,
        peer: &str,
        key: &[u8],
        conn: Option<&mut TcpStream>,
    ) -> Result<bool, ClientError> {
        match self.status(peer, conn, Header::Exists, &[key])? {
            status::YES => Ok(true),
            status::NO => Ok(false),
            other => Err(ClientError::Status(other)),
        }
    }

    /// Refresh the expiry of `key`.
    pub fn touch(
        &self,
        peer: &str,
        key: &[u8],
        conn: Option<&mut TcpStream>,
    ) -> Result<(), ClientError> {
        let code = self.status(peer, conn, Header::Touch, &[key])?;
        expect_ok(code)
    }

    /// Human-readable statistics of the peer.
    pub fn stats(&self, peer: &str, conn: Option<&mut TcpStream>) -> Result<String, ClientError> {
        let out = self.call(peer, conn, Header::Stats, &[], Header::Response)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Health check.
    pub fn check(&self, peer: &str, conn: Option<&mut TcpStream>) -> Result<(), ClientError> {
        let code = self.status(peer, conn, Header::Check, &[])?;
        expect_ok(code)
    }

    /// Catalog of the keys `peer` holds.
    pub fn index(
        &self,
        peer: &str,
        conn: Option<&mut TcpStream>,
    ) -> Result<Vec<IndexItem>, ClientError> {
        let out = self.call(peer, conn, Header::GetIndex, &[], Header::IndexResponse)?;
        let items = decode_index(&out)?;
        debug!(peer, items = items.len(), "index");
        Ok(items)
    }

    /// Start a migration described by `payload`.
    pub fn migrate_begin(
        &self,
        peer: &str,
        payload: &[u8],
        conn: Option<&mut TcpStream>,
    ) -> Result<(), ClientError> {
        self.call(peer, conn, Header::MigrationBegin, &[payload], Header::Response)?;
        Ok(())
    }

    pub fn migrate_abort(&self, peer: &str, conn: Option<&mut TcpStream>) -> Result<(), ClientError> {
        let code = self.status(peer, conn, Header::MigrationAbort, &[])?;
        expect_ok(code)
    }

    #[allow(clippy::too_many_arguments)]
    fn store(
        &self,
        peer: &str,
        header: Header,
        key: &[u8],
        value: &[u8],
        expire: u32,
        expect_response: bool,
        conn: Option<&mut TcpStream>,
    ) -> Result<StoreStatus, ClientError> {
        let expire_bytes = expire.to_be_bytes();
        let mut records: Vec<&[u8]> = vec![key, value];
        if expire != 0 {
            records.push(&expire_bytes);
        }
        debug!(peer, %header, key = %String::from_utf8_lossy(key), len = value.len(), expire, "store");

        self.with_connection(peer, conn, |stream| {
            write_message(stream, &self.codec, header, &records)?;
            if !expect_response {
                return Ok(StoreStatus::Sent);
            }
            match self.read_status(peer, stream)? {
                status::OK => Ok(StoreStatus::Stored),
                status::EXISTS => Ok(StoreStatus::Exists),
                other => Err(ClientError::Status(other)),
            }
        })
    }

    fn drop_key(
        &self,
        peer: &str,
        header: Header,
        key: &[u8],
        expect_response: bool,
        conn: Option<&mut TcpStream>,
    ) -> Result<(), ClientError> {
        debug!(peer, %header, key = %String::from_utf8_lossy(key), "drop key");
        self.with_connection(peer, conn, |stream| {
            write_message(stream, &self.codec, header, &[key])?;
            if !expect_response {
                return Ok(());
            }
            expect_ok(self.read_status(peer, stream)?)
        })
    }

    /// Send a request and return the first byte of the response.
    fn status(
        &self,
        peer: &str,
        conn: Option<&mut TcpStream>,
        header: Header,
        records: &[&[u8]],
    ) -> Result<u8, ClientError> {
        self.with_connection(peer, conn, |stream| {
            write_message(stream, &self.codec, header, records)?;
            self.read_status(peer, stream)
        })
    }

    fn call(
        &self,
        peer: &str,
        conn: Option<&mut TcpStream>,
        header: Header,
        records: &[&[u8]],
        expected: Header,
    ) -> Result<BytesMut, ClientError> {
        self.with_connection(peer, conn, |stream| {
            write_message(stream, &self.codec, header, records)?;
            self.read_response(stream, expected)
        })
    }

    fn read_status(&self, peer: &str, stream: &mut TcpStream) -> Result<u8, ClientError> {
        let out = self.read_response(stream, Header::Response)?;
        let code = out.first().copied().ok_or(ClientError::EmptyResponse)?;
        debug!(peer, status = code, "response");
        Ok(code)
    }

    fn read_response(&self, stream: &mut TcpStream, expected: Header) -> Result<BytesMut, ClientError> {
        let mut out = BytesMut::new();
        let got = read_socket_message(stream, &self.codec, &mut out)?;
        if got != expected {
            return Err(ClientError::UnexpectedResponse { expected, got });
        }
        Ok(out)
    }

    /// Run `f` on the caller's connection, or on a fresh one closed afterwards.
    fn with_connection<T>(
        &self,
        peer: &str,
        conn: Option<&mut TcpStream>,
        f: impl FnOnce(&mut TcpStream) -> Result<T, ClientError>,
    ) -> Result<T, ClientError> {
        match conn {
            Some(stream) => f(stream),
            None => {
                let mut stream = self.connector.connect(peer)?;
                stream.set_read_timeout(Some(self.io_timeout))?;
                stream.set_write_timeout(Some(self.io_timeout))?;
                let result = f(&mut stream);
                let _ = stream.shutdown(Shutdown::Both);
                result
            }
        }
    }
}

fn expect_ok(code: u8) -> Result<(), ClientError> {
    if code == status::OK {
        Ok(())
    } else {
        Err(ClientError::Status(code))
    }
}
