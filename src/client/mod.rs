//! Peer RPC client.
//!
//! Blocking operations live in [`peer`]; [`async_fetch`] streams a value from
//! a peer on the tokio runtime. Both take an optional caller-owned connection;
//! without one a fresh connection is opened for the call and closed after it.

pub mod async_fetch;
pub mod connector;
pub mod peer;

use std::io;

use crate::protocol::{Header, ProtocolError};

pub use async_fetch::{AsyncFetch, FetchEvent};
pub use connector::Connector;
pub use peer::{PeerClient, StoreStatus};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {peer}: {source}")]
    Connect { peer: String, source: io::Error },

    #[error("cannot resolve peer address {0}")]
    Resolve(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("expected {expected} response, got {got}")]
    UnexpectedResponse { expected: Header, got: Header },

    #[error("peer returned status 0x{0:02x}")]
    Status(u8),

    #[error("empty response")]
    EmptyResponse,

    #[error("timed out waiting for peer")]
    Timeout,

    #[error("no async runtime available")]
    Runtime,
}
