//! peer-cache: adaptive replacement cache with a peer-to-peer wire protocol.
//!
//! The crate has three layers:
//!   - [`cache`]: an in-process ARC engine whose values are created, loaded,
//!     unloaded and destroyed by a pluggable [`Backend`].
//!   - [`protocol`]: the framed, optionally signed binary message format, with
//!     a builder, a blocking reader and an incremental decoder.
//!   - [`client`]: RPCs against remote peers built on the protocol layer.

pub mod cache;
pub mod client;
pub mod config;
pub mod protocol;

pub use cache::{ArcCache, Backend, CacheHandle};
pub use client::{ClientError, PeerClient};
pub use config::Config;
pub use protocol::{Codec, Header, ProtocolError, SigningMode};
