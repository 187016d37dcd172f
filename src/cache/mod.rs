//! In-process adaptive replacement cache.
//!
//! This module contains the cache engine and its collaborators:
//! - [`backend`]: hooks the engine calls to create, fetch, evict and destroy values
//! - [`list`]: slot-arena state lists with per-list size accounting
//! - [`object`]: reference-counted cache objects and lookup handles
//! - [`arc`]: the ARC engine itself

pub mod arc;
pub mod backend;
pub mod list;
pub mod object;

pub use arc::{ArcCache, ArcStats};
pub use backend::Backend;
pub use list::ListKind;
pub use object::{CacheHandle, OBJECT_OVERHEAD};
