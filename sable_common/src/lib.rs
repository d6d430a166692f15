//! Sable Common Library
//!
//! Shared constants, runtime parameters and log tag definitions for the
//! sable workspace.
//!
//! # Module Structure
//!
//! - [`consts`] - Fundamental shared-memory log constants
//! - [`params`] - Runtime parameter set with TOML loading
//! - [`tags`] - Record tag enum, names and flags
//! - [`mask`] - Runtime-mutable per-tag suppression bitmap
//! - [`txid`] - Transaction-id allocation
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! sable = { package = "sable_common", path = "../sable_common" }
//! ```

pub mod consts;
pub mod mask;
pub mod params;
pub mod tags;
pub mod txid;

pub use mask::TagMask;
pub use params::{ConfigError, LogParams};
pub use tags::{Tag, TagFlags};
pub use txid::{TxId, TxIdSource};
