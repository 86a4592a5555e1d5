//! BTT core
//!
//! - [`error`] - Error types
//! - [`layout`] - On-media structures and arena geometry
//! - [`namespace`] - Storage underneath a table
//! - [`config`] - Table configuration
//! - [`btt`] - The table handle and its read/write paths
//! - [`check`] - Offline consistency checking
//!
//! `arena`, `flog` and `map` hold the per-arena runtime state and are
//! internal.

pub(crate) mod arena;
pub mod btt;
pub mod check;
pub mod config;
pub mod error;
pub(crate) mod flog;
pub mod layout;
pub(crate) mod map;
pub mod namespace;
