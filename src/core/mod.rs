//! Stream layers and their shared infrastructure
//!
//! - [`stream`] - the [`PartStream`](stream::PartStream) seam and shared handles
//! - [`sparse`] - sparse in-memory buffer with disk overflow
//! - [`compression`] - pass-through and emulated compression
//! - [`encryption`] - block-cipher stream with length prefix and caches
//! - [`versioning`] - format version header in front of a part
//! - [`container`] - raw part factory and stack assembly

pub mod compression;
pub mod config;
pub mod container;
pub mod encryption;
pub mod error;
pub mod sparse;
pub mod stream;
pub mod versioning;
