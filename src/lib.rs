//! # ctree
//!
//! A concurrent, content-addressed compression store for variable-length
//! vectors of 32-bit words.
//!
//! Vectors are decomposed into implicit binary trees of 64-bit pairs;
//! every distinct pair is interned once in a lock-free hash set and named
//! by a compact surrogate index. A vector is thereafter a [`Handle`]
//! (surrogate + length) from which the content can be reconstructed, and
//! vectors that share a prefix, suffix or interior window share every
//! coinciding subtree's storage.
//!
//! ## Features
//!
//! - **Content addressing**: equal vectors always produce equal handles,
//!   under any interleaving of concurrent writers.
//! - **Structural sharing**: delta operations (point, sparse, extend,
//!   may-extend) intern only the O(log n) interior nodes they change and
//!   hand back the original handle when nothing changed.
//! - **Lock-free**: one CAS per interned pair; readers never wait, apart
//!   from a bounded spin for a half-published root record.
//! - **Flat storage**: surrogates are dense indices into two mmap-backed
//!   tables sized at construction; equality of content is equality of
//!   integers.
//!
//! ## Example
//!
//! ```rust
//! use ctree::{Config, CTree};
//!
//! let tree = CTree::with_config(Config::default());
//!
//! let a = tree.insert(&[1, 2, 3, 4, 5, 6], true).unwrap();
//! assert!(a.fresh());
//!
//! // Point update: only the touched spine is re-interned.
//! let b = tree.delta(a.handle(), 3, &[9], true).unwrap();
//! let mut out = [0u32; 6];
//! tree.get(b.handle(), &mut out, true);
//! assert_eq!(out, [1, 2, 3, 9, 5, 6]);
//!
//! // Writing the old word back lands on the original handle.
//! let c = tree.delta(b.handle(), 3, &[4], true).unwrap();
//! assert_eq!(c.handle(), a.handle());
//! ```
//!
//! The store is append-only for the life of the process: entries are
//! never removed or rewritten, and the tables do not resize. When a
//! table fills, mutating operations return
//! [`StoreError::TableFull`](crate::StoreError::TableFull).

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]

mod error;
mod handle;
pub mod hashset;
pub mod storage;
mod tree;

pub use error::StoreError;
pub use handle::{Handle, InsertResult};
pub use tree::{CTree, HopMode, MultiOffset, MultiProjection, SparseOffset};

/// Table sizing for the canonical separate-root store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// The root table holds `2^root_scale` 16-byte cells.
    pub root_scale: u32,
    /// The data table holds `2^data_scale` 8-byte cells.
    pub data_scale: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_scale: 22,
            data_scale: 22,
        }
    }
}


#[cfg(test)]
mod proptests;
