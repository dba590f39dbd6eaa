//! `avs` is a single-container object store worker: one thread owns one
//! append-only object file (the "AVS") plus a metadata key-value index, and
//! serializes all reads, writes, deletes and online compactions against the
//! pair. A higher layer runs many such workers per node and routes requests
//! by hashing the object key to a worker.
//!
//! The container's public path is a stable symlink; the file it resolves to
//! is the currently-live raw AVS. Deletes append tombstones. Compaction
//! copies the live records into a fresh raw file, re-points the symlink and
//! drops the old file, with the metadata index following along in a
//! two-phase compact mode. [Author fengyang]
//!
//! ## Getting started
//!
//! ```no_run
//! use avs::container::server;
//! use avs::error::CResult;
//! use avs::object::Object;
//!
//! fn main() -> CResult<()> {
//!     let root = std::env::temp_dir().join("avs-demo");
//!
//!     let worker = server::start_link("w0", 1, "m0", &root)?;
//!     worker.put(Object::new(42, b"greeting".to_vec(), b"hello".to_vec()))?;
//!
//!     let (_meta, body) = worker.get(42, b"greeting", 0, -1)?;
//!     assert_eq!(body, b"hello");
//!
//!     worker.delete(Object::new(42, b"greeting".to_vec(), Vec::new()))?;
//!     worker.compact(|_key: &[u8]| true)?;
//!
//!     worker.stop()
//! }
//! ```

pub mod codec;
pub mod container;
pub mod error;
pub mod handles;
pub mod metadb;
pub mod object;
pub mod paths;
pub mod stats;
