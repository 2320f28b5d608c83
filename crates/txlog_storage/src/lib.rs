//! # txlog Storage
//!
//! File system abstraction for the txlog transaction log.
//!
//! The log never talks to the operating system directly. Every file it
//! opens, creates, lists, renames or deletes goes through a [`FileSystem`],
//! and every opened file is an opaque [`StorageBackend`] byte store.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (read, append, flush, sync, truncate)
//! - No knowledge of log headers, entries or rotation
//! - Must be `Send + Sync` for concurrent access
//! - Two handles on the same file observe each other's appended bytes
//!
//! ## Available File Systems
//!
//! - [`OsFileSystem`] - Persistent storage using OS file APIs
//! - [`InMemoryFileSystem`] - Deterministic double for tests, able to
//!   simulate a crash that loses every byte not yet synced
//!
//! ## Example
//!
//! ```rust
//! use std::path::Path;
//! use txlog_storage::{FileSystem, InMemoryFileSystem};
//!
//! let fs = InMemoryFileSystem::new();
//! let mut file = fs.create(Path::new("db/log.v0")).unwrap();
//! let offset = file.append(b"hello world").unwrap();
//! let data = file.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod fs;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::{FileBackend, OsFileSystem};
pub use fs::FileSystem;
pub use memory::{InMemoryFile, InMemoryFileSystem};
