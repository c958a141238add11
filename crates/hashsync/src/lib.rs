//! # hashsync
//!
//! Differential table synchronization between two relational databases.
//!
//! The engine walks each table's primary-key space, exchanging cryptographic
//! hashes over key ranges and adaptively subdividing until the two ends
//! either agree (skip the range) or the range is small enough to ship the
//! rows themselves. Only differing rows cross the wire, which makes it
//! practical to keep large, mostly-identical datasets converged over
//! bandwidth-constrained links.
//!
//! The two ends run symmetric worker sets over pre-opened byte streams, one
//! pair per worker: the destination drives the protocol and applies rows;
//! the source answers hash and row requests from a shared snapshot.
//! Database access is abstracted behind [`DatabaseClient`]; the crate ships
//! an in-memory driver used by the tests and the CLI.
//!
//! ## Example
//!
//! ```rust,no_run
//! use hashsync::drivers::memory::MemoryDb;
//! use hashsync::{sync_from, sync_to, Endpoint, SyncOptions};
//!
//! #[tokio::main]
//! async fn main() -> hashsync::Result<()> {
//!     let source = MemoryDb::from_json(r#"{"tables": []}"#)?;
//!     let destination = MemoryDb::from_json(r#"{"tables": []}"#)?;
//!
//!     let (dest_stream, src_stream) = tokio::io::duplex(64 * 1024);
//!     let (dest_in, dest_out) = tokio::io::split(dest_stream);
//!     let (src_in, src_out) = tokio::io::split(src_stream);
//!
//!     let from = tokio::spawn(sync_from(vec![Endpoint::new(source.client(), src_in, src_out)]));
//!     let stats = sync_to(
//!         vec![Endpoint::new(destination.client(), dest_in, dest_out)],
//!         SyncOptions::default(),
//!     )
//!     .await?;
//!     from.await.expect("source side panicked")?;
//!     println!("changed {} rows", stats.rows_changed);
//!     Ok(())
//! }
//! ```

pub mod applier;
pub mod client;
pub mod core;
pub mod drivers;
pub mod error;
pub mod hasher;
pub mod protocol;
pub mod queue;
pub mod scanner;
pub mod selector;
pub mod worker;

// Re-exports for convenient access
pub use crate::core::{Database, Key, KeyRange, Row, TableDef, Value};
pub use client::DatabaseClient;
pub use error::{Result, SyncError};
pub use hasher::HashAlgorithm;
pub use queue::SyncQueue;
pub use worker::{sync_from, sync_to, Endpoint, SyncOptions, SyncStats};
