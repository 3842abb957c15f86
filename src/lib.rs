//! # Ingest Harness
//!
//! A document ingestion pipeline that keeps a vector index in sync with a
//! set of source documents.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐  ┌────────┐  ┌─────────┐  ┌──────────┐  ┌──────────────┐
//! │ Sources │─▶│ Parser │─▶│ Chunker │─▶│ Embedder │─▶│ IndexManager │
//! │ FS / S3 │  │ by MIME│  │ overlap │  │ retrying │  │  reconcile   │
//! └─────────┘  └────────┘  └─────────┘  └──────────┘  └──────┬───────┘
//!                                                            ▼
//!                                                     ┌────────────┐
//!                                                     │ IndexStore │
//!                                                     │  (SQLite)  │
//!                                                     └────────────┘
//! ```
//!
//! The [`ingest::Pipeline`] drives items through these stages concurrently.
//! Re-running over unchanged sources writes nothing: chunks are matched to
//! stored records by content hash, and only unmatched chunks are embedded
//! and written.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`source`] | Source reader trait and locator routing |
//! | [`connector_fs`] | Local filesystem reader |
//! | [`connector_s3`] | Amazon S3 reader |
//! | [`parse`] | Format parsers |
//! | [`chunk`] | Overlapping chunker |
//! | [`embedding`] | Embedding providers |
//! | [`embedder`] | Batching, retries and rate limits around a provider |
//! | [`index`] | Reconciliation against the index |
//! | [`store`] | Index storage backends |
//! | [`ingest`] | Pipeline orchestration |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod connector_fs;
pub mod connector_s3;
pub mod db;
pub mod embedder;
pub mod embedding;
pub mod error;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod parse;
pub mod progress;
pub mod source;
pub mod stats;
pub mod store;
