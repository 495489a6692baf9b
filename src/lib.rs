//! # ETL Harness
//!
//! Schema-evolving ingestion of semi-structured documents.
//!
//! Documents (`.txt`, `.md`, `.pdf`) are scanned for embedded JSON, HTML
//! tables, CSV blocks and XML fragments. Extracted records are cleaned,
//! their schema is inferred and merged into a per-source versioned schema,
//! and the records are loaded into per-type collections that can be queried
//! with structured or natural-language queries.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌─────────────┐   ┌──────────┐
//! │  Decode  │──▶│   Extract    │──▶│ Clean+Infer │──▶│  SQLite  │
//! │ txt/pdf  │   │ JSON/HTML/.. │   │ Evolve(CAS) │   │  Store   │
//! └──────────┘   └──────────────┘   └─────────────┘   └────┬─────┘
//!                                                          │
//!                                    ┌─────────────────────┤
//!                                    ▼                     ▼
//!                              ┌──────────┐          ┌──────────┐
//!                              │   CLI    │          │   HTTP   │
//!                              │  (etl)   │          │  (axum)  │
//!                              └──────────┘          └──────────┘
//! ```
//!
//! Extraction, cleaning, schema inference and query routing live in
//! `etl-harness-core`; this crate adds persistence, decoding, translation
//! and the outer surfaces.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite-backed [`Store`](etl_harness_core::store::Store) |
//! | [`decode`] | Document bytes to text |
//! | [`ingest`] | Ingestion pipeline |
//! | [`translate`] | Natural-language to structured query translation |
//! | [`query`] | Query execution and history |
//! | [`server`] | HTTP API |

pub mod config;
pub mod db;
pub mod decode;
pub mod ingest;
pub mod migrate;
pub mod query;
pub mod server;
pub mod sqlite_store;
pub mod translate;
