//! # ETL Harness Core
//!
//! Pure, I/O-free logic for ETL Harness: the fragment extractor, record
//! canonicalizer, schema inference engine, query router, and the [`store`]
//! abstraction they talk to.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies. Every component is a synchronous
//! transformation over its explicit inputs; the only suspension points are
//! calls into a [`store::Store`] implementation supplied by the caller.
//!
//! ## Data Flow
//!
//! ```text
//! text ──▶ extract ──▶ Fragment[] ──▶ clean ──▶ cleaned records
//!                                          │
//!                                          ├──▶ schema::infer_and_merge ──▶ SourceSchema (+ history)
//!                                          └──▶ Store::insert_many
//!
//! StructuredQuery + SourceSchema ──▶ router::QueryRouter ──▶ Store::find / aggregate
//! ```

pub mod clean;
pub mod error;
pub mod extract;
pub mod models;
pub mod router;
pub mod schema;
pub mod store;

pub use error::EtlError;
pub use models::{Fragment, FragmentType, ParsedData, Record};
