#![deny(missing_docs)]

//! # Modular SDK
//!
//! One data-access layer over two storage systems: a managed key-value store (DynamoDB) and a
//! self-hosted document store (MongoDB).
//!
//! ## Overview
//!
//! Models are declared once as a [`Schema`](schema::Schema) of typed fields with storage aliases.
//! A [`Table`](table::Table) binds a schema to a [`Backend`](backend::Backend) and offers the same
//! operations on both stores:
//! - get, save, update and delete of single items, optionally conditional
//! - query, scan and count with conditions, projections and resumable pagination
//! - batch get and batch write
//!
//! Conditions and update actions are written once as backend-neutral values and translated to
//! DynamoDB expression strings or MongoDB filter and update documents. Attributes that the
//! schema does not declare survive writes of items that were read before.
//!
//! ## Quick Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use modular_sdk::{
//!     backend::{Query, document::{DocumentBackend, memory::MemoryDatabase}},
//!     common::path::Path,
//!     schema::{AttributeType, Field, Schema, Value},
//!     table::Table,
//! };
//!
//! # fn main() -> modular_sdk::Result<()> {
//! let schema = Schema::builder("Jobs")
//!     .field(Field::new("tenant", AttributeType::Unicode).alias("t").hash_key())
//!     .field(Field::new("id", AttributeType::Unicode).alias("i").range_key())
//!     .field(Field::new("attempts", AttributeType::Number).alias("a"))
//!     .build()?;
//! let backend = DocumentBackend::new(Arc::new(MemoryDatabase::new()));
//! let table = Table::new(Arc::new(schema), Arc::new(backend));
//!
//! let mut job = table.new_item();
//! job.set("tenant", "acme").set("id", "job-1").set("attempts", 0);
//! table.save(&mut job)?;
//! table.update_if(&mut job, vec![Path::new("a").increment(1)], &Path::new("a").lt(3))?;
//!
//! let jobs: Vec<_> = table
//!     .query(Query {
//!         hash_key: Value::from("acme"),
//!         range_key_condition: Some(Path::new("i").begins_with("job-")),
//!         ..Default::default()
//!     })?
//!     .collect::<modular_sdk::Result<_>>()?;
//! assert_eq!(jobs[0].get("attempts"), Some(&Value::from(1)));
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`mod@schema`] - Field types, schemas and native values
//! - [`mod@common`] - Attribute paths, conditions, update actions and keys
//! - [`mod@table`] - The facade used by applications
//! - [`mod@backend`] - The key-value and document backends
//! - [`mod@context`] - Backend selection from the environment

/// Common building blocks: attribute paths, conditions, update actions and keys.
pub mod common;

/// Environment driven configuration.
pub mod config;

/// Backend selection and connection lifecycle.
pub mod context;

/// Pagination tokens and forward-only result cursors.
pub mod cursor;

/// Error type of the crate.
pub mod error;

/// Item instances.
pub mod item;

/// Optional `tracing` subscriber installation.
pub mod logging;

/// Secret parameter store contract and its caching wrapper.
pub mod parameters;

/// Preservation of undeclared stored attributes.
pub mod safe_update;

/// Attribute type registry and model schemas.
pub mod schema;

/// Storage backends.
pub mod backend;

/// Adapter facade binding a schema to a backend.
pub mod table;

pub use error::{Error, Result};
