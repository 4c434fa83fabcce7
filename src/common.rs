//! Backend-neutral expression model.
//!
//! Conditions and update actions address attributes through [`path::Path`] values and are
//! translated by each backend into its own request format.

/// Conditions for filters, range key constraints and conditional writes.
pub mod condition;

/// Key types identifying a single item.
pub mod key;

/// Attribute paths and the builders hanging off them.
pub mod path;

/// Update actions.
pub mod update;
