//! SQLite staging persistence and the batch ingestion pipeline.
//!
//! Holds the relational side of the ingestion core: the staging table,
//! tax allocations, the read-only finalized-invoice key set and the
//! append-only processing traces. Duplicate resolution, reconciliation
//! and validation each execute as one all-or-nothing transaction.

pub mod error;
pub mod pipeline;
pub mod store;

pub use error::StoreError;
pub use pipeline::{run_import, RunContext, RunOutcome};
pub use store::Store;
