//! Supplier-invoice normalization, deduplication and
//! multi-rate tax reconciliation.
//!
//! Pure engine crate: receives pre-loaded rows and injected reference data
//! (VAT-rate table, mapping catalog), returns normalized staging lines,
//! duplicate resolutions and penny-exact tax allocations. No IO dependencies.
//!
//! All monetary amounts are `i64` minor units (cents); VAT rates are `i64`
//! basis points. Reconciliation arithmetic is therefore exact by construction.

pub mod catalog;
pub mod dedup;
pub mod model;
pub mod normalize;
pub mod rates;
pub mod reconcile;
pub mod validate;

pub use catalog::MappingCatalog;
pub use dedup::{resolve_duplicates, DedupOutcome};
pub use model::{
    DocKind, ErrorReason, InvoiceHeader, NaturalKey, ProcessingTrace, StagingLine, TaxAllocation,
};
pub use normalize::{Normalizer, SourceLine};
pub use rates::{VatRateTable, VatRateVersion};
pub use reconcile::allocate;
