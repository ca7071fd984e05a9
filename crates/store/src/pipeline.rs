//! Batch pipeline: loader -> normalizer -> staging -> duplicate
//! resolution -> tax reconciliation -> validation.
//!
//! One call per ingestion run. Phases after staging each run under their
//! own transaction; rows the normalizer could not parse are counted as
//! errored and skipped, never aborting the run. Loader-level errors abort
//! the whole run before anything is persisted.

use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use invox_engine::catalog::MappingCatalog;
use invox_engine::model::InvoiceHeader;
use invox_engine::normalize::{Normalizer, SourceLine};
use invox_engine::rates::VatRateTable;
use invox_loader::{ComputedField, FormatEntry, Loader, Row, RowShape};

use crate::error::StoreError;
use crate::store::Store;

/// Outcome of one ingestion run, mirrored on the run's processing trace.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub created: u32,
    pub errored: u32,
    pub duplicate_keys: u32,
    pub valid: u32,
    pub allocations: usize,
}

/// Reference data injected into a run, read-only.
pub struct RunContext<'a> {
    pub rates: &'a VatRateTable,
    pub catalog: &'a MappingCatalog,
    pub default_currency: &'a str,
    /// Legally binding header totals for the invoices expected in this
    /// source, keyed by natural key.
    pub headers: &'a [InvoiceHeader],
}

/// Ingest one supplier file end to end.
///
/// `supplier_id` is injected as a constant computed field when the file
/// itself carries no supplier column.
pub fn run_import(
    store: &mut Store,
    source: &Path,
    format: &FormatEntry,
    supplier_id: Option<&str>,
    ctx: &RunContext<'_>,
) -> Result<RunOutcome, StoreError> {
    let run_id = Uuid::new_v4().to_string();
    let started_at = Utc::now();
    store.begin_run(&run_id, started_at)?;
    debug!(run_id, source = %source.display(), "ingestion run started");

    let mut loader = Loader::from_path(
        source,
        format.columns.clone(),
        format.options.clone(),
    )?;
    if let Some(supplier) = supplier_id {
        loader = loader.with_computed(ComputedField::constant("supplier_id", supplier));
    }

    let normalizer = Normalizer::new(ctx.rates, ctx.default_currency);
    let mut lines = Vec::new();
    let mut parse_errors = 0u32;

    for row in loader.rows(RowShape::Map) {
        let Row::Map(fields) = row? else {
            continue;
        };
        match SourceLine::from_fields(&fields) {
            Ok(src) => lines.push(normalizer.normalize(src, &run_id, started_at)),
            Err(e) => {
                warn!(run_id, error = %e, "unparseable row skipped");
                parse_errors += 1;
            }
        }
    }
    drop(loader); // decoded buffer released before the storage phases

    store.insert_lines(&run_id, &lines)?;
    if parse_errors > 0 {
        store.bump_errored(&run_id, parse_errors)?;
    }

    let duplicate_keys = store.resolve_duplicates(&run_id)?;
    let allocations = store.reconcile_invoices(&run_id, ctx.headers)?;
    let (valid, validation_errors) = store.validate_lines(&run_id, ctx.catalog)?;

    debug!(
        run_id,
        created = lines.len(),
        duplicate_keys,
        allocations,
        valid,
        "ingestion run finished"
    );

    Ok(RunOutcome {
        run_id,
        created: lines.len() as u32,
        errored: parse_errors + validation_errors,
        duplicate_keys,
        valid,
        allocations,
    })
}
