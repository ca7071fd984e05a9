// Staging persistence on SQLite

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, Row as SqlRow};
use tracing::{debug, warn};

use invox_engine::catalog::MappingCatalog;
use invox_engine::model::{
    DocKind, ErrorReason, InvoiceHeader, NaturalKey, ProcessingTrace, StagingLine, TaxAllocation,
};
use invox_engine::{dedup, reconcile, validate};

use crate::error::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS staging_lines (
    id INTEGER PRIMARY KEY,
    supplier_id TEXT NOT NULL,
    invoice_number TEXT NOT NULL,
    invoice_year INTEGER NOT NULL,
    batch_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    doc_kind TEXT NOT NULL,            -- 'invoice' | 'credit_note'
    invoice_date TEXT NOT NULL,
    quantity REAL NOT NULL,
    unit_price_cents INTEGER NOT NULL,
    vat_code TEXT NOT NULL,
    vat_rate_bp INTEGER,               -- NULL = unresolved
    net_cents INTEGER NOT NULL,
    currency TEXT NOT NULL,
    article_code TEXT NOT NULL,
    location_code TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    valid INTEGER NOT NULL DEFAULT 0,
    error_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_staging_key
    ON staging_lines(supplier_id, invoice_number, invoice_year);
CREATE INDEX IF NOT EXISTS idx_staging_batch ON staging_lines(batch_id);

CREATE TABLE IF NOT EXISTS tax_allocations (
    id INTEGER PRIMARY KEY,
    supplier_id TEXT NOT NULL,
    invoice_number TEXT NOT NULL,
    invoice_year INTEGER NOT NULL,
    rate_bp INTEGER NOT NULL,
    rank INTEGER NOT NULL,
    subtotal_cents INTEGER NOT NULL,
    tax_cents INTEGER NOT NULL,
    with_tax_cents INTEGER NOT NULL,
    UNIQUE (supplier_id, invoice_number, invoice_year, rate_bp)
);

CREATE TABLE IF NOT EXISTS finalized_invoices (
    supplier_id TEXT NOT NULL,
    invoice_number TEXT NOT NULL,
    invoice_year INTEGER NOT NULL,
    PRIMARY KEY (supplier_id, invoice_number, invoice_year)
);

CREATE TABLE IF NOT EXISTS processing_traces (
    run_id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    errored INTEGER NOT NULL DEFAULT 0,
    duplicates INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS trace_notes (
    id INTEGER PRIMARY KEY,
    run_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    note TEXT NOT NULL
);
"#;

/// SQLite-backed staging store. One store per database; batch-oriented,
/// single writer per run (the caller's scheduler prevents interleaving).
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // -----------------------------------------------------------------
    // Traces
    // -----------------------------------------------------------------

    pub fn begin_run(&self, run_id: &str, started_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO processing_traces (run_id, started_at) VALUES (?1, ?2)",
            params![run_id, started_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn trace(&self, run_id: &str) -> Result<ProcessingTrace, StoreError> {
        let mut trace = self
            .conn
            .query_row(
                "SELECT run_id, started_at, created, updated, errored, duplicates
                 FROM processing_traces WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok(ProcessingTrace {
                        run_id: row.get(0)?,
                        started_at: parse_datetime(row.get::<_, String>(1)?),
                        created: row.get(2)?,
                        updated: row.get(3)?,
                        errored: row.get(4)?,
                        duplicates: row.get(5)?,
                        notes: Vec::new(),
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::UnknownRun(run_id.to_string())
                }
                other => StoreError::Db(other),
            })?;

        let mut stmt = self
            .conn
            .prepare("SELECT note FROM trace_notes WHERE run_id = ?1 ORDER BY id")?;
        let notes = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
        for note in notes {
            trace.notes.push(note?);
        }
        Ok(trace)
    }

    pub fn bump_errored(&self, run_id: &str, n: u32) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE processing_traces SET errored = errored + ?2 WHERE run_id = ?1",
            params![run_id, n],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Staging lines
    // -----------------------------------------------------------------

    /// Insert a batch of normalized lines under one transaction, bumping
    /// the run's created/errored counts.
    pub fn insert_lines(
        &mut self,
        run_id: &str,
        lines: &[StagingLine],
    ) -> Result<Vec<i64>, StoreError> {
        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(lines.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO staging_lines (
                    supplier_id, invoice_number, invoice_year, batch_id, created_at,
                    doc_kind, invoice_date, quantity, unit_price_cents, vat_code,
                    vat_rate_bp, net_cents, currency, article_code, location_code,
                    active, valid, error_reason
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
            )?;
            for line in lines {
                stmt.execute(params![
                    line.key.supplier_id,
                    line.key.invoice_number,
                    line.key.invoice_year,
                    line.batch_id,
                    line.created_at.to_rfc3339(),
                    line.kind.as_str(),
                    line.invoice_date.format("%Y-%m-%d").to_string(),
                    line.quantity,
                    line.unit_price_cents,
                    line.vat_code,
                    line.vat_rate_bp,
                    line.net_cents,
                    line.currency,
                    line.article_code,
                    line.location_code,
                    line.active as i64,
                    line.valid as i64,
                    line.error_reason.map(|r| r.as_str()),
                ])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        let errored = lines.iter().filter(|l| l.error_reason.is_some()).count();
        tx.execute(
            "UPDATE processing_traces SET created = created + ?2, errored = errored + ?3
             WHERE run_id = ?1",
            params![run_id, lines.len() as u32, errored as u32],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    pub fn active_lines(&self) -> Result<Vec<StagingLine>, StoreError> {
        query_lines(&self.conn, "WHERE active = 1")
    }

    pub fn lines_for_key(&self, key: &NaturalKey) -> Result<Vec<StagingLine>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_LINES} WHERE supplier_id = ?1 AND invoice_number = ?2
             AND invoice_year = ?3 ORDER BY id"
        ))?;
        let rows = stmt.query_map(
            params![key.supplier_id, key.invoice_number, key.invoice_year],
            line_from_row,
        )?;
        rows.collect::<Result<_, _>>().map_err(StoreError::Db)
    }

    // -----------------------------------------------------------------
    // Finalized keys
    // -----------------------------------------------------------------

    pub fn add_finalized_key(&self, key: &NaturalKey) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO finalized_invoices (supplier_id, invoice_number, invoice_year)
             VALUES (?1, ?2, ?3)",
            params![key.supplier_id, key.invoice_number, key.invoice_year],
        )?;
        Ok(())
    }

    pub fn finalized_keys(&self) -> Result<HashSet<NaturalKey>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT supplier_id, invoice_number, invoice_year FROM finalized_invoices")?;
        let keys = stmt.query_map([], |row| {
            Ok(NaturalKey {
                supplier_id: row.get(0)?,
                invoice_number: row.get(1)?,
                invoice_year: row.get(2)?,
            })
        })?;
        keys.collect::<Result<_, _>>().map_err(StoreError::Db)
    }

    // -----------------------------------------------------------------
    // Phase: duplicate resolution
    // -----------------------------------------------------------------

    /// Enforce natural-key uniqueness across staging and finalized
    /// invoices. One all-or-nothing transaction: audit notes are written
    /// before the deactivations, and any failure rolls the phase back.
    ///
    /// Returns the number of natural keys that had duplicates.
    pub fn resolve_duplicates(&mut self, run_id: &str) -> Result<u32, StoreError> {
        let tx = self.conn.transaction()?;

        let lines = query_lines(&tx, "WHERE active = 1")?;
        let finalized = {
            let mut stmt = tx.prepare(
                "SELECT supplier_id, invoice_number, invoice_year FROM finalized_invoices",
            )?;
            let keys = stmt.query_map([], |row| {
                Ok(NaturalKey {
                    supplier_id: row.get(0)?,
                    invoice_number: row.get(1)?,
                    invoice_year: row.get(2)?,
                })
            })?;
            keys.collect::<Result<HashSet<_>, _>>()?
        };

        let outcome = dedup::resolve_duplicates(&lines, &finalized);
        debug!(
            run_id,
            superseded = outcome.superseded_ids.len(),
            keys = outcome.duplicate_keys,
            "duplicate resolution"
        );

        // Notes first, deletion second. A missing trace is an anomaly but
        // never blocks duplicate elimination.
        let trace_exists: bool = tx
            .query_row(
                "SELECT 1 FROM processing_traces WHERE run_id = ?1",
                params![run_id],
                |_| Ok(()),
            )
            .is_ok();
        if trace_exists {
            let now = Utc::now().to_rfc3339();
            let mut stmt = tx.prepare(
                "INSERT INTO trace_notes (run_id, created_at, note) VALUES (?1, ?2, ?3)",
            )?;
            for note in &outcome.notes {
                stmt.execute(params![run_id, now, note])?;
            }
            tx.execute(
                "UPDATE processing_traces SET duplicates = duplicates + ?2 WHERE run_id = ?1",
                params![run_id, outcome.duplicate_keys],
            )?;
        } else {
            warn!(run_id, "no processing trace for run; duplicate notes dropped");
        }

        {
            let mut stmt =
                tx.prepare("UPDATE staging_lines SET active = 0, valid = 0 WHERE id = ?1")?;
            for id in &outcome.superseded_ids {
                stmt.execute(params![id])?;
            }
        }

        tx.commit()?;
        Ok(outcome.duplicate_keys)
    }

    /// Hard-delete rows previously marked superseded. Kept as an explicit
    /// second step so audits can run against either state.
    pub fn reap_superseded(&self) -> Result<usize, StoreError> {
        let n = self
            .conn
            .execute("DELETE FROM staging_lines WHERE active = 0", [])?;
        Ok(n)
    }

    // -----------------------------------------------------------------
    // Phase: tax reconciliation
    // -----------------------------------------------------------------

    /// Allocate header totals across each invoice's VAT rates. One
    /// transaction for the whole phase; existing allocations for a
    /// reprocessed invoice are replaced, so unchanged inputs reproduce
    /// identical rows. The phase leaves a summary note on the run's trace.
    ///
    /// Returns the number of allocation rows written.
    pub fn reconcile_invoices(
        &mut self,
        run_id: &str,
        headers: &[InvoiceHeader],
    ) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let mut written = 0usize;
        let mut reconciled = 0usize;
        {
            let mut delete = tx.prepare(
                "DELETE FROM tax_allocations
                 WHERE supplier_id = ?1 AND invoice_number = ?2 AND invoice_year = ?3",
            )?;
            let mut insert = tx.prepare(
                "INSERT INTO tax_allocations (
                    supplier_id, invoice_number, invoice_year, rate_bp, rank,
                    subtotal_cents, tax_cents, with_tax_cents
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            )?;
            let mut select = tx.prepare(&format!(
                "{SELECT_LINES} WHERE active = 1 AND supplier_id = ?1
                 AND invoice_number = ?2 AND invoice_year = ?3 ORDER BY id"
            ))?;

            for header in headers {
                let key = &header.key;
                let lines: Vec<StagingLine> = select
                    .query_map(
                        params![key.supplier_id, key.invoice_number, key.invoice_year],
                        line_from_row,
                    )?
                    .collect::<Result<_, _>>()?;

                let allocations = reconcile::allocate(header, &lines);
                delete.execute(params![
                    key.supplier_id,
                    key.invoice_number,
                    key.invoice_year
                ])?;
                for a in &allocations {
                    insert.execute(params![
                        a.key.supplier_id,
                        a.key.invoice_number,
                        a.key.invoice_year,
                        a.rate_bp,
                        a.rank,
                        a.subtotal_cents,
                        a.tax_cents,
                        a.with_tax_cents,
                    ])?;
                }
                if !allocations.is_empty() {
                    reconciled += 1;
                }
                written += allocations.len();
            }
        }

        let trace_exists: bool = tx
            .query_row(
                "SELECT 1 FROM processing_traces WHERE run_id = ?1",
                params![run_id],
                |_| Ok(()),
            )
            .is_ok();
        if trace_exists {
            tx.execute(
                "INSERT INTO trace_notes (run_id, created_at, note) VALUES (?1, ?2, ?3)",
                params![
                    run_id,
                    Utc::now().to_rfc3339(),
                    format!("reconciled {reconciled} invoice(s), {written} allocation row(s)"),
                ],
            )?;
        } else {
            warn!(run_id, "no processing trace for run; reconciliation note dropped");
        }

        tx.commit()?;
        Ok(written)
    }

    pub fn allocations_for_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Vec<TaxAllocation>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT rate_bp, rank, subtotal_cents, tax_cents, with_tax_cents
             FROM tax_allocations
             WHERE supplier_id = ?1 AND invoice_number = ?2 AND invoice_year = ?3
             ORDER BY rank",
        )?;
        let rows = stmt.query_map(
            params![key.supplier_id, key.invoice_number, key.invoice_year],
            |row| {
                Ok(TaxAllocation {
                    key: key.clone(),
                    rate_bp: row.get(0)?,
                    rank: row.get(1)?,
                    subtotal_cents: row.get(2)?,
                    tax_cents: row.get(3)?,
                    with_tax_cents: row.get(4)?,
                })
            },
        )?;
        rows.collect::<Result<_, _>>().map_err(StoreError::Db)
    }

    // -----------------------------------------------------------------
    // Phase: validation
    // -----------------------------------------------------------------

    /// Run the validator over all active lines and persist the outcome.
    /// Returns (valid, errored) counts. The run's `updated` count advances
    /// by the number of lines whose stored outcome changed, whichever
    /// direction the change went.
    pub fn validate_lines(
        &mut self,
        run_id: &str,
        catalog: &MappingCatalog,
    ) -> Result<(u32, u32), StoreError> {
        let tx = self.conn.transaction()?;
        let mut lines = query_lines(&tx, "WHERE active = 1")?;

        let mut valid = 0u32;
        let mut errored = 0u32;
        let mut changed = 0u32;
        {
            let mut stmt = tx.prepare(
                "UPDATE staging_lines SET valid = ?2, error_reason = ?3 WHERE id = ?1",
            )?;
            for line in &mut lines {
                let before = (line.valid, line.error_reason);
                validate::apply(line, catalog);
                if line.valid {
                    valid += 1;
                } else {
                    errored += 1;
                }
                if before != (line.valid, line.error_reason) {
                    changed += 1;
                }
                stmt.execute(params![
                    line.id,
                    line.valid as i64,
                    line.error_reason.map(|r| r.as_str())
                ])?;
            }
        }
        tx.execute(
            "UPDATE processing_traces SET updated = updated + ?2 WHERE run_id = ?1",
            params![run_id, changed],
        )?;
        tx.commit()?;
        Ok((valid, errored))
    }

    /// Lines usable by downstream consolidation: active and valid.
    pub fn valid_lines(&self) -> Result<Vec<StagingLine>, StoreError> {
        query_lines(&self.conn, "WHERE active = 1 AND valid = 1")
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const SELECT_LINES: &str = "SELECT id, supplier_id, invoice_number, invoice_year, batch_id,
    created_at, doc_kind, invoice_date, quantity, unit_price_cents, vat_code,
    vat_rate_bp, net_cents, currency, article_code, location_code, active, valid,
    error_reason FROM staging_lines";

fn query_lines(conn: &Connection, filter: &str) -> Result<Vec<StagingLine>, StoreError> {
    let mut stmt = conn.prepare(&format!("{SELECT_LINES} {filter} ORDER BY id"))?;
    let rows = stmt.query_map([], line_from_row)?;
    rows.collect::<Result<_, _>>().map_err(StoreError::Db)
}

fn line_from_row(row: &SqlRow<'_>) -> rusqlite::Result<StagingLine> {
    let kind_text: String = row.get(6)?;
    let reason_text: Option<String> = row.get(18)?;
    Ok(StagingLine {
        id: row.get(0)?,
        key: NaturalKey {
            supplier_id: row.get(1)?,
            invoice_number: row.get(2)?,
            invoice_year: row.get(3)?,
        },
        batch_id: row.get(4)?,
        created_at: parse_datetime(row.get::<_, String>(5)?),
        kind: DocKind::parse(&kind_text).unwrap_or(DocKind::Invoice),
        invoice_date: parse_date(row.get::<_, String>(7)?),
        quantity: row.get(8)?,
        unit_price_cents: row.get(9)?,
        vat_code: row.get(10)?,
        vat_rate_bp: row.get(11)?,
        net_cents: row.get(12)?,
        currency: row.get(13)?,
        article_code: row.get(14)?,
        location_code: row.get(15)?,
        active: row.get::<_, i64>(16)? != 0,
        valid: row.get::<_, i64>(17)? != 0,
        error_reason: reason_text.as_deref().and_then(ErrorReason::parse),
    })
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
}

fn parse_date(s: String) -> NaiveDate {
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").unwrap_or_default()
}
