//! End-to-end ingestion: a supplier CSV through loading, normalization,
//! staging, duplicate resolution, tax reconciliation and validation.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::NaiveDate;

use invox_engine::catalog::{ArticleMapping, MappingCatalog, SupplierMapping};
use invox_engine::model::{InvoiceHeader, NaturalKey};
use invox_engine::rates::{VatRateTable, VatRateVersion};
use invox_loader::{ColumnSpec, FormatEntry, LoadOptions};
use invox_store::{run_import, RunContext, Store};

const CSV: &str = "\
Facture;Date;Code TVA;Montant HT;Article;Type
INV-1;15/03/2026;RED;50,00;WIDGET;facture
INV-1;15/03/2026;STD;100,00;WIDGET;facture
INV-2;20/03/2026;STD;30,00;WIDGET;avoir
";

fn write_source(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("s042.csv");
    fs::write(&path, CSV).unwrap();
    path
}

fn format() -> FormatEntry {
    FormatEntry {
        options: LoadOptions::default(),
        columns: ColumnSpec::named([
            ("invoice_number", "Facture"),
            ("invoice_date", "Date"),
            ("vat_code", "Code TVA"),
            ("net_amount", "Montant HT"),
            ("article_code", "Article"),
            ("doc_kind", "Type"),
        ]),
    }
}

fn rates() -> VatRateTable {
    VatRateTable::new([
        VatRateVersion {
            code: "RED".into(),
            start_date: NaiveDate::from_ymd_opt(2014, 1, 1).unwrap(),
            rate_bp: 550,
        },
        VatRateVersion {
            code: "STD".into(),
            start_date: NaiveDate::from_ymd_opt(2014, 1, 1).unwrap(),
            rate_bp: 2000,
        },
    ])
}

fn catalog() -> MappingCatalog {
    let mut c = MappingCatalog {
        axes: vec!["family".into()],
        ..Default::default()
    };
    c.suppliers.insert(
        "S042".into(),
        SupplierMapping {
            ledger_account: "401S042".into(),
            location: Some("PARIS".into()),
        },
    );
    c.locations.insert("PARIS".into(), "627100".into());
    c.articles.insert(
        "WIDGET".into(),
        ArticleMapping {
            account: "607000".into(),
            axes: BTreeMap::from([("family".into(), "hardware".into())]),
        },
    );
    c
}

fn key(invoice: &str) -> NaturalKey {
    NaturalKey {
        supplier_id: "S042".into(),
        invoice_number: invoice.into(),
        invoice_year: 2026,
    }
}

fn headers() -> Vec<InvoiceHeader> {
    vec![
        InvoiceHeader {
            key: key("INV-1"),
            net_cents: 15000,
            tax_cents: 2015,
            with_tax_cents: 17015,
        },
        InvoiceHeader {
            key: key("INV-2"),
            net_cents: -3000,
            tax_cents: -600,
            with_tax_cents: -3600,
        },
    ]
}

#[test]
fn csv_import_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(&dir);
    let mut store = Store::open_in_memory().unwrap();
    let rates = rates();
    let catalog = catalog();
    let headers = headers();
    let ctx = RunContext {
        rates: &rates,
        catalog: &catalog,
        default_currency: "EUR",
        headers: &headers,
    };

    let outcome = run_import(&mut store, &source, &format(), Some("S042"), &ctx).unwrap();
    assert_eq!(outcome.created, 3);
    assert_eq!(outcome.errored, 0);
    assert_eq!(outcome.duplicate_keys, 0);
    assert_eq!(outcome.valid, 3);
    assert_eq!(outcome.allocations, 3);

    // Multi-rate invoice: naive share on the lower rate, residual on the
    // highest rate, summing exactly to the header tax.
    let allocs = store.allocations_for_key(&key("INV-1")).unwrap();
    assert_eq!(allocs.len(), 2);
    assert_eq!((allocs[0].rate_bp, allocs[0].tax_cents), (550, 275));
    assert_eq!((allocs[1].rate_bp, allocs[1].tax_cents), (2000, 1740));
    assert_eq!(allocs.iter().map(|a| a.tax_cents).sum::<i64>(), 2015);
    assert_eq!(allocs[1].with_tax_cents, 10000 + 1740);

    // Credit note carries negative amounts through reconciliation.
    let allocs = store.allocations_for_key(&key("INV-2")).unwrap();
    assert_eq!(allocs.len(), 1);
    assert_eq!(allocs[0].subtotal_cents, -3000);
    assert_eq!(allocs[0].tax_cents, -600);

    let trace = store.trace(&outcome.run_id).unwrap();
    assert_eq!(trace.created, 3);
    assert_eq!(trace.duplicates, 0);

    // All lines pass the mapping chain (supplier, default location,
    // article, axes), so consolidation sees every row.
    let usable = store.valid_lines().unwrap();
    assert_eq!(usable.len(), 3);
    assert!(usable.iter().all(|l| l.key.supplier_id == "S042"));
    let cn = usable
        .iter()
        .find(|l| l.key.invoice_number == "INV-2")
        .unwrap();
    assert_eq!(cn.net_cents, -3000);
    assert_eq!(cn.quantity, -1.0);

    // The outcome serializes for the surrounding application's run log.
    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["created"], 3);
    assert_eq!(json["valid"], 3);
    assert_eq!(json["run_id"], outcome.run_id.as_str());
}

#[test]
fn reimport_supersedes_the_older_batch() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(&dir);
    let mut store = Store::open_in_memory().unwrap();
    let rates = rates();
    let catalog = catalog();
    let headers = headers();
    let ctx = RunContext {
        rates: &rates,
        catalog: &catalog,
        default_currency: "EUR",
        headers: &headers,
    };

    let first = run_import(&mut store, &source, &format(), Some("S042"), &ctx).unwrap();
    let second = run_import(&mut store, &source, &format(), Some("S042"), &ctx).unwrap();

    assert_eq!(second.duplicate_keys, 2);
    assert_eq!(second.valid, 3);

    // Only the newer batch survives, and its rows carry the second run id.
    let active = store.active_lines().unwrap();
    assert_eq!(active.len(), 3);
    assert!(active.iter().all(|l| l.batch_id == second.run_id));
    assert!(active.iter().all(|l| l.batch_id != first.run_id));

    // The audit trail names both superseded keys plus the phase summary.
    let trace = store.trace(&second.run_id).unwrap();
    assert_eq!(trace.duplicates, 2);
    assert_eq!(trace.notes.len(), 3);
    assert!(trace.notes.iter().any(|n| n.contains("S042/INV-1/2026")));
    assert!(trace.notes.iter().any(|n| n.contains("S042/INV-2/2026")));
    assert!(trace.notes.iter().any(|n| n.contains("reconciled")));

    // Reconciliation replaced the allocations; totals still match.
    let allocs = store.allocations_for_key(&key("INV-1")).unwrap();
    assert_eq!(allocs.iter().map(|a| a.tax_cents).sum::<i64>(), 2015);

    assert_eq!(store.reap_superseded().unwrap(), 3);
}

#[test]
fn finalized_invoice_blocks_reingestion() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(&dir);
    let mut store = Store::open_in_memory().unwrap();
    store.add_finalized_key(&key("INV-1")).unwrap();
    let rates = rates();
    let catalog = catalog();
    let headers = headers();
    let ctx = RunContext {
        rates: &rates,
        catalog: &catalog,
        default_currency: "EUR",
        headers: &headers,
    };

    let outcome = run_import(&mut store, &source, &format(), Some("S042"), &ctx).unwrap();
    assert_eq!(outcome.duplicate_keys, 1);

    // Both INV-1 lines are gone; the credit note is untouched.
    let active = store.active_lines().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].key.invoice_number, "INV-2");
    assert!(store.allocations_for_key(&key("INV-1")).unwrap().is_empty());
}
