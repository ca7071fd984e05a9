use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The (supplier, invoice number, invoice year) tuple that legally
/// identifies one invoice. Unique among active rows across the staging
/// table and the finalized set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub supplier_id: String,
    pub invoice_number: String,
    pub invoice_year: i32,
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.supplier_id, self.invoice_number, self.invoice_year
        )
    }
}

/// Document type carried by every staging line. Drives the sign convention:
/// invoice lines are positive, credit-note lines negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocKind {
    Invoice,
    CreditNote,
}

impl DocKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::CreditNote => "credit_note",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invoice" => Some(Self::Invoice),
            "credit_note" => Some(Self::CreditNote),
            _ => None,
        }
    }

    /// Expected sign of quantity and net amount for this document type.
    pub fn sign(&self) -> i64 {
        match self {
            Self::Invoice => 1,
            Self::CreditNote => -1,
        }
    }
}

impl std::fmt::Display for DocKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

/// Why a staging line failed validation. Always one specific reason,
/// never a generic failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorReason {
    VatRateMissing,
    SupplierUnmapped,
    LocationUnmapped,
    ArticleUnmapped,
    AxisIncomplete,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VatRateMissing => "vat-rate-missing",
            Self::SupplierUnmapped => "supplier-unmapped",
            Self::LocationUnmapped => "location-unmapped",
            Self::ArticleUnmapped => "article-unmapped",
            Self::AxisIncomplete => "axis-incomplete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vat-rate-missing" => Some(Self::VatRateMissing),
            "supplier-unmapped" => Some(Self::SupplierUnmapped),
            "location-unmapped" => Some(Self::LocationUnmapped),
            "article-unmapped" => Some(Self::ArticleUnmapped),
            "axis-incomplete" => Some(Self::AxisIncomplete),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One imported, not-yet-finalized invoice line.
///
/// Lifecycle: created by the normalizer (`active=true`, `valid=false`),
/// deactivated by the duplicate resolver, marked valid or given a specific
/// `error_reason` by the validator. A line is never both valid and inactive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingLine {
    /// Storage identity. Zero until the line is persisted.
    pub id: i64,
    pub key: NaturalKey,
    /// Ingestion run that created this line.
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    pub kind: DocKind,
    pub invoice_date: NaiveDate,
    pub quantity: f64,
    pub unit_price_cents: i64,
    pub vat_code: String,
    /// Resolved VAT rate in basis points. `None` when no rate version
    /// covered the invoice date.
    pub vat_rate_bp: Option<i64>,
    pub net_cents: i64,
    pub currency: String,
    pub article_code: String,
    pub location_code: Option<String>,
    pub active: bool,
    pub valid: bool,
    pub error_reason: Option<ErrorReason>,
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Legally binding totals from the source document. Allocations must sum
/// to these exactly, whatever per-line rounding produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceHeader {
    pub key: NaturalKey,
    pub net_cents: i64,
    pub tax_cents: i64,
    pub with_tax_cents: i64,
}

/// One allocation row per (invoice, VAT rate). The highest-ranked rate
/// carries the residual that absorbs all rounding drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxAllocation {
    pub key: NaturalKey,
    pub rate_bp: i64,
    /// 0-based rank among the invoice's rates, ascending by rate value.
    pub rank: u32,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub with_tax_cents: i64,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Append-only audit record of one processing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingTrace {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub created: u32,
    pub updated: u32,
    pub errored: u32,
    pub duplicates: u32,
    pub notes: Vec<String>,
}

impl ProcessingTrace {
    pub fn new(run_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at,
            created: 0,
            updated: 0,
            errored: 0,
            duplicates: 0,
            notes: Vec::new(),
        }
    }

    pub fn append_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }
}
