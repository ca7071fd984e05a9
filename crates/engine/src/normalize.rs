use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use thiserror::Error;
use tracing::warn;

use crate::model::{DocKind, ErrorReason, NaturalKey, StagingLine};
use crate::rates::VatRateTable;

/// Per-row, non-fatal parse failure. The row is counted as errored and
/// skipped; the load itself continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("missing field '{0}'")]
    Missing(&'static str),
    #[error("field '{field}': cannot parse '{value}'")]
    Invalid { field: &'static str, value: String },
}

// ---------------------------------------------------------------------------
// Source line
// ---------------------------------------------------------------------------

/// One parsed source row, before monetary normalization. Field values come
/// from the loader's name-keyed row shape under the canonical field names
/// the format registry maps supplier columns onto.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLine {
    pub supplier_id: String,
    pub invoice_number: String,
    pub invoice_date: NaiveDate,
    pub kind: DocKind,
    pub quantity: f64,
    pub unit_price_cents: i64,
    pub vat_code: String,
    pub net_cents: i64,
    /// Empty when the source carries no currency column.
    pub currency: String,
    pub article_code: String,
    pub location_code: Option<String>,
}

impl SourceLine {
    /// Build a source line from a name-keyed loader row.
    ///
    /// Required fields: `supplier_id`, `invoice_number`, `invoice_date`,
    /// `vat_code`, `net_amount`. Everything else is optional and defaulted.
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self, FieldError> {
        let required = |name: &'static str| -> Result<&str, FieldError> {
            match fields.get(name).map(String::as_str) {
                Some(v) if !v.trim().is_empty() => Ok(v.trim()),
                _ => Err(FieldError::Missing(name)),
            }
        };
        let optional = |name: &str| -> Option<&str> {
            fields
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let invoice_date = parse_date(required("invoice_date")?)
            .ok_or_else(|| FieldError::Invalid {
                field: "invoice_date",
                value: fields["invoice_date"].clone(),
            })?;

        let kind = match optional("doc_kind") {
            None => DocKind::Invoice,
            Some(v) => parse_doc_kind(v).ok_or_else(|| FieldError::Invalid {
                field: "doc_kind",
                value: v.to_string(),
            })?,
        };

        let net_raw = required("net_amount")?;
        let net_cents = parse_amount_cents(net_raw).ok_or_else(|| FieldError::Invalid {
            field: "net_amount",
            value: net_raw.to_string(),
        })?;

        let unit_price_cents = match optional("unit_price") {
            None => 0,
            Some(v) => parse_amount_cents(v).ok_or_else(|| FieldError::Invalid {
                field: "unit_price",
                value: v.to_string(),
            })?,
        };

        let quantity = match optional("quantity") {
            None => 0.0,
            Some(v) => v
                .replace(',', ".")
                .parse::<f64>()
                .map_err(|_| FieldError::Invalid {
                    field: "quantity",
                    value: v.to_string(),
                })?,
        };

        Ok(Self {
            supplier_id: required("supplier_id")?.to_string(),
            invoice_number: required("invoice_number")?.to_string(),
            invoice_date,
            kind,
            quantity,
            unit_price_cents,
            vat_code: required("vat_code")?.to_string(),
            net_cents,
            currency: optional("currency").unwrap_or("").to_string(),
            article_code: optional("article_code").unwrap_or("").to_string(),
            location_code: optional("location_code").map(str::to_string),
        })
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    for fmt in ["%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y", "%Y%m%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    None
}

fn parse_doc_kind(s: &str) -> Option<DocKind> {
    match s.to_ascii_lowercase().as_str() {
        "invoice" | "inv" | "facture" => Some(DocKind::Invoice),
        "credit_note" | "credit-note" | "credit" | "cn" | "avoir" => Some(DocKind::CreditNote),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Amount parsing
// ---------------------------------------------------------------------------

/// Parse a monetary amount written with either `.` or `,` as the decimal
/// separator (and the other, plus spaces, as grouping) into minor units,
/// rounded half away from zero. Digit-wise, no float round-trip.
pub fn parse_amount_cents(s: &str) -> Option<i64> {
    let cleaned: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '\'')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let (sign, body) = match cleaned.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, cleaned.strip_prefix('+').unwrap_or(&cleaned)),
    };
    if body.is_empty() {
        return None;
    }

    // Locate the decimal separator: the rightmost '.' or ','. A lone
    // separator followed by exactly 3 digits with a 1-3 digit integral
    // part ("1,234") is read as grouping, the usual CSV-import convention.
    let last_sep = body.rfind(['.', ',']);
    let (int_part, frac_part) = match last_sep {
        None => (body, ""),
        Some(pos) => {
            let sep = body.as_bytes()[pos] as char;
            let frac = &body[pos + 1..];
            let int = &body[..pos];
            let same_sep_count = body.matches(sep).count();
            let other_present = body.contains(if sep == '.' { ',' } else { '.' });
            let grouping = !other_present
                && (same_sep_count > 1
                    || (frac.len() == 3 && (1..=3).contains(&int.len()) && int != "0"));
            if grouping {
                (body, "")
            } else {
                (int, frac)
            }
        }
    };

    let int_digits: String = int_part.chars().filter(|c| *c != '.' && *c != ',').collect();
    if !int_digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if !frac_part.chars().all(|c| c.is_ascii_digit()) || frac_part.len() > 6 {
        return None;
    }
    if int_digits.is_empty() && frac_part.is_empty() {
        return None;
    }

    let whole: i64 = if int_digits.is_empty() {
        0
    } else {
        int_digits.parse().ok()?
    };

    // Take two decimal places; round half away from zero on the third.
    let mut frac = frac_part.to_string();
    while frac.len() < 3 {
        frac.push('0');
    }
    let cents: i64 = frac[..2].parse().ok()?;
    let round_up = frac.as_bytes()[2] >= b'5';

    let mut minor = whole.checked_mul(100)?.checked_add(cents)?;
    if round_up {
        minor = minor.checked_add(1)?;
    }
    Some(sign * minor)
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

/// Converts source lines into staging lines with trustworthy monetary
/// semantics: defaults, VAT-rate resolution, sign-convention enforcement.
#[derive(Debug)]
pub struct Normalizer<'a> {
    rates: &'a VatRateTable,
    default_currency: String,
}

impl<'a> Normalizer<'a> {
    pub fn new(rates: &'a VatRateTable, default_currency: impl Into<String>) -> Self {
        Self {
            rates,
            default_currency: default_currency.into(),
        }
    }

    /// Normalize one source line into a staging line for `batch_id`.
    ///
    /// An unresolvable VAT code flags the line `vat-rate-missing` rather
    /// than failing: the row stays importable, correctable, reprocessable.
    pub fn normalize(
        &self,
        src: SourceLine,
        batch_id: &str,
        created_at: DateTime<Utc>,
    ) -> StagingLine {
        let sign = src.kind.sign();

        // Upstream suppliers are inconsistent about sign conventions, so
        // the document type wins over whatever sign the file carried.
        let quantity = {
            let q = if src.quantity == 0.0 || !src.quantity.is_finite() {
                1.0
            } else {
                src.quantity.abs()
            };
            q * sign as f64
        };
        let net_cents = src.net_cents.abs() * sign;

        let currency = if src.currency.is_empty() {
            self.default_currency.clone()
        } else {
            src.currency
        };

        let vat_rate_bp = self.rates.resolve(&src.vat_code, src.invoice_date);
        let error_reason = if vat_rate_bp.is_none() {
            warn!(
                vat_code = %src.vat_code,
                invoice_date = %src.invoice_date,
                "no VAT rate version covers the invoice date"
            );
            Some(ErrorReason::VatRateMissing)
        } else {
            None
        };

        StagingLine {
            id: 0,
            key: NaturalKey {
                supplier_id: src.supplier_id,
                invoice_number: src.invoice_number,
                invoice_year: src.invoice_date.year(),
            },
            batch_id: batch_id.to_string(),
            created_at,
            kind: src.kind,
            invoice_date: src.invoice_date,
            quantity,
            unit_price_cents: src.unit_price_cents.abs(),
            vat_code: src.vat_code,
            vat_rate_bp,
            net_cents,
            currency,
            article_code: src.article_code,
            location_code: src.location_code,
            active: true,
            valid: false,
            error_reason,
        }
    }
}
