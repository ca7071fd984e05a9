//! Validation state machine gating a staging line into the
//! accounting-usable set.
//!
//! A line starts unvalidated and either becomes valid (terminal) or keeps
//! a specific error reason for the operator to correct. Validation never
//! raises; deactivation is the duplicate resolver's business, never ours.

use crate::catalog::MappingCatalog;
use crate::model::{ErrorReason, StagingLine};

/// Check one line against the full requirement chain, in order:
/// VAT rate, supplier mapping, counterpart location, article mapping,
/// complete classification axes. The first unmet requirement wins.
pub fn check_line(line: &StagingLine, catalog: &MappingCatalog) -> Result<(), ErrorReason> {
    if line.vat_rate_bp.is_none() {
        return Err(ErrorReason::VatRateMissing);
    }
    if catalog.supplier(&line.key.supplier_id).is_none() {
        return Err(ErrorReason::SupplierUnmapped);
    }
    if catalog
        .counterpart_account(&line.key.supplier_id, line.location_code.as_deref())
        .is_none()
    {
        return Err(ErrorReason::LocationUnmapped);
    }
    let Some(article) = catalog.article(&line.article_code) else {
        return Err(ErrorReason::ArticleUnmapped);
    };
    if !catalog.axes_complete(article) {
        return Err(ErrorReason::AxisIncomplete);
    }
    Ok(())
}

/// Apply the validator to `line`, setting either `valid=true` or the
/// specific `error_reason`. Inactive lines are skipped: a superseded row
/// must never become valid.
pub fn apply(line: &mut StagingLine, catalog: &MappingCatalog) {
    if !line.active {
        return;
    }
    match check_line(line, catalog) {
        Ok(()) => {
            line.valid = true;
            line.error_reason = None;
        }
        Err(reason) => {
            line.valid = false;
            line.error_reason = Some(reason);
        }
    }
}
