//! Multi-rate, rounding-exact tax allocation.
//!
//! An invoice's header totals are legally binding; lines taxed at different
//! VAT rates, each independently rounded, will not generally sum to them.
//! Every rate but the highest-ranked gets its naive rounded tax; the
//! highest-ranked rate gets the residual, so the allocations sum to the
//! header exactly whatever rounding did.

use crate::model::{InvoiceHeader, StagingLine, TaxAllocation};

/// Naive per-rate tax: subtotal x rate, rounded half away from zero to
/// cents. Pure integer arithmetic, no float drift.
fn naive_tax_cents(subtotal_cents: i64, rate_bp: i64) -> i64 {
    let num = subtotal_cents * rate_bp;
    let q = num / 10_000;
    let r = num % 10_000;
    if r.abs() * 2 >= 10_000 {
        q + num.signum()
    } else {
        q
    }
}

/// Allocate `header`'s totals across the distinct VAT rates of the
/// invoice's active lines.
///
/// Rates are ranked ascending by value, ties broken by first appearance in
/// `lines` (stable, so reprocessing an unchanged batch reproduces identical
/// allocations). A rate whose subtotal nets to zero still gets an explicit
/// zero-valued row. No active lines means no allocations, not an error.
pub fn allocate(header: &InvoiceHeader, lines: &[StagingLine]) -> Vec<TaxAllocation> {
    // (rate_bp, subtotal) in first-seen order.
    let mut groups: Vec<(i64, i64)> = Vec::new();
    for line in lines {
        if !line.active || line.key != header.key {
            continue;
        }
        let Some(rate_bp) = line.vat_rate_bp else {
            // Unresolved rate: the line is already flagged for correction
            // and cannot take part in a per-rate split.
            continue;
        };
        match groups.iter_mut().find(|(r, _)| *r == rate_bp) {
            Some((_, subtotal)) => *subtotal += line.net_cents,
            None => groups.push((rate_bp, line.net_cents)),
        }
    }
    if groups.is_empty() {
        return Vec::new();
    }

    // Rank ascending by rate; equal rates keep their first-seen order.
    let mut order: Vec<usize> = (0..groups.len()).collect();
    order.sort_by_key(|&i| (groups[i].0, i));

    let mut allocations = Vec::with_capacity(groups.len());
    let mut naive_tax_sum = 0i64;
    let mut naive_with_tax_sum = 0i64;

    // All but the highest rank get the naive allocation.
    for (rank, &i) in order.iter().enumerate().take(order.len() - 1) {
        let (rate_bp, subtotal) = groups[i];
        let tax = naive_tax_cents(subtotal, rate_bp);
        let with_tax = subtotal + tax;
        naive_tax_sum += tax;
        naive_with_tax_sum += with_tax;
        allocations.push(TaxAllocation {
            key: header.key.clone(),
            rate_bp,
            rank: rank as u32,
            subtotal_cents: subtotal,
            tax_cents: tax,
            with_tax_cents: with_tax,
        });
    }

    // The highest rank absorbs the rounding drift.
    let Some(&top) = order.last() else {
        return allocations;
    };
    let (rate_bp, subtotal) = groups[top];
    allocations.push(TaxAllocation {
        key: header.key.clone(),
        rate_bp,
        rank: (order.len() - 1) as u32,
        subtotal_cents: subtotal,
        tax_cents: header.tax_cents - naive_tax_sum,
        with_tax_cents: header.with_tax_cents - naive_with_tax_sum,
    });

    allocations
}
