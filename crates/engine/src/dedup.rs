//! Natural-key uniqueness enforcement across the staging table and the
//! finalized invoice set.
//!
//! Pure decision logic: given the active staging lines and the finalized
//! keys, decide which lines are superseded and what audit notes to record.
//! Applying the `active=false` mutation (and persisting the notes first)
//! is the storage layer's job, inside one transaction.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

use crate::model::{NaturalKey, StagingLine};

/// Outcome of duplicate resolution over one staging snapshot.
#[derive(Debug, Default)]
pub struct DedupOutcome {
    /// Staging line ids to set `active=false`.
    pub superseded_ids: Vec<i64>,
    /// One audit note per resolved key, to append to the run's trace
    /// before the deactivation is committed.
    pub notes: Vec<String>,
    /// Number of distinct natural keys that had duplicates.
    pub duplicate_keys: u32,
}

/// Resolve natural-key duplicates among `lines`.
///
/// Cross-batch duplicates keep only the most recent batch's rows; a key
/// already present in `finalized` is a hard duplicate and loses all its
/// staging rows regardless of batch recency.
pub fn resolve_duplicates(
    lines: &[StagingLine],
    finalized: &HashSet<NaturalKey>,
) -> DedupOutcome {
    let mut outcome = DedupOutcome::default();

    // Group active lines by key, deterministically ordered.
    let mut by_key: BTreeMap<&NaturalKey, Vec<&StagingLine>> = BTreeMap::new();
    for line in lines.iter().filter(|l| l.active) {
        by_key.entry(&line.key).or_default().push(line);
    }

    for (key, group) in by_key {
        // Already invoiced: unconditional suppression.
        if finalized.contains(key) {
            outcome.superseded_ids.extend(group.iter().map(|l| l.id));
            outcome.notes.push(format!(
                "{key}: already finalized, {} staging line(s) superseded",
                group.len()
            ));
            outcome.duplicate_keys += 1;
            continue;
        }

        // Cross-batch duplicate: the newest batch wins. Equal timestamps
        // fall back to the batch id so the choice stays deterministic.
        let batches: Vec<(&str, DateTime<Utc>)> = group.iter().fold(Vec::new(), |mut acc, l| {
            if !acc.iter().any(|(b, _)| *b == l.batch_id) {
                acc.push((l.batch_id.as_str(), l.created_at));
            }
            acc
        });
        if batches.len() <= 1 {
            continue;
        }

        let Some(winner) = batches
            .iter()
            .max_by_key(|(batch_id, created_at)| (*created_at, *batch_id))
            .map(|(batch_id, _)| *batch_id)
        else {
            continue;
        };

        let losers: Vec<&&StagingLine> =
            group.iter().filter(|l| l.batch_id != winner).collect();
        outcome.superseded_ids.extend(losers.iter().map(|l| l.id));
        let mut superseded_batches: Vec<&str> =
            losers.iter().map(|l| l.batch_id.as_str()).collect();
        superseded_batches.sort_unstable();
        superseded_batches.dedup();
        outcome.notes.push(format!(
            "{key}: superseded by batch {winner}, older batch(es) {}",
            superseded_batches.join(", ")
        ));
        outcome.duplicate_keys += 1;
    }

    outcome
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};

    use super::*;
    use crate::model::DocKind;

    fn key(n: &str) -> NaturalKey {
        NaturalKey {
            supplier_id: "S042".into(),
            invoice_number: n.into(),
            invoice_year: 2026,
        }
    }

    fn line(id: i64, invoice: &str, batch: &str, day: u32) -> StagingLine {
        StagingLine {
            id,
            key: key(invoice),
            batch_id: batch.into(),
            created_at: Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).unwrap(),
            kind: DocKind::Invoice,
            invoice_date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            quantity: 1.0,
            unit_price_cents: 100,
            vat_code: "STD".into(),
            vat_rate_bp: Some(2000),
            net_cents: 100,
            currency: "EUR".into(),
            article_code: "WIDGET".into(),
            location_code: None,
            active: true,
            valid: false,
            error_reason: None,
        }
    }

    #[test]
    fn newest_batch_wins() {
        let lines = vec![
            line(1, "INV-1", "b1", 1),
            line(2, "INV-1", "b1", 1),
            line(3, "INV-1", "b2", 5),
        ];
        let outcome = resolve_duplicates(&lines, &HashSet::new());
        assert_eq!(outcome.superseded_ids, vec![1, 2]);
        assert_eq!(outcome.duplicate_keys, 1);
        assert_eq!(outcome.notes.len(), 1);
        assert!(outcome.notes[0].contains("S042/INV-1/2026"), "{}", outcome.notes[0]);
        assert!(outcome.notes[0].contains("b2"));
    }

    #[test]
    fn single_batch_is_left_alone() {
        let lines = vec![line(1, "INV-1", "b1", 1), line(2, "INV-1", "b1", 1)];
        let outcome = resolve_duplicates(&lines, &HashSet::new());
        assert!(outcome.superseded_ids.is_empty());
        assert_eq!(outcome.duplicate_keys, 0);
    }

    #[test]
    fn finalized_key_is_unconditional() {
        // The staging rows are newer than anything, still superseded.
        let lines = vec![line(1, "INV-1", "b9", 28), line(2, "INV-2", "b9", 28)];
        let finalized = HashSet::from([key("INV-1")]);
        let outcome = resolve_duplicates(&lines, &finalized);
        assert_eq!(outcome.superseded_ids, vec![1]);
        assert!(outcome.notes[0].contains("already finalized"));
    }

    #[test]
    fn inactive_lines_do_not_participate() {
        let mut old = line(1, "INV-1", "b1", 1);
        old.active = false;
        let lines = vec![old, line(2, "INV-1", "b2", 5)];
        let outcome = resolve_duplicates(&lines, &HashSet::new());
        assert!(outcome.superseded_ids.is_empty());
    }

    #[test]
    fn equal_timestamps_break_ties_by_batch_id() {
        let lines = vec![line(1, "INV-1", "b1", 3), line(2, "INV-1", "b2", 3)];
        let outcome = resolve_duplicates(&lines, &HashSet::new());
        // b2 > b1 lexicographically, so b1's row goes.
        assert_eq!(outcome.superseded_ids, vec![1]);
    }

    #[test]
    fn independent_keys_resolved_independently() {
        let lines = vec![
            line(1, "INV-1", "b1", 1),
            line(2, "INV-1", "b2", 5),
            line(3, "INV-2", "b1", 1),
        ];
        let outcome = resolve_duplicates(&lines, &HashSet::new());
        assert_eq!(outcome.superseded_ids, vec![1]);
        assert_eq!(outcome.duplicate_keys, 1);
    }
}
