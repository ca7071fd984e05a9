use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Deserialize;

/// One version of a VAT rate: valid from `start_date` until superseded by
/// a later version of the same code.
#[derive(Debug, Clone, Deserialize)]
pub struct VatRateVersion {
    pub code: String,
    pub start_date: NaiveDate,
    /// Rate in basis points (5.5% = 550).
    pub rate_bp: i64,
}

/// Temporally versioned VAT-rate table, injected read-only into the
/// normalizer. Resolution picks the most recent version whose start date
/// is on or before the invoice date.
#[derive(Debug, Clone, Default)]
pub struct VatRateTable {
    // Per code, versions sorted ascending by start date. Insertion order is
    // preserved for equal dates so the latest loaded version wins ties.
    versions: HashMap<String, Vec<(NaiveDate, i64)>>,
}

impl VatRateTable {
    pub fn new(versions: impl IntoIterator<Item = VatRateVersion>) -> Self {
        let mut table = Self::default();
        for v in versions {
            table.insert(v);
        }
        table
    }

    pub fn insert(&mut self, version: VatRateVersion) {
        let list = self.versions.entry(version.code).or_default();
        // Stable insert: place after any existing version with the same or
        // earlier start date.
        let pos = list.partition_point(|(d, _)| *d <= version.start_date);
        list.insert(pos, (version.start_date, version.rate_bp));
    }

    /// Resolve the rate for `code` applicable on `date`, or `None` when no
    /// version of that code had started yet.
    pub fn resolve(&self, code: &str, date: NaiveDate) -> Option<i64> {
        let list = self.versions.get(code)?;
        list.iter()
            .rev()
            .find(|(start, _)| *start <= date)
            .map(|(_, rate)| *rate)
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn table() -> VatRateTable {
        VatRateTable::new([
            VatRateVersion { code: "STD".into(), start_date: d("2000-01-01"), rate_bp: 1960 },
            VatRateVersion { code: "STD".into(), start_date: d("2014-01-01"), rate_bp: 2000 },
            VatRateVersion { code: "RED".into(), start_date: d("2012-01-01"), rate_bp: 700 },
            VatRateVersion { code: "RED".into(), start_date: d("2014-01-01"), rate_bp: 550 },
        ])
    }

    #[test]
    fn resolves_most_recent_started_version() {
        let t = table();
        assert_eq!(t.resolve("STD", d("2013-06-15")), Some(1960));
        assert_eq!(t.resolve("STD", d("2014-01-01")), Some(2000));
        assert_eq!(t.resolve("STD", d("2026-03-01")), Some(2000));
        assert_eq!(t.resolve("RED", d("2026-03-01")), Some(550));
    }

    #[test]
    fn date_before_first_version_is_unresolved() {
        let t = table();
        assert_eq!(t.resolve("RED", d("2011-12-31")), None);
    }

    #[test]
    fn unknown_code_is_unresolved() {
        let t = table();
        assert_eq!(t.resolve("ZZZ", d("2026-01-01")), None);
    }

    #[test]
    fn equal_start_dates_take_latest_inserted() {
        let mut t = table();
        t.insert(VatRateVersion { code: "STD".into(), start_date: d("2014-01-01"), rate_bp: 2100 });
        assert_eq!(t.resolve("STD", d("2014-01-02")), Some(2100));
    }
}
