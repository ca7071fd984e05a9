use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::decode::decode_bytes;
use crate::error::LoadError;
use crate::sheet::{is_spreadsheet, spreadsheet_to_buffer};
use crate::spec::{ColumnSpec, ComputedField, ComputedValue, LoadOptions, SpecMode};

// ---------------------------------------------------------------------------
// Row shapes
// ---------------------------------------------------------------------------

/// Output strategy, chosen per `rows()` call. All three consume the same
/// column-resolved iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    /// One delimited text line per row.
    Line,
    /// Ordered value sequence, spec order then computed fields.
    Values,
    /// Name-keyed mapping, output field name -> value.
    Map,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Line(String),
    Values(Vec<String>),
    Map(BTreeMap<String, String>),
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Streaming loader over one decoded source buffer.
///
/// The buffer is owned exclusively and released when the loader is
/// dropped, whether iteration finished, was abandoned, or failed. Each
/// `rows()` call re-seeks to the configured start line, so the loader is
/// reusable across full passes; it holds no internal synchronization and
/// is not meant to be shared across concurrent callers.
pub struct Loader {
    buffer: String,
    options: LoadOptions,
    /// (output name, file column) per spec field, resolved eagerly.
    resolved: Vec<(String, usize)>,
    /// Records to skip on every pass: start-line offset plus the header
    /// row in named mode.
    skip: u64,
    computed: Vec<ComputedField>,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("buffer_bytes", &self.buffer.len())
            .field("options", &self.options)
            .field("resolved", &self.resolved)
            .field("skip", &self.skip)
            .field("computed", &self.computed)
            .finish()
    }
}

impl Loader {
    /// Open a source file. Spreadsheets are materialized into a delimited
    /// buffer first; flat text is decoded via encoding sniffing.
    pub fn from_path(
        path: impl AsRef<Path>,
        spec: ColumnSpec,
        options: LoadOptions,
    ) -> Result<Self, LoadError> {
        let path = path.as_ref();
        options.check_ascii()?;
        let buffer = if is_spreadsheet(path) {
            spreadsheet_to_buffer(path, options.delimiter as u8, options.quote as u8)?
        } else {
            decode_bytes(std::fs::read(path)?)?
        };
        debug!(path = %path.display(), bytes = buffer.len(), "source decoded");
        Self::from_buffer(buffer, spec, options)
    }

    /// Build a loader over an already-decoded buffer.
    pub fn from_buffer(
        buffer: String,
        spec: ColumnSpec,
        options: LoadOptions,
    ) -> Result<Self, LoadError> {
        options.check_ascii()?;
        let mode = spec.mode()?;

        // Eager structure checks: resolve names against the header and
        // verify the column count once, before any row is produced.
        let mut probe = make_reader(&buffer, &options).into_records();
        for _ in 1..options.start_line {
            if probe.next().transpose().map_err(record_error)?.is_none() {
                break;
            }
        }
        let first: Vec<String> = match probe.next().transpose().map_err(record_error)? {
            Some(record) => record.iter().map(str::to_string).collect(),
            None => Vec::new(),
        };

        let (resolved, header_rows) = match mode {
            SpecMode::Positional => {
                let requested = spec.fields.len();
                if first.len() < requested {
                    return Err(LoadError::ColumnCountMismatch {
                        requested,
                        found: first.len(),
                    });
                }
                let resolved = spec
                    .fields
                    .iter()
                    .enumerate()
                    .map(|(i, f)| (f.name.clone(), i))
                    .collect();
                (resolved, 0)
            }
            SpecMode::Indexed => {
                let requested = spec
                    .fields
                    .iter()
                    .filter_map(|f| f.index)
                    .max()
                    .map(|i| i + 1)
                    .unwrap_or(0);
                if first.len() < requested {
                    return Err(LoadError::ColumnCountMismatch {
                        requested,
                        found: first.len(),
                    });
                }
                let resolved = spec
                    .fields
                    .iter()
                    .map(|f| (f.name.clone(), f.index.unwrap_or(0)))
                    .collect();
                (resolved, 0)
            }
            SpecMode::Named => {
                let mut resolved = Vec::with_capacity(spec.fields.len());
                let mut missing = Vec::new();
                for field in &spec.fields {
                    let wanted = field.column.as_deref().unwrap_or(&field.name);
                    match first.iter().position(|h| h == wanted) {
                        Some(idx) => resolved.push((field.name.clone(), idx)),
                        None => missing.push(wanted.to_string()),
                    }
                }
                if !missing.is_empty() {
                    return Err(LoadError::ColumnNameNotFound {
                        missing,
                        present: first,
                    });
                }
                (resolved, 1)
            }
        };

        Ok(Self {
            buffer,
            skip: options.start_line.saturating_sub(1) + header_rows,
            options,
            resolved,
            computed: Vec::new(),
        })
    }

    /// Append a computed output field. Declared order is emission order,
    /// after all file-derived fields.
    pub fn with_computed(mut self, field: ComputedField) -> Self {
        self.computed.push(field);
        self
    }

    /// Iterate the source in the requested shape, starting over from the
    /// configured start line.
    pub fn rows(&mut self, shape: RowShape) -> Rows<'_> {
        let records = make_reader(&self.buffer, &self.options).into_records();
        Rows {
            records,
            remaining_skip: self.skip,
            shape,
            delimiter: self.options.delimiter,
            include_empty: self.options.include_empty,
            exclude: &self.options.exclude,
            resolved: &self.resolved,
            computed: &mut self.computed,
            failed: false,
        }
    }
}

fn make_reader<'a>(buffer: &'a str, options: &LoadOptions) -> csv::Reader<&'a [u8]> {
    let mut builder = csv::ReaderBuilder::new();
    builder
        .delimiter(options.delimiter as u8)
        .quote(options.quote as u8)
        .has_headers(false)
        .flexible(true);
    if let Some(t) = options.terminator {
        builder.terminator(csv::Terminator::Any(t as u8));
    }
    builder.from_reader(buffer.as_bytes())
}

fn record_error(e: csv::Error) -> LoadError {
    LoadError::MalformedRecord {
        line: e.position().map(|p| p.line()).unwrap_or(0),
        message: e.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Row iterator
// ---------------------------------------------------------------------------

/// Lazy row stream borrowed from a [`Loader`]. Fuses after the first
/// error: no row is yielded once the load has failed.
pub struct Rows<'a> {
    records: csv::StringRecordsIntoIter<&'a [u8]>,
    remaining_skip: u64,
    shape: RowShape,
    delimiter: char,
    include_empty: bool,
    exclude: &'a [crate::spec::ExclusionRule],
    resolved: &'a [(String, usize)],
    computed: &'a mut [ComputedField],
    failed: bool,
}

impl Iterator for Rows<'_> {
    type Item = Result<Row, LoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        while self.remaining_skip > 0 {
            self.records.next()?.ok();
            self.remaining_skip -= 1;
        }

        loop {
            let record = match self.records.next()? {
                Ok(r) => r,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(record_error(e)));
                }
            };
            let fields: Vec<&str> = record.iter().collect();

            if !self.include_empty && fields.iter().all(|f| f.is_empty()) {
                continue;
            }
            if self.exclude.iter().any(|rule| rule.matches(&fields)) {
                continue;
            }

            let mut values: Vec<String> = self
                .resolved
                .iter()
                .map(|(_, idx)| fields.get(*idx).copied().unwrap_or("").to_string())
                .collect();

            for cf in self.computed.iter_mut() {
                match &mut cf.value {
                    ComputedValue::Constant(v) => values.push(v.clone()),
                    ComputedValue::Generator(f) => match f() {
                        Ok(v) => values.push(v),
                        Err(message) => {
                            self.failed = true;
                            return Some(Err(LoadError::ComputedField {
                                field: cf.name.clone(),
                                message,
                            }));
                        }
                    },
                }
            }

            let row = match self.shape {
                RowShape::Line => Row::Line(values.join(&self.delimiter.to_string())),
                RowShape::Values => Row::Values(values),
                RowShape::Map => {
                    let names = self
                        .resolved
                        .iter()
                        .map(|(name, _)| name.as_str())
                        .chain(self.computed.iter().map(|c| c.name.as_str()));
                    Row::Map(names.map(str::to_string).zip(values).collect())
                }
            };
            return Some(Ok(row));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn opts(delimiter: char) -> LoadOptions {
        LoadOptions { delimiter, ..LoadOptions::default() }
    }

    #[test]
    fn named_columns_follow_spec_order() {
        // Requesting [b, a] from a file with header [a, b] yields b first.
        let buffer = "a;b\n1;2\n3;4\n".to_string();
        let spec = ColumnSpec::named([("b", "b"), ("a", "a")]);
        let mut loader = Loader::from_buffer(buffer, spec, opts(';')).unwrap();
        let rows: Vec<_> = loader
            .rows(RowShape::Values)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows[0], Row::Values(vec!["2".into(), "1".into()]));
        assert_eq!(rows[1], Row::Values(vec!["4".into(), "3".into()]));
    }

    #[test]
    fn missing_names_enumerate_both_sides() {
        let buffer = "a;b\n1;2\n".to_string();
        let spec = ColumnSpec::named([("a", "a"), ("x", "x"), ("y", "y")]);
        match Loader::from_buffer(buffer, spec, opts(';')) {
            Err(LoadError::ColumnNameNotFound { missing, present }) => {
                assert_eq!(missing, vec!["x".to_string(), "y".to_string()]);
                assert_eq!(present, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected ColumnNameNotFound, got {other:?}"),
        }
    }

    #[test]
    fn column_count_checked_before_any_row() {
        let buffer = "1;2;3\n4;5;6\n".to_string();
        let spec = ColumnSpec::positional(["a", "b", "c", "d", "e"]);
        match Loader::from_buffer(buffer, spec, opts(';')) {
            Err(LoadError::ColumnCountMismatch { requested, found }) => {
                assert_eq!(requested, 5);
                assert_eq!(found, 3);
            }
            other => panic!("expected ColumnCountMismatch, got {other:?}"),
        }
    }

    #[test]
    fn indexed_count_uses_highest_index() {
        let buffer = "1;2;3\n".to_string();
        let spec = ColumnSpec::indexed([("x", 0), ("y", 6)]);
        match Loader::from_buffer(buffer, spec, opts(';')) {
            Err(LoadError::ColumnCountMismatch { requested, found }) => {
                assert_eq!(requested, 7);
                assert_eq!(found, 3);
            }
            other => panic!("expected ColumnCountMismatch, got {other:?}"),
        }
    }

    #[test]
    fn indexed_mode_picks_columns() {
        let buffer = "1;2;3\n4;5;6\n".to_string();
        let spec = ColumnSpec::indexed([("last", 2), ("first", 0)]);
        let mut loader = Loader::from_buffer(buffer, spec, opts(';')).unwrap();
        let rows: Vec<_> = loader
            .rows(RowShape::Values)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows[0], Row::Values(vec!["3".into(), "1".into()]));
    }

    #[test]
    fn positional_mode_takes_leading_columns() {
        let buffer = "1;2;3\n".to_string();
        let spec = ColumnSpec::positional(["a", "b"]);
        let mut loader = Loader::from_buffer(buffer, spec, opts(';')).unwrap();
        let rows: Vec<_> = loader
            .rows(RowShape::Values)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows[0], Row::Values(vec!["1".into(), "2".into()]));
    }

    #[test]
    fn start_line_skips_leading_rows() {
        let buffer = "junk\njunk\nheader_a;header_b\n1;2\n".to_string();
        let spec = ColumnSpec::named([("header_b", "header_b")]);
        let options = LoadOptions { start_line: 3, ..opts(';') };
        let mut loader = Loader::from_buffer(buffer, spec, options).unwrap();
        let rows: Vec<_> = loader
            .rows(RowShape::Values)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows, vec![Row::Values(vec!["2".into()])]);
    }

    #[test]
    fn exclusion_rules_skip_matching_rows() {
        let buffer = "ref;label\nA1;ligne\nA2;Sous-TOTAL\nA3;ligne\n".to_string();
        let spec = ColumnSpec::named([("ref", "ref")]);
        let options = LoadOptions {
            exclude: vec![crate::spec::ExclusionRule { column: 1, contains: "total".into() }],
            ..opts(';')
        };
        let mut loader = Loader::from_buffer(buffer, spec, options).unwrap();
        let rows: Vec<_> = loader
            .rows(RowShape::Values)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            rows,
            vec![
                Row::Values(vec!["A1".into()]),
                Row::Values(vec!["A3".into()]),
            ]
        );
    }

    #[test]
    fn empty_rows_skipped_unless_opted_in() {
        let buffer = "a;b\n1;2\n;\n3;4\n".to_string();
        let spec = ColumnSpec::named([("a", "a")]);
        let mut loader = Loader::from_buffer(buffer.clone(), spec.clone(), opts(';')).unwrap();
        assert_eq!(loader.rows(RowShape::Values).count(), 2);

        let options = LoadOptions { include_empty: true, ..opts(';') };
        let mut loader = Loader::from_buffer(buffer, spec, options).unwrap();
        assert_eq!(loader.rows(RowShape::Values).count(), 3);
    }

    #[test]
    fn computed_fields_append_in_declared_order() {
        let buffer = "a\n1\n2\n".to_string();
        let spec = ColumnSpec::named([("a", "a")]);
        let mut counter = 0u32;
        let mut loader = Loader::from_buffer(buffer, spec, opts(';'))
            .unwrap()
            .with_computed(ComputedField::constant("batch", "b-7"))
            .with_computed(ComputedField::generator("seq", move || {
                counter += 1;
                Ok(counter.to_string())
            }));
        let rows: Vec<_> = loader
            .rows(RowShape::Values)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            rows[0],
            Row::Values(vec!["1".into(), "b-7".into(), "1".into()])
        );
        assert_eq!(
            rows[1],
            Row::Values(vec!["2".into(), "b-7".into(), "2".into()])
        );
    }

    #[test]
    fn generator_failure_is_fail_fast() {
        let buffer = "a\n1\n2\n".to_string();
        let spec = ColumnSpec::named([("a", "a")]);
        let mut loader = Loader::from_buffer(buffer, spec, opts(';'))
            .unwrap()
            .with_computed(ComputedField::generator("boom", || Err("no id".into())));
        let mut rows = loader.rows(RowShape::Values);
        match rows.next() {
            Some(Err(LoadError::ComputedField { field, message })) => {
                assert_eq!(field, "boom");
                assert_eq!(message, "no id");
            }
            other => panic!("expected ComputedField error, got {other:?}"),
        }
        // Fused: nothing after the failure.
        assert!(rows.next().is_none());
    }

    #[test]
    fn unique_ids_from_uuid_generator() {
        let buffer = "a\n1\n2\n".to_string();
        let spec = ColumnSpec::named([("a", "a")]);
        let mut loader = Loader::from_buffer(buffer, spec, opts(';'))
            .unwrap()
            .with_computed(ComputedField::generator("line_id", || {
                Ok(uuid::Uuid::new_v4().to_string())
            }));
        let rows: Vec<_> = loader
            .rows(RowShape::Map)
            .collect::<Result<_, _>>()
            .unwrap();
        let id = |row: &Row| match row {
            Row::Map(m) => m["line_id"].clone(),
            _ => unreachable!(),
        };
        assert_ne!(id(&rows[0]), id(&rows[1]));
    }

    #[test]
    fn map_shape_keys_by_output_name() {
        let buffer = "Montant HT;Num\n10,00;INV-1\n".to_string();
        let spec = ColumnSpec::named([("net_amount", "Montant HT"), ("invoice_number", "Num")]);
        let mut loader = Loader::from_buffer(buffer, spec, opts(';')).unwrap();
        let rows: Vec<_> = loader
            .rows(RowShape::Map)
            .collect::<Result<_, _>>()
            .unwrap();
        let Row::Map(m) = &rows[0] else { panic!() };
        assert_eq!(m["net_amount"], "10,00");
        assert_eq!(m["invoice_number"], "INV-1");
    }

    #[test]
    fn line_shape_joins_with_delimiter() {
        let buffer = "a;b\n1;2\n".to_string();
        let spec = ColumnSpec::named([("b", "b"), ("a", "a")]);
        let mut loader = Loader::from_buffer(buffer, spec, opts(';')).unwrap();
        let rows: Vec<_> = loader
            .rows(RowShape::Line)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows[0], Row::Line("2;1".into()));
    }

    #[test]
    fn loader_is_reusable_across_full_passes() {
        let buffer = "a\n1\n2\n".to_string();
        let spec = ColumnSpec::named([("a", "a")]);
        let mut loader = Loader::from_buffer(buffer, spec, opts(';')).unwrap();
        let first: Vec<_> = loader
            .rows(RowShape::Values)
            .collect::<Result<_, _>>()
            .unwrap();
        // Abandon a second pass midway, then run a full third pass.
        let _ = loader.rows(RowShape::Values).next();
        let third: Vec<_> = loader
            .rows(RowShape::Values)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn windows_1252_file_loads_via_sniffing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acme.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        // "libellé" in Windows-1252: é = 0xE9.
        f.write_all(b"ref;libell\xe9\nA1;caf\xe9\n").unwrap();
        drop(f);

        let spec = ColumnSpec::named([("label", "libellé")]);
        let mut loader = Loader::from_path(&path, spec, opts(';')).unwrap();
        let rows: Vec<_> = loader
            .rows(RowShape::Values)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows, vec![Row::Values(vec!["café".into()])]);
    }

    #[test]
    fn non_ascii_delimiter_rejected_eagerly() {
        let buffer = "a§b\n1§2\n".to_string();
        let spec = ColumnSpec::named([("a", "a")]);
        match Loader::from_buffer(buffer, spec, opts('§')) {
            Err(LoadError::NonAsciiOption { option, value }) => {
                assert_eq!(option, "delimiter");
                assert_eq!(value, '§');
            }
            other => panic!("expected NonAsciiOption, got {other:?}"),
        }
    }

    #[test]
    fn empty_file_with_requested_columns_fails_eagerly() {
        let spec = ColumnSpec::positional(["a", "b"]);
        match Loader::from_buffer(String::new(), spec, opts(';')) {
            Err(LoadError::ColumnCountMismatch { requested: 2, found: 0 }) => {}
            other => panic!("expected ColumnCountMismatch, got {other:?}"),
        }
    }
}
