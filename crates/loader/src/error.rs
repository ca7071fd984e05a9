use thiserror::Error;

/// Loader-level failures. All are fail-fast for the whole load: once one is
/// raised no further row is yielded.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Byte-level sniffing could not settle on a text encoding.
    #[error("cannot detect text encoding: {0}")]
    EncodingDetection(String),

    /// Spreadsheet could not be materialized into a delimited buffer.
    #[error("spreadsheet conversion failed for '{path}': {message}")]
    SpreadsheetConversion { path: String, message: String },

    /// The file has fewer columns than the specification requests.
    /// Checked once, eagerly, before any row is produced.
    #[error("source has {found} column(s), specification requires {requested}")]
    ColumnCountMismatch { requested: usize, found: usize },

    /// Named-mode resolution failed. Carries both sides so the operator can
    /// fix the registry entry without opening the file.
    #[error("column name(s) not found: [{}]; header has: [{}]", missing.join(", "), present.join(", "))]
    ColumnNameNotFound {
        missing: Vec<String>,
        present: Vec<String>,
    },

    /// A computed-field factory failed while emitting a row.
    #[error("computed field '{field}': {message}")]
    ComputedField { field: String, message: String },

    /// A parse option carries a character that cannot act as a single-byte
    /// delimiter, quote or terminator.
    #[error("option '{option}' must be an ASCII character, got {value:?}")]
    NonAsciiOption { option: &'static str, value: char },

    /// A column specification mixes positional, named and indexed sources.
    #[error("column specification mixes source modes (all entries must be positional, named, or indexed)")]
    MixedSpecModes,

    #[error("malformed record at line {line}: {message}")]
    MalformedRecord { line: u64, message: String },

    #[error("registry parse error: {0}")]
    RegistryParse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
