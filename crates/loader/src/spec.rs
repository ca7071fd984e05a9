use std::collections::HashMap;

use serde::Deserialize;

use crate::error::LoadError;

// ---------------------------------------------------------------------------
// Column specification
// ---------------------------------------------------------------------------

/// One output field of a column specification. Exactly one of `column` /
/// `index` may be set; neither means positional.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnField {
    /// Output field name (key in the `Map` row shape, canonical name the
    /// downstream normalizer looks up).
    pub name: String,
    /// Header name to match, for named mode.
    #[serde(default)]
    pub column: Option<String>,
    /// Zero-based file column, for indexed mode.
    #[serde(default)]
    pub index: Option<usize>,
}

/// How a specification's fields address file columns. All fields of one
/// spec must share a single mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecMode {
    /// Fields take file columns in order, 0..N-1.
    Positional,
    /// Fields are matched against the header row by name.
    Named,
    /// Fields carry explicit zero-based column positions.
    Indexed,
}

/// Declarative column policy: which file columns become which output
/// fields. The mode is detected from the field values, never declared.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct ColumnSpec {
    pub fields: Vec<ColumnField>,
}

impl ColumnSpec {
    pub fn positional<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: names
                .into_iter()
                .map(|name| ColumnField { name: name.into(), column: None, index: None })
                .collect(),
        }
    }

    pub fn named<I, S, T>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(name, column)| ColumnField {
                    name: name.into(),
                    column: Some(column.into()),
                    index: None,
                })
                .collect(),
        }
    }

    pub fn indexed<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(name, index)| ColumnField {
                    name: name.into(),
                    column: None,
                    index: Some(index),
                })
                .collect(),
        }
    }

    /// Detect the addressing mode, rejecting mixed specifications.
    pub fn mode(&self) -> Result<SpecMode, LoadError> {
        let mut mode: Option<SpecMode> = None;
        for field in &self.fields {
            let this = match (&field.column, field.index) {
                (None, None) => SpecMode::Positional,
                (Some(_), None) => SpecMode::Named,
                (None, Some(_)) => SpecMode::Indexed,
                (Some(_), Some(_)) => return Err(LoadError::MixedSpecModes),
            };
            match mode {
                None => mode = Some(this),
                Some(m) if m == this => {}
                Some(_) => return Err(LoadError::MixedSpecModes),
            }
        }
        Ok(mode.unwrap_or(SpecMode::Positional))
    }
}

// ---------------------------------------------------------------------------
// Load options
// ---------------------------------------------------------------------------

/// Skip a row when the given file column contains `contains`,
/// case-insensitively.
#[derive(Debug, Clone, Deserialize)]
pub struct ExclusionRule {
    pub column: usize,
    pub contains: String,
}

impl ExclusionRule {
    pub fn matches(&self, fields: &[&str]) -> bool {
        let Some(value) = fields.get(self.column) else {
            return false;
        };
        value
            .to_lowercase()
            .contains(&self.contains.to_lowercase())
    }
}

/// Parsing parameters for one source format.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadOptions {
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_quote")]
    pub quote: char,
    /// Explicit record terminator; `None` accepts both LF and CRLF.
    #[serde(default)]
    pub terminator: Option<char>,
    /// 1-based line the load starts at. In named mode this is the header
    /// line and data begins on the next one.
    #[serde(default = "default_start_line")]
    pub start_line: u64,
    /// Emit rows whose every cell is empty (skipped by default).
    #[serde(default)]
    pub include_empty: bool,
    #[serde(default)]
    pub exclude: Vec<ExclusionRule>,
}

fn default_delimiter() -> char {
    ';'
}

fn default_quote() -> char {
    '"'
}

fn default_start_line() -> u64 {
    1
}

impl LoadOptions {
    /// Delimiter, quote and terminator act at the byte level inside the
    /// record parser; a non-ASCII character would be silently truncated,
    /// so reject it before any load starts.
    pub fn check_ascii(&self) -> Result<(), LoadError> {
        let checks = [
            ("delimiter", Some(self.delimiter)),
            ("quote", Some(self.quote)),
            ("terminator", self.terminator),
        ];
        for (option, value) in checks {
            if let Some(value) = value {
                if !value.is_ascii() {
                    return Err(LoadError::NonAsciiOption { option, value });
                }
            }
        }
        Ok(())
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            quote: default_quote(),
            terminator: None,
            start_line: default_start_line(),
            include_empty: false,
            exclude: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Computed fields
// ---------------------------------------------------------------------------

/// Value source for an injected output field: a constant, or a factory
/// invoked once per emitted row (per-row identifiers, timestamps).
pub enum ComputedValue {
    Constant(String),
    Generator(Box<dyn FnMut() -> Result<String, String>>),
}

impl std::fmt::Debug for ComputedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Constant(v) => f.debug_tuple("Constant").field(v).finish(),
            Self::Generator(_) => f.write_str("Generator(..)"),
        }
    }
}

/// An extra output field appended after file-derived fields, in declared
/// order.
#[derive(Debug)]
pub struct ComputedField {
    pub name: String,
    pub value: ComputedValue,
}

impl ComputedField {
    pub fn constant(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: ComputedValue::Constant(value.into()),
        }
    }

    pub fn generator(
        name: impl Into<String>,
        f: impl FnMut() -> Result<String, String> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            value: ComputedValue::Generator(Box::new(f)),
        }
    }
}

// ---------------------------------------------------------------------------
// Format registry
// ---------------------------------------------------------------------------

/// One registry entry: parsing parameters plus the column policy for a
/// supplier/format.
#[derive(Debug, Clone, Deserialize)]
pub struct FormatEntry {
    #[serde(flatten)]
    pub options: LoadOptions,
    pub columns: ColumnSpec,
}

/// Per-supplier format declarations, loaded from TOML by the surrounding
/// application and handed to the loader.
#[derive(Debug, Clone, Deserialize)]
pub struct FormatRegistry {
    pub formats: HashMap<String, FormatEntry>,
}

impl FormatRegistry {
    pub fn from_toml(text: &str) -> Result<Self, LoadError> {
        toml::from_str(text).map_err(|e| LoadError::RegistryParse(e.to_string()))
    }
}
