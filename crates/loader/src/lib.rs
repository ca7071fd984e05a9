//! Streaming delimited-text and spreadsheet loader.
//!
//! Converts heterogeneous supplier files into lazy, typed row streams
//! under a declarative column policy: positional, named (matched against
//! the header row) or indexed. Flat text goes through byte-level encoding
//! sniffing; spreadsheets are materialized into an internal delimited
//! buffer first. All structural errors are typed and fail-fast.

pub mod decode;
pub mod error;
pub mod reader;
pub mod sheet;
pub mod spec;

pub use error::LoadError;
pub use reader::{Loader, Row, RowShape, Rows};
pub use spec::{
    ColumnField, ColumnSpec, ComputedField, ComputedValue, ExclusionRule, FormatEntry,
    FormatRegistry, LoadOptions, SpecMode,
};
