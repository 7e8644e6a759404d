//! Payload parsers: OGC/INSPIRE XML, UF-DEX and plain CSV, JSON.

pub mod delimited;
pub mod json;
pub mod ufdex;
pub mod xml;

pub use delimited::{parse_records, parse_row, Record};
pub use ufdex::{parse_ufdex, ColumnMeta, UfdexParser, UfdexTable};
pub use xml::{parse_document, Element, TextEncoding};
