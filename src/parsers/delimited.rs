//! Headed CSV documents as lower-cased records.

use std::collections::BTreeMap;

use csv::ReaderBuilder;

use crate::error::HarvestResult;

// ---

pub type Record = BTreeMap<String, String>;

/// Parse a headed document. Header names are trimmed and lower-cased.
pub fn parse_records(text: &str, delimiter: u8) -> HarvestResult<Vec<Record>> {
    // ---
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_lowercase()).collect();

    let mut out = Vec::new();
    for row in reader.records() {
        let row = row?;
        out.push(
            headers
                .iter()
                .zip(row.iter())
                .map(|(h, v)| (h.clone(), v.to_string()))
                .collect(),
        );
    }
    Ok(out)
}

/// Fields of one headerless line, quoting honoured and values trimmed.
pub fn parse_row(line: &str, delimiter: u8) -> HarvestResult<Vec<String>> {
    // ---
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(line.as_bytes());
    match reader.records().next() {
        Some(row) => Ok(row?.iter().map(str::to_string).collect()),
        None => Ok(Vec::new()),
    }
}
