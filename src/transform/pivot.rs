//! Long → wide pivot, ordering and chunking.

use std::collections::BTreeMap;

use tracing::debug;

use crate::models::{Cell, OutputColumns, Reading, Timestamp, WideRow};

// ---

/// Group readings by `(timestamp, sensor_id)` into rows aligned to `columns`.
///
/// Metrics absent from a group become [`Cell::Missing`]. Properties outside
/// the configured tuple are skipped. Output is ascending by timestamp, then
/// sensor id.
pub fn pivot(readings: &[Reading], columns: &OutputColumns) -> Vec<WideRow> {
    // ---
    let mut groups: BTreeMap<(Timestamp, String), Vec<Cell>> = BTreeMap::new();
    let mut skipped = 0usize;

    for reading in readings {
        let Some(pos) = columns.position(&reading.observed_property) else {
            skipped += 1;
            continue;
        };
        let cells = groups
            .entry((reading.timestamp, reading.sensor_id.clone()))
            .or_insert_with(|| vec![Cell::Missing; columns.metrics.len()]);
        cells[pos] = match reading.value {
            Some(v) => Cell::Value(v),
            None => Cell::Missing,
        };
    }

    if skipped > 0 {
        debug!("Pivot skipped {} readings outside the output columns", skipped);
    }

    groups
        .into_iter()
        .map(|((timestamp, sensor_id), cells)| WideRow {
            timestamp,
            sensor_id,
            cells,
        })
        .collect()
}

/// Stable ascending sort by timestamp.
pub fn sort_rows(rows: &mut [WideRow]) {
    rows.sort_by_key(|r| r.timestamp);
}

/// Split into fixed-size batches. The last batch may be shorter.
pub fn chunk<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    // ---
    let size = size.max(1);
    let mut out = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        out.push(iter.by_ref().take(size).collect());
    }
    out
}
