//! UF-DEX legacy CSV dialect.
//!
//! A response holds one or more tables. Metadata travels in `#` comment lines:
//!
//! ```text
//! # Begin CSV table
//! # site.id S0001
//! # sensor.id AQ_MESH_1
//! # number of points: 2
//! # Column_1 / Timestamp / s / time.epoch / Time of reading / int / -32768
//! # Column_2 / NO2 / ug/m3 / phys.conc / Nitrogen dioxide / float / -32768
//! 1700000000,12.5
//! 1700000900,-32768
//! # End CSV table
//! ```
//!
//! Each `Begin` resets the parser state and each `End` checks the number of
//! data rows against the declared `number of points`.

use super::delimited::parse_row;
use crate::error::{HarvestError, HarvestResult};
use crate::models::{FieldValue, RawReading};

// ---

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ColumnMeta {
    pub name: String,
    pub unit: String,
    pub ucd: String,
    pub description: String,
    pub kind: String,
    pub no_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UfdexTable {
    pub site_id: Option<String>,
    pub sensor_id: Option<String>,
    pub declared_points: Option<usize>,
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<String>>,
}

impl UfdexTable {
    /// Long-form readings: one per non-time column per row, keyed by the
    /// lower-cased column name. No-data values become `Null`.
    pub fn readings(&self) -> HarvestResult<Vec<RawReading>> {
        // ---
        let sensor = self
            .sensor_id
            .clone()
            .or_else(|| self.site_id.clone())
            .ok_or_else(|| HarvestError::Parse("UF-DEX table without site.id or sensor.id".into()))?;
        let site = self.site_id.clone().unwrap_or_else(|| sensor.clone());
        let time_col = self
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case("timestamp") || c.name.eq_ignore_ascii_case("time"))
            .unwrap_or(0);

        let mut out = Vec::with_capacity(self.rows.len() * self.columns.len().saturating_sub(1));
        for row in &self.rows {
            let timestamp = row.get(time_col).cloned().unwrap_or_default();
            for (i, column) in self.columns.iter().enumerate() {
                if i == time_col {
                    continue;
                }
                let text = row.get(i).map(|s| s.trim()).unwrap_or("");
                let value = if column.no_data.as_deref() == Some(text) {
                    FieldValue::Null
                } else {
                    FieldValue::Text(text.to_string())
                };
                out.push(
                    RawReading::new(sensor.clone(), timestamp.clone(), column.name.to_lowercase(), value)
                        .with_site(site.clone())
                        .with_unit(column.unit.clone()),
                );
            }
        }
        Ok(out)
    }
}

/// Line-at-a-time parser producing completed tables.
#[derive(Debug)]
pub struct UfdexParser {
    current: Option<UfdexTable>,
    delimiter: u8,
}

impl Default for UfdexParser {
    fn default() -> Self {
        UfdexParser::new()
    }
}

impl UfdexParser {
    pub fn new() -> Self {
        UfdexParser {
            current: None,
            delimiter: b',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Feed one line. Returns a table when its `End` marker is reached.
    pub fn push_line(&mut self, line: &str) -> HarvestResult<Option<UfdexTable>> {
        // ---
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(comment) = line.strip_prefix('#') {
            return self.comment(comment.trim());
        }
        if line.trim().is_empty() {
            return Ok(None);
        }
        let table = self
            .current
            .as_mut()
            .ok_or_else(|| HarvestError::Parse(format!("UF-DEX data outside a table: '{}'", line)))?;
        table.rows.push(parse_row(line, self.delimiter)?);
        Ok(None)
    }

    /// Error when input ends inside a table.
    pub fn finish(self) -> HarvestResult<()> {
        match self.current {
            Some(_) => Err(HarvestError::Parse("UF-DEX input ended inside a table".into())),
            None => Ok(()),
        }
    }

    fn comment(&mut self, text: &str) -> HarvestResult<Option<UfdexTable>> {
        // ---
        if text.eq_ignore_ascii_case("Begin CSV table") {
            self.current = Some(UfdexTable::default());
            return Ok(None);
        }
        if text.eq_ignore_ascii_case("End CSV table") {
            let table = self
                .current
                .take()
                .ok_or_else(|| HarvestError::Parse("UF-DEX End without Begin".into()))?;
            if let Some(declared) = table.declared_points {
                if declared != table.rows.len() {
                    return Err(HarvestError::Parse(format!(
                        "UF-DEX table declares {} points but holds {}",
                        declared,
                        table.rows.len()
                    )));
                }
            }
            return Ok(Some(table));
        }
        let Some(table) = self.current.as_mut() else {
            return Ok(None);
        };
        if let Some(rest) = text.strip_prefix("site.id") {
            table.site_id = Some(rest.trim().to_string());
        } else if let Some(rest) = text.strip_prefix("sensor.id") {
            table.sensor_id = Some(rest.trim().to_string());
        } else if let Some(rest) = text.strip_prefix("number of points:") {
            let n = rest
                .trim()
                .parse()
                .map_err(|_| HarvestError::Parse(format!("UF-DEX bad point count '{}'", rest.trim())))?;
            table.declared_points = Some(n);
        } else if text.starts_with("Column_") {
            let parts: Vec<&str> = text.split(" / ").map(str::trim).collect();
            let field = |i: usize| parts.get(i).map(|s| s.to_string()).unwrap_or_default();
            table.columns.push(ColumnMeta {
                name: field(1),
                unit: field(2),
                ucd: field(3),
                description: field(4),
                kind: field(5),
                no_data: parts.get(6).map(|s| s.to_string()),
            });
        }
        Ok(None)
    }
}

/// Parse a whole UF-DEX document.
pub fn parse_ufdex(text: &str) -> HarvestResult<Vec<UfdexTable>> {
    // ---
    let mut parser = UfdexParser::new();
    let mut tables = Vec::new();
    for line in text.lines() {
        if let Some(table) = parser.push_line(line)? {
            tables.push(table);
        }
    }
    parser.finish()?;
    Ok(tables)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    const DOC: &str = "\
# Begin CSV table
# site.id S0001
# number of points: 2
# Column_1 / Timestamp / s / time.epoch / Time of reading / int / -32768
# Column_2 / NO2 / ug/m3 / phys.conc / Nitrogen dioxide / float / -32768
1700000000,12.5
1700000900,-32768
# End CSV table
# Begin CSV table
# site.id S0002
# number of points: 0
# Column_1 / Timestamp / s / time.epoch / Time / int / -32768
# End CSV table
";

    #[test]
    fn test_blocks_reset_state() {
        // ---
        let tables = parse_ufdex(DOC).unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].site_id.as_deref(), Some("S0001"));
        assert_eq!(tables[0].columns.len(), 2);
        assert_eq!(tables[0].columns[1].unit, "ug/m3");
        assert_eq!(tables[1].site_id.as_deref(), Some("S0002"));
        assert!(tables[1].rows.is_empty());
    }

    #[test]
    fn test_readings_mark_no_data() {
        // ---
        let tables = parse_ufdex(DOC).unwrap();
        let readings = tables[0].readings().unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].property, "no2");
        assert_eq!(readings[0].value, FieldValue::Text("12.5".into()));
        assert_eq!(readings[1].value, FieldValue::Null);
        assert_eq!(readings[1].timestamp, "1700000900");
    }

    #[test]
    fn test_quoted_fields_keep_their_delimiter() {
        // ---
        let doc = "\
# Begin CSV table
# site.id S0003
# number of points: 1
# Column_1 / Timestamp / s / time.epoch / Time / int / -32768
# Column_2 / Status / - / meta.code / Status text / str / -
1700000000,\"ok, calibrated\"
# End CSV table
";
        let tables = parse_ufdex(doc).unwrap();
        assert_eq!(tables[0].rows[0], vec!["1700000000", "ok, calibrated"]);

        let mut parser = UfdexParser::new().with_delimiter(b';');
        parser.push_line("# Begin CSV table").unwrap();
        parser.push_line("1700000000;\"a;b\";3").unwrap();
        let table = parser.push_line("# End CSV table").unwrap().unwrap();
        assert_eq!(table.rows[0], vec!["1700000000", "a;b", "3"]);
    }

    #[test]
    fn test_point_count_mismatch_is_rejected() {
        // ---
        let doc = DOC.replace("number of points: 2", "number of points: 3");
        assert!(matches!(parse_ufdex(&doc), Err(HarvestError::Parse(_))));
    }

    #[test]
    fn test_unterminated_table() {
        // ---
        assert!(parse_ufdex("# Begin CSV table\n1,2\n").is_err());
    }
}
