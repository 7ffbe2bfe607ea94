//! Result assembly: one row per input identifier.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};

use crate::identifier::{Key, RawIdentifier};
use crate::properties::PropertySelection;
use crate::record::{CompoundRecord, PropertyValue};
use crate::resolve::{KeyList, Resolution, ResolutionOutcome};

/// Row status label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Status {
    /// Resolved to one record.
    Resolved,
    /// No such compound.
    NotFound,
    /// Several candidate compounds.
    Ambiguous,
    /// Rejected input.
    InvalidInput,
    /// Remote failure.
    TransportError,
}

impl Status {
    /// Label used in rendered output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolved => "Resolved",
            Self::NotFound => "NotFound",
            Self::Ambiguous => "Ambiguous",
            Self::InvalidInput => "InvalidInput",
            Self::TransportError => "TransportError",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One output row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    input: RawIdentifier,
    outcome: ResolutionOutcome,
    values: Vec<Option<PropertyValue>>,
}

impl Row {
    /// The identifier as supplied.
    #[must_use]
    pub fn input(&self) -> &RawIdentifier {
        &self.input
    }

    /// The full outcome.
    #[must_use]
    pub fn outcome(&self) -> &ResolutionOutcome {
        &self.outcome
    }

    /// Resolved key, if any.
    #[must_use]
    pub fn key(&self) -> Option<Key> {
        self.outcome.key()
    }

    /// Resolved record, if any.
    #[must_use]
    pub fn record(&self) -> Option<&Arc<CompoundRecord>> {
        self.outcome.record()
    }

    /// Status label.
    #[must_use]
    pub fn status(&self) -> Status {
        match self.outcome {
            ResolutionOutcome::Resolved { .. } => Status::Resolved,
            ResolutionOutcome::NotFound => Status::NotFound,
            ResolutionOutcome::Ambiguous { .. } => Status::Ambiguous,
            ResolutionOutcome::InvalidInput { .. } => Status::InvalidInput,
            ResolutionOutcome::TransportError { .. } => Status::TransportError,
        }
    }

    /// Reason, candidate list or failure, depending on status.
    #[must_use]
    pub fn detail(&self) -> Option<String> {
        match &self.outcome {
            ResolutionOutcome::Resolved { .. } | ResolutionOutcome::NotFound => None,
            ResolutionOutcome::Ambiguous { candidates } => {
                Some(format!("candidates: {}", KeyList(candidates)))
            }
            ResolutionOutcome::InvalidInput { reason } => Some(reason.clone()),
            ResolutionOutcome::TransportError { kind, message } => {
                Some(format!("{kind}: {message}"))
            }
        }
    }

    /// Property values in column order.
    #[must_use]
    pub fn values(&self) -> &[Option<PropertyValue>] {
        &self.values
    }
}

/// The table returned to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultTable {
    columns: Vec<&'static str>,
    rows: Vec<Row>,
}

impl ResultTable {
    /// Builds one row per resolution, in order. Property columns follow the
    /// selection; they are empty for every status except `Resolved`.
    #[must_use]
    pub fn assemble(resolutions: Vec<Resolution>, selection: &PropertySelection) -> Self {
        let columns = selection.names();
        let rows = resolutions
            .into_iter()
            .map(|resolution| {
                let values = columns
                    .iter()
                    .map(|column| {
                        resolution
                            .outcome
                            .record()
                            .and_then(|record| record.get(column).cloned())
                    })
                    .collect();
                Row {
                    input: resolution.input,
                    outcome: resolution.outcome,
                    values,
                }
            })
            .collect();
        Self { columns, rows }
    }

    /// Property column names.
    #[must_use]
    pub fn columns(&self) -> &[&'static str] {
        &self.columns
    }

    /// Rows in input order.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows with the given status.
    pub fn with_status(&self, status: Status) -> impl Iterator<Item = &Row> {
        self.rows.iter().filter(move |row| row.status() == status)
    }

    /// Value of `column` in row `row`.
    #[must_use]
    pub fn value(&self, row: usize, column: &str) -> Option<&PropertyValue> {
        let index = self.columns.iter().position(|c| *c == column)?;
        self.rows.get(row)?.values.get(index)?.as_ref()
    }

    /// Renders the table as JSON.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if a float is not representable.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Renders the table as comma-separated text with a header line.
    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        let header = ["input", "key", "status", "detail"]
            .into_iter()
            .chain(self.columns.iter().copied())
            .map(csv_field)
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&header);
        out.push('\n');

        for row in &self.rows {
            let mut fields = vec![
                csv_field(&row.input.to_string()),
                row.key().map(|key| key.to_string()).unwrap_or_default(),
                row.status().to_string(),
                csv_field(&row.detail().unwrap_or_default()),
            ];
            fields.extend(
                row.values
                    .iter()
                    .map(|value| value.as_ref().map(|v| csv_field(&v.to_string())).unwrap_or_default()),
            );
            let _ = writeln!(out, "{}", fields.join(","));
        }
        out
    }
}

impl ResultTable {
    /// Renders the table as left-aligned columns for a terminal.
    #[must_use]
    pub fn to_text(&self) -> String {
        let header: Vec<String> = ["input", "key", "status", "detail"]
            .into_iter()
            .chain(self.columns.iter().copied())
            .map(str::to_string)
            .collect();
        let mut widths: Vec<usize> = header.iter().map(|cell| cell.chars().count()).collect();

        let mut lines = vec![header];
        for row in &self.rows {
            let mut cells = vec![
                row.input.to_string(),
                row.key().map(|key| key.to_string()).unwrap_or_default(),
                row.status().to_string(),
                row.detail().unwrap_or_default(),
            ];
            cells.extend(
                row.values
                    .iter()
                    .map(|value| value.as_ref().map(ToString::to_string).unwrap_or_default()),
            );
            for (width, cell) in widths.iter_mut().zip(&cells) {
                *width = (*width).max(cell.chars().count());
            }
            lines.push(cells);
        }

        let mut out = String::new();
        for cells in lines {
            let line = cells
                .iter()
                .zip(&widths)
                .map(|(cell, width)| format!("{cell:<width$}"))
                .collect::<Vec<_>>()
                .join("  ");
            let _ = writeln!(out, "{}", line.trim_end());
        }
        out
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

struct Columns<'a> {
    names: &'a [&'static str],
    values: &'a [Option<PropertyValue>],
}

impl Serialize for Columns<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.names.len()))?;
        for (name, value) in self.names.iter().zip(self.values) {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

struct SerializedRow<'a> {
    row: &'a Row,
    columns: &'a [&'static str],
}

impl Serialize for SerializedRow<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Row", 5)?;
        state.serialize_field("input", &self.row.input)?;
        state.serialize_field("key", &self.row.key())?;
        state.serialize_field("status", &self.row.status())?;
        state.serialize_field("detail", &self.row.detail())?;
        state.serialize_field(
            "properties",
            &Columns {
                names: self.columns,
                values: &self.row.values,
            },
        )?;
        state.end()
    }
}

impl Serialize for ResultTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let rows: Vec<SerializedRow<'_>> = self
            .rows
            .iter()
            .map(|row| SerializedRow {
                row,
                columns: &self.columns,
            })
            .collect();
        let mut state = serializer.serialize_struct("ResultTable", 2)?;
        state.serialize_field("columns", &self.columns)?;
        state.serialize_field("rows", &rows)?;
        state.end()
    }
}
