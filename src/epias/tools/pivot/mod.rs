use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::epias::tools::io::excel_read::{self, ExportSheet};
use crate::epias::tools::model::{Manifest, PivotColumn, PivotTable};

/// Source unit (MWh) to pivot unit (kWh).
pub const UNIT_FACTOR: f64 = 1000.0;
/// Header of the manifest's id column. Also an accepted input id header, so a
/// rewritten workbook can be fed back in.
pub const MANIFEST_ID_HEADER: &str = "Meter ID";
/// Header of the manifest's path column.
pub const MANIFEST_PATH_HEADER: &str = "File Path";

/// A single spreadsheet cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    /// Excel serial date; written back as a plain number.
    DateTime(f64),
}

/// A table that will be materialised as an Excel sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetTable {
    pub sheet_name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    /// Whether the header row gets an autofilter.
    pub autofilter: bool,
}

/// All sheets of a workbook, in tab order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkbookData {
    pub tables: Vec<SheetTable>,
}

impl WorkbookData {
    pub fn table(&self, name: &str) -> Option<&SheetTable> {
        self.tables.iter().find(|table| table.sheet_name == name)
    }

    /// Replaces the sheet with the same name in place, or appends it.
    pub fn upsert(&mut self, table: SheetTable) {
        match self
            .tables
            .iter_mut()
            .find(|existing| existing.sheet_name == table.sheet_name)
        {
            Some(existing) => *existing = table,
            None => self.tables.push(table),
        }
    }
}

/// Coerces a reading to the pivot unit. Anything that is not a finite number
/// becomes zero.
pub fn coerce_reading(cell: &CellValue) -> f64 {
    let value = match cell {
        CellValue::Number(value) => *value,
        CellValue::Bool(value) => f64::from(u8::from(*value)),
        CellValue::Text(text) => text.trim().parse::<f64>().unwrap_or(0.0),
        CellValue::Empty | CellValue::DateTime(_) => 0.0,
    };
    let converted = value * UNIT_FACTOR;
    if converted.is_finite() { converted } else { 0.0 }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn column_from_export(path: &Path, export: ExportSheet) -> PivotColumn {
    let label = match export.label.trim() {
        "" => file_label(path),
        label => label.to_string(),
    };
    PivotColumn {
        label,
        cells: export.readings.iter().map(coerce_reading).collect(),
    }
}

/// Builds the pivot from downloaded exports, one column per path in the given
/// order. Unreadable files still get a column, labelled with the file name and
/// left empty.
pub fn build_pivot(paths: &[PathBuf], index_header: &str) -> PivotTable {
    let columns = paths
        .iter()
        .map(|path| match excel_read::read_export(path) {
            Ok(export) => {
                let column = column_from_export(path, export);
                debug!(path = %path.display(), rows = column.cells.len(), "export folded into pivot");
                column
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "could not read export, column left empty");
                PivotColumn {
                    label: file_label(path),
                    cells: Vec::new(),
                }
            }
        })
        .collect();

    PivotTable {
        index_header: index_header.to_string(),
        columns,
    }
}

/// Lays the pivot out as a sheet: 1-based hour index first, then one column
/// per meter. Rows past a short column stay empty.
pub fn pivot_sheet(sheet_name: &str, pivot: &PivotTable) -> SheetTable {
    let mut columns = Vec::with_capacity(pivot.columns.len() + 1);
    columns.push(pivot.index_header.clone());
    columns.extend(pivot.columns.iter().map(|column| column.label.clone()));

    let rows = (0..pivot.row_count())
        .map(|row| {
            let mut cells = Vec::with_capacity(columns.len());
            cells.push(CellValue::Number((row + 1) as f64));
            cells.extend((0..pivot.columns.len()).map(|column| {
                pivot
                    .cell(row, column)
                    .map(CellValue::Number)
                    .unwrap_or(CellValue::Empty)
            }));
            cells
        })
        .collect();

    SheetTable {
        sheet_name: sheet_name.to_string(),
        columns,
        rows,
        autofilter: true,
    }
}

/// Lays the manifest out as a two-column sheet.
pub fn manifest_sheet(sheet_name: &str, manifest: &Manifest) -> SheetTable {
    let rows = manifest
        .entries
        .iter()
        .map(|entry| {
            vec![
                CellValue::Number(entry.entity_id.0 as f64),
                CellValue::Text(entry.manifest_cell()),
            ]
        })
        .collect();

    SheetTable {
        sheet_name: sheet_name.to_string(),
        columns: vec![
            MANIFEST_ID_HEADER.to_string(),
            MANIFEST_PATH_HEADER.to_string(),
        ],
        rows,
        autofilter: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epias::tools::model::{EntityId, FetchResult, NOT_FOUND_MARKER};

    fn table(name: &str, marker: &str) -> SheetTable {
        SheetTable {
            sheet_name: name.to_string(),
            columns: vec![marker.to_string()],
            rows: Vec::new(),
            autofilter: false,
        }
    }

    #[test]
    fn readings_are_scaled_to_kwh() {
        assert_eq!(coerce_reading(&CellValue::Number(1.5)), 1500.0);
        assert_eq!(coerce_reading(&CellValue::Text(" 0.25 ".into())), 250.0);
        assert_eq!(coerce_reading(&CellValue::Bool(true)), 1000.0);
    }

    #[test]
    fn malformed_readings_degrade_to_zero() {
        assert_eq!(coerce_reading(&CellValue::Text("abc".into())), 0.0);
        assert_eq!(coerce_reading(&CellValue::Text("1,5".into())), 0.0);
        assert_eq!(coerce_reading(&CellValue::Text("inf".into())), 0.0);
        assert_eq!(coerce_reading(&CellValue::Empty), 0.0);
        assert_eq!(coerce_reading(&CellValue::DateTime(45000.0)), 0.0);
    }

    #[test]
    fn blank_label_falls_back_to_file_name() {
        let column = column_from_export(
            Path::new("out/meter_12.xlsx"),
            ExportSheet {
                label: "  ".into(),
                readings: vec![CellValue::Number(2.0)],
            },
        );
        assert_eq!(column.label, "meter_12.xlsx");
        assert_eq!(column.cells, vec![2000.0]);
    }

    #[test]
    fn pivot_sheet_pads_short_columns() {
        let pivot = PivotTable {
            index_header: "Hour".into(),
            columns: vec![
                PivotColumn {
                    label: "A".into(),
                    cells: vec![1.0, 2.0, 3.0],
                },
                PivotColumn {
                    label: "B".into(),
                    cells: vec![10.0],
                },
            ],
        };

        let sheet = pivot_sheet("HourlyPivot", &pivot);

        assert_eq!(sheet.columns, vec!["Hour", "A", "B"]);
        assert_eq!(sheet.rows.len(), 3);
        assert_eq!(
            sheet.rows[0],
            vec![
                CellValue::Number(1.0),
                CellValue::Number(1.0),
                CellValue::Number(10.0)
            ]
        );
        assert_eq!(
            sheet.rows[2],
            vec![
                CellValue::Number(3.0),
                CellValue::Number(3.0),
                CellValue::Empty
            ]
        );
    }

    #[test]
    fn manifest_sheet_marks_failures() {
        let manifest = Manifest::new(vec![
            FetchResult::downloaded(EntityId(1), PathBuf::from("out/meter_1.xlsx")),
            FetchResult::not_found(EntityId(2)),
        ]);

        let sheet = manifest_sheet("ControlFile", &manifest);

        assert_eq!(sheet.columns, vec![MANIFEST_ID_HEADER, MANIFEST_PATH_HEADER]);
        assert_eq!(sheet.rows[1][1], CellValue::Text(NOT_FOUND_MARKER.into()));
    }

    #[test]
    fn upsert_replaces_same_named_sheet_in_place() {
        let mut workbook = WorkbookData {
            tables: vec![table("Meters", "ids"), table("HourlyPivot", "old")],
        };

        workbook.upsert(table("HourlyPivot", "new"));
        workbook.upsert(table("ControlFile", "manifest"));

        let names: Vec<&str> = workbook
            .tables
            .iter()
            .map(|table| table.sheet_name.as_str())
            .collect();
        assert_eq!(names, vec!["Meters", "HourlyPivot", "ControlFile"]);
        assert_eq!(
            workbook.table("HourlyPivot").map(|t| t.columns.clone()),
            Some(vec!["new".to_string()])
        );
    }

    #[test]
    fn unreadable_export_keeps_an_empty_column() {
        let paths = vec![PathBuf::from("/nonexistent/meter_9.xlsx")];
        let pivot = build_pivot(&paths, "Hour");
        assert_eq!(pivot.columns.len(), 1);
        assert_eq!(pivot.columns[0].label, "meter_9.xlsx");
        assert_eq!(pivot.row_count(), 0);
    }
}
