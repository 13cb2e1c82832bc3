use std::path::Path;

use calamine::{DataType, Range, Reader, Xlsx, open_workbook};

use crate::epias::tools::error::{Result, ToolError};
use crate::epias::tools::model::EntityId;
use crate::epias::tools::pivot::{CellValue, SheetTable, WorkbookData};

/// Cell holding the meter label in an export (C2, zero-based).
const EXPORT_LABEL_CELL: (u32, u32) = (1, 2);
/// Column holding the hourly readings in an export (G).
const EXPORT_VALUE_COLUMN: u32 = 6;
/// First reading row in an export (row 2).
const EXPORT_FIRST_ROW: u32 = 1;

/// Raw content of one downloaded hourly export.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSheet {
    /// Contents of the label cell, possibly blank.
    pub label: String,
    /// Reading cells from the first data row to the last used row.
    pub readings: Vec<CellValue>,
}

/// Reads the meter id column from the first sheet of the input workbook.
///
/// `headers` are tried in order; the first one present wins. Blank cells are
/// skipped.
pub fn read_entity_ids(path: &Path, headers: &[String]) -> Result<Vec<EntityId>> {
    if !path.exists() {
        return Err(ToolError::MissingInput(path.to_path_buf()));
    }
    let mut workbook: Xlsx<_> = open_workbook(path)?;
    let range = read_first_sheet(&mut workbook)?;

    let header_row: Vec<String> = match range.rows().next() {
        Some(first_row) => first_row
            .iter()
            .map(|cell| cell_to_string(Some(cell)).trim().to_string())
            .collect(),
        None => Vec::new(),
    };
    let column = headers
        .iter()
        .find_map(|wanted| header_row.iter().position(|header| header == wanted))
        .ok_or_else(|| ToolError::MissingIdColumn {
            expected: headers.to_vec(),
        })?;

    let first_row = range.start().map(|(row, _)| row as usize).unwrap_or(0);
    let mut ids = Vec::new();
    for (offset, row) in range.rows().enumerate().skip(1) {
        match parse_entity_id(row.get(column)) {
            Ok(Some(id)) => ids.push(id),
            Ok(None) => continue,
            Err(value) => {
                return Err(ToolError::InvalidEntityId {
                    row: first_row + offset + 1,
                    value,
                });
            }
        }
    }

    Ok(ids)
}

/// Reads every sheet of a workbook as values, keeping tab order. The first row
/// of each sheet becomes the header.
pub fn read_workbook(path: &Path) -> Result<WorkbookData> {
    let mut workbook: Xlsx<_> = open_workbook(path)?;
    let names: Vec<String> = workbook.sheet_names().to_vec();

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let range = read_required_sheet(&mut workbook, &name)?;
        tables.push(table_from_range(name, &range));
    }
    Ok(WorkbookData { tables })
}

/// Reads the label cell and reading column of a downloaded export.
pub fn read_export(path: &Path) -> Result<ExportSheet> {
    let mut workbook: Xlsx<_> = open_workbook(path)?;
    let range = read_first_sheet(&mut workbook)?;

    let label = cell_to_string(range.get_value(EXPORT_LABEL_CELL));
    let readings = match range.end() {
        Some((last_row, _)) if last_row >= EXPORT_FIRST_ROW => (EXPORT_FIRST_ROW..=last_row)
            .map(|row| to_cell_value(range.get_value((row, EXPORT_VALUE_COLUMN))))
            .collect(),
        _ => Vec::new(),
    };

    Ok(ExportSheet { label, readings })
}

fn read_first_sheet<R: std::io::Read + std::io::Seek>(
    workbook: &mut Xlsx<R>,
) -> Result<Range<DataType>> {
    let range_result = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ToolError::InvalidWorkbook("workbook has no sheets".into()))?;
    let range = range_result.map_err(ToolError::from)?;
    Ok(range)
}

fn read_required_sheet<R: std::io::Read + std::io::Seek>(
    workbook: &mut Xlsx<R>,
    name: &str,
) -> Result<Range<DataType>> {
    let range_result = workbook
        .worksheet_range(name)
        .ok_or_else(|| ToolError::InvalidWorkbook(format!("missing sheet '{name}'")))?;
    let range = range_result.map_err(ToolError::from)?;
    Ok(range)
}

/// Lays a sheet out on an absolute grid from A1, so cell positions survive a
/// rewrite even when the used range starts further in.
fn table_from_range(sheet_name: String, range: &Range<DataType>) -> SheetTable {
    let Some((last_row, last_col)) = range.end() else {
        return SheetTable {
            sheet_name,
            columns: Vec::new(),
            rows: Vec::new(),
            autofilter: false,
        };
    };

    let columns = (0..=last_col)
        .map(|col| cell_to_string(range.get_value((0, col))))
        .collect();
    let rows = (1..=last_row)
        .map(|row| {
            (0..=last_col)
                .map(|col| to_cell_value(range.get_value((row, col))))
                .collect()
        })
        .collect();

    SheetTable {
        sheet_name,
        columns,
        rows,
        autofilter: false,
    }
}

fn parse_entity_id(cell: Option<&DataType>) -> std::result::Result<Option<EntityId>, String> {
    match cell {
        Some(DataType::Empty) | None => Ok(None),
        Some(DataType::Int(value)) => Ok(Some(EntityId(*value))),
        Some(DataType::Float(value)) if value.is_finite() && value.fract() == 0.0 => {
            Ok(Some(EntityId(*value as i64)))
        }
        Some(DataType::String(value)) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<i64>()
                .map(|id| Some(EntityId(id)))
                .map_err(|_| value.clone())
        }
        Some(other) => Err(other.to_string()),
    }
}

fn to_cell_value(cell: Option<&DataType>) -> CellValue {
    match cell {
        Some(DataType::String(value)) => CellValue::Text(value.clone()),
        Some(DataType::Float(value)) => CellValue::Number(*value),
        Some(DataType::Int(value)) => CellValue::Number(*value as f64),
        Some(DataType::Bool(value)) => CellValue::Bool(*value),
        Some(DataType::DateTime(value)) => CellValue::DateTime(*value),
        Some(DataType::Empty) | None => CellValue::Empty,
        Some(other) => CellValue::Text(other.to_string()),
    }
}

fn cell_to_string(cell: Option<&DataType>) -> String {
    match cell {
        Some(DataType::String(value)) => value.clone(),
        Some(DataType::Float(value)) => value.to_string(),
        Some(DataType::Int(value)) => value.to_string(),
        Some(DataType::Bool(value)) => value.to_string(),
        Some(DataType::Empty) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
