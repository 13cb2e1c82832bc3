use std::fs;
use std::path::{Path, PathBuf};

use rust_xlsxwriter::{Workbook, Worksheet, XlsxError};
use uuid::Uuid;

use crate::epias::tools::error::Result;
use crate::epias::tools::pivot::{CellValue, SheetTable, WorkbookData};

/// Writes the provided workbook data to the given path.
///
/// The workbook is rendered in memory, written to a hidden sibling file and
/// renamed over `path`, so a failure never leaves a truncated workbook behind.
pub fn write_workbook(path: &Path, workbook: &WorkbookData) -> Result<()> {
    let mut workbook_writer = Workbook::new();

    for table in &workbook.tables {
        let worksheet = workbook_writer.add_worksheet();
        worksheet.set_name(&table.sheet_name)?;
        write_table(worksheet, table)?;
    }

    let buffer = workbook_writer.save_to_buffer()?;
    let staging = staging_path(path);
    if let Err(error) = fs::write(&staging, &buffer).and_then(|()| fs::rename(&staging, path)) {
        let _ = fs::remove_file(&staging);
        return Err(error.into());
    }
    Ok(())
}

fn write_table(worksheet: &mut Worksheet, table: &SheetTable) -> std::result::Result<(), XlsxError> {
    for (col_idx, header) in table.columns.iter().enumerate() {
        if !header.is_empty() {
            worksheet.write_string(0, col_idx as u16, header)?;
        }
    }

    for (row_idx, row) in table.rows.iter().enumerate() {
        let row_num = (row_idx + 1) as u32;
        for (col_idx, cell) in row.iter().enumerate() {
            let col_num = col_idx as u16;
            match cell {
                CellValue::Empty => {}
                CellValue::Text(value) => {
                    worksheet.write_string(row_num, col_num, value)?;
                }
                CellValue::Number(value) | CellValue::DateTime(value) => {
                    worksheet.write_number(row_num, col_num, *value)?;
                }
                CellValue::Bool(value) => {
                    worksheet.write_boolean(row_num, col_num, *value)?;
                }
            }
        }
    }

    if table.autofilter && !table.columns.is_empty() {
        let col_end = (table.columns.len() as u16).saturating_sub(1);
        let row_end = table.rows.len() as u32;
        worksheet.autofilter(0, 0, row_end, col_end)?;
    }
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()))
}
