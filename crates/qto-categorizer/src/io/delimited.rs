//! Delimited text tables with per-column type inference.

use std::collections::BTreeMap;

use bytes::Bytes;
use csv::{ReaderBuilder, WriterBuilder};

use crate::error::{Error, Result};
use crate::frame::{parse_datetime, Column, DType, Frame, Value};
use crate::io::storage::{self, Location};

fn separator(sep: &str) -> Result<u8> {
    match sep.as_bytes() {
        [b] => Ok(*b),
        _ if sep == "\\t" => Ok(b'\t'),
        _ => Err(Error::config(format!("CSV separator must be a single byte, got {:?}", sep))),
    }
}

/// Narrowest dtype that holds every non-empty cell.
fn infer_dtype(cells: &[Option<&str>]) -> DType {
    let present: Vec<&str> = cells.iter().flatten().copied().collect();
    if present.is_empty() {
        return DType::Str;
    }
    if present.iter().all(|c| c.parse::<i64>().is_ok()) {
        DType::Int
    } else if present.iter().all(|c| c.parse::<f64>().is_ok()) {
        DType::Float
    } else if present
        .iter()
        .all(|c| matches!(c.to_lowercase().as_str(), "true" | "false"))
    {
        DType::Bool
    } else {
        DType::Str
    }
}

fn parse_column(name: &str, cells: &[Option<&str>], dtype: DType) -> Result<Column> {
    let values = cells
        .iter()
        .enumerate()
        .map(|(row, cell)| match cell {
            None => Ok(Value::Null),
            Some(raw) => {
                let parsed = match dtype {
                    DType::DateTime => parse_datetime(raw).map(Value::DateTime),
                    _ => Value::Str(raw.to_string()).cast(dtype),
                };
                parsed.ok_or_else(|| {
                    Error::value(format!(
                        "Cannot parse {:?} as {} in column '{}' at row {}",
                        raw, dtype, name, row
                    ))
                })
            }
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Column::new(name, dtype, values))
}

/// Read a table with a header row; empty cells are nulls.
///
/// `dtypes` pins the dtype of named columns and `parse_dates` parses the
/// listed columns as timestamps; every other column is inferred.
pub fn read_csv(
    location: &Location,
    sep: &str,
    dtypes: &BTreeMap<String, DType>,
    parse_dates: &[String],
) -> Result<Frame> {
    let bytes = storage::read_bytes(location)?;
    let mut reader = ReaderBuilder::new()
        .delimiter(separator(sep)?)
        .has_headers(true)
        .from_reader(bytes.as_ref());

    let headers: Vec<String> = reader.headers()?.iter().map(String::from).collect();
    let records = reader.records().collect::<std::result::Result<Vec<_>, _>>()?;

    for name in dtypes.keys().chain(parse_dates.iter()) {
        if !headers.contains(name) {
            return Err(Error::value(format!(
                "Column '{}' is not in {} (columns: {:?})",
                name, location, headers
            )));
        }
    }

    let columns = headers
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let cells: Vec<Option<&str>> = records
                .iter()
                .map(|r| r.get(i).filter(|c| !c.is_empty()))
                .collect();
            let dtype = if parse_dates.contains(name) {
                DType::DateTime
            } else if let Some(dtype) = dtypes.get(name) {
                *dtype
            } else {
                infer_dtype(&cells)
            };
            parse_column(name, &cells, dtype)
        })
        .collect::<Result<Vec<_>>>()?;
    log::debug!(
        "[CSVReader] read {} rows x {} columns from {}",
        records.len(),
        columns.len(),
        location
    );
    Frame::new(columns)
}

/// Text for one cell; whole floats keep a decimal so they read back as floats.
fn cell_text(value: &Value) -> String {
    match value {
        Value::Float(v) if v.is_finite() && v.fract() == 0.0 => format!("{:.1}", v),
        other => other.to_string(),
    }
}

pub fn write_csv(frame: &Frame, location: &Location, sep: &str, header: bool, index: bool) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .delimiter(separator(sep)?)
        .from_writer(Vec::new());
    if header {
        let mut names: Vec<&str> = Vec::with_capacity(frame.ncols() + 1);
        if index {
            names.push("");
        }
        names.extend(frame.column_names());
        writer.write_record(&names)?;
    }
    for row in 0..frame.nrows() {
        let mut record: Vec<String> = Vec::with_capacity(frame.ncols() + 1);
        if index {
            record.push(row.to_string());
        }
        record.extend(frame.columns().iter().map(|c| cell_text(&c.values[row])));
        writer.write_record(&record)?;
    }
    let data = writer
        .into_inner()
        .map_err(|e| Error::value(format!("Failed to flush CSV buffer: {}", e)))?;
    storage::write_bytes(location, Bytes::from(data))?;
    log::debug!("[CSVWriter] wrote {} rows to {}", frame.nrows(), location);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_dtypes_and_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let path = Location::Local(dir.path().join("t.csv"));
        storage::write_bytes(
            &path,
            Bytes::from_static(b"a,b,c,d\n1,1.5,x,true\n2,,y,false\n,3,,true\n"),
        )
        .unwrap();
        let frame = read_csv(&path, ",", &BTreeMap::new(), &[]).unwrap();
        let dtypes: Vec<DType> = frame.columns().iter().map(|c| c.dtype).collect();
        assert_eq!(dtypes, vec![DType::Int, DType::Float, DType::Str, DType::Bool]);
        assert_eq!(frame.get("a").unwrap().values[2], Value::Null);
        assert_eq!(frame.get("c").unwrap().null_count(), 1);
    }

    #[test]
    fn dtypes_and_dates_override_inference() {
        let dir = tempfile::tempdir().unwrap();
        let path = Location::Local(dir.path().join("t.csv"));
        storage::write_bytes(&path, Bytes::from_static(b"id;when\n007;2024-01-02 03:04:05\n")).unwrap();
        let mut dtypes = BTreeMap::new();
        dtypes.insert("id".to_string(), DType::Str);
        let frame = read_csv(&path, ";", &dtypes, &["when".to_string()]).unwrap();
        assert_eq!(frame.get("id").unwrap().values[0], Value::Str("007".into()));
        assert_eq!(frame.get("when").unwrap().dtype, DType::DateTime);
    }

    #[test]
    fn writes_index_and_keeps_float_columns_float() {
        let dir = tempfile::tempdir().unwrap();
        let path = Location::Local(dir.path().join("out.csv"));
        let frame = Frame::new(vec![Column::floats("x", &[1.0, 2.5])]).unwrap();
        write_csv(&frame, &path, ",", true, true).unwrap();
        assert_eq!(storage::read_to_string(&path).unwrap(), ",x\n0,1.0\n1,2.5\n");

        write_csv(&frame, &path, ",", true, false).unwrap();
        let back = read_csv(&path, ",", &BTreeMap::new(), &[]).unwrap();
        assert_eq!(back, frame);
    }
}
