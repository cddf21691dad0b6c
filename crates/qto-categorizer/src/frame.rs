//! Column-oriented in-memory table used by every reader, writer, model and job.
//!
//! A `Frame` holds ordered, named columns of equal length. Each column carries
//! a declared `DType` and nullable `Value` cells. The type is deliberately
//! small: the jobs only need selection, row filtering, imputation and
//! concatenation, so there is no expression engine.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Logical data type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum DType {
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "int64")]
    Int,
    #[serde(rename = "float64")]
    Float,
    #[serde(rename = "string")]
    Str,
    #[serde(rename = "datetime")]
    DateTime,
}

impl DType {
    pub fn name(&self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int => "int64",
            DType::Float => "float64",
            DType::Str => "string",
            DType::DateTime => "datetime",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "bool" | "boolean" => Ok(DType::Bool),
            "int" | "int64" | "integer" | "long" => Ok(DType::Int),
            "float" | "float64" | "double" => Ok(DType::Float),
            "str" | "string" | "object" | "category" => Ok(DType::Str),
            "datetime" | "datetime64[ns]" | "timestamp" | "date" => Ok(DType::DateTime),
            other => Err(Error::config(format!("Unknown dtype: {}", other))),
        }
    }
}

/// A single nullable cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    DateTime(NaiveDateTime),
}

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

/// Parse the timestamp layouts found in exported transaction files.
pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

pub fn format_datetime(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Coerce the cell to `dtype`, returning `None` when it cannot be represented.
    pub fn cast(&self, dtype: DType) -> Option<Value> {
        let out = match (self, dtype) {
            (Value::Null, _) => Value::Null,
            (Value::Bool(b), DType::Bool) => Value::Bool(*b),
            (Value::Bool(b), DType::Int) => Value::Int(*b as i64),
            (Value::Bool(b), DType::Float) => Value::Float(if *b { 1.0 } else { 0.0 }),
            (Value::Int(v), DType::Int) => Value::Int(*v),
            (Value::Int(v), DType::Float) => Value::Float(*v as f64),
            (Value::Int(v), DType::Bool) if *v == 0 || *v == 1 => Value::Bool(*v == 1),
            (Value::Float(v), _) if v.is_nan() => Value::Null,
            (Value::Float(v), DType::Float) => Value::Float(*v),
            (Value::Float(v), DType::Int) if v.fract() == 0.0 && v.is_finite() => Value::Int(*v as i64),
            (Value::Str(s), DType::Str) => Value::Str(s.clone()),
            (Value::Str(s), DType::Int) => Value::Int(s.trim().parse().ok()?),
            (Value::Str(s), DType::Float) => Value::Float(s.trim().parse().ok()?),
            (Value::Str(s), DType::Bool) => match s.trim().to_lowercase().as_str() {
                "true" | "1" => Value::Bool(true),
                "false" | "0" => Value::Bool(false),
                _ => return None,
            },
            (Value::Str(s), DType::DateTime) => Value::DateTime(parse_datetime(s)?),
            (Value::DateTime(dt), DType::DateTime) => Value::DateTime(*dt),
            (other, DType::Str) => Value::Str(other.to_string()),
            _ => return None,
        };
        Some(out)
    }

    /// Stable textual key used for hashing rows.
    fn key(&self) -> String {
        match self {
            Value::Null => "\u{0}null".to_string(),
            Value::Bool(b) => format!("b{}", b),
            Value::Int(v) => format!("i{}", v),
            Value::Float(v) => format!("f{}", v.to_bits()),
            Value::Str(s) => format!("s{}", s),
            Value::DateTime(dt) => format!("d{}", dt),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(v) => serde_json::Value::from(*v),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::DateTime(dt) => serde_json::Value::String(format_datetime(dt)),
        }
    }

    pub fn from_json(raw: &serde_json::Value, dtype: DType) -> Result<Value> {
        let value = match raw {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(v) => Value::Int(v),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            other => {
                return Err(Error::value(format!("Unsupported JSON cell: {}", other)));
            }
        };
        value.cast(dtype).ok_or_else(|| {
            Error::value(format!("Cannot convert JSON cell {} to {}", raw, dtype))
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) => f.write_str(s),
            Value::DateTime(dt) => f.write_str(&format_datetime(dt)),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub dtype: DType,
    pub values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, dtype: DType, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            dtype,
            values,
        }
    }

    /// Build a string column; `None` cells become nulls.
    pub fn strings<S: AsRef<str>>(name: impl Into<String>, values: &[Option<S>]) -> Self {
        let values = values
            .iter()
            .map(|v| match v {
                Some(s) => Value::Str(s.as_ref().to_string()),
                None => Value::Null,
            })
            .collect();
        Self::new(name, DType::Str, values)
    }

    pub fn floats(name: impl Into<String>, values: &[f64]) -> Self {
        Self::new(name, DType::Float, values.iter().map(|v| Value::Float(*v)).collect())
    }

    pub fn ints(name: impl Into<String>, values: &[i64]) -> Self {
        Self::new(name, DType::Int, values.iter().map(|v| Value::Int(*v)).collect())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn null_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_null()).count()
    }

    /// Optional string views of the cells, nulls as `None`.
    pub fn str_values(&self) -> Vec<Option<String>> {
        self.values
            .iter()
            .map(|v| match v {
                Value::Null => None,
                Value::Str(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
            .collect()
    }

    /// Non-null labels of a target column. Nulls are rejected.
    pub fn labels(&self) -> Result<Vec<String>> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| match v {
                Value::Null => Err(Error::value(format!(
                    "Column '{}' has a missing label at row {}",
                    self.name, i
                ))),
                other => Ok(other.to_string()),
            })
            .collect()
    }

    /// Cast every cell to `dtype`; returns the indices that could not be cast.
    pub fn cast(&self, dtype: DType) -> std::result::Result<Column, Vec<usize>> {
        let mut failed = Vec::new();
        let values = self
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.cast(dtype).unwrap_or_else(|| {
                    failed.push(i);
                    Value::Null
                })
            })
            .collect();
        if failed.is_empty() {
            Ok(Column::new(self.name.clone(), dtype, values))
        } else {
            Err(failed)
        }
    }

    fn take(&self, indices: &[usize]) -> Column {
        Column::new(
            self.name.clone(),
            self.dtype,
            indices.iter().map(|&i| self.values[i].clone()).collect(),
        )
    }
}

/// An ordered collection of equal-length columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    columns: Vec<Column>,
}

impl Frame {
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        if let Some(first) = columns.first() {
            if let Some(bad) = columns.iter().find(|c| c.len() != first.len()) {
                return Err(Error::value(format!(
                    "Column '{}' has {} rows, expected {}",
                    bad.name,
                    bad.len(),
                    first.len()
                )));
            }
        }
        let mut seen = HashSet::new();
        for c in &columns {
            if !seen.insert(c.name.as_str()) {
                return Err(Error::value(format!("Duplicate column '{}'", c.name)));
            }
        }
        Ok(Self { columns })
    }

    pub fn nrows(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nrows() == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Like `column`, but a missing column is an error.
    pub fn get(&self, name: &str) -> Result<&Column> {
        self.column(name)
            .ok_or_else(|| Error::value(format!("Column '{}' not found in dataset", name)))
    }

    pub fn push_column(&mut self, column: Column) -> Result<()> {
        if !self.columns.is_empty() && column.len() != self.nrows() {
            return Err(Error::value(format!(
                "Column '{}' has {} rows, expected {}",
                column.name,
                column.len(),
                self.nrows()
            )));
        }
        if self.column(&column.name).is_some() {
            return Err(Error::value(format!("Duplicate column '{}'", column.name)));
        }
        self.columns.push(column);
        Ok(())
    }

    /// Replace a column in place, keeping its position.
    pub fn replace_column(&mut self, column: Column) -> Result<()> {
        let nrows = self.nrows();
        let slot = self
            .columns
            .iter_mut()
            .find(|c| c.name == column.name)
            .ok_or_else(|| Error::value(format!("Column '{}' not found in dataset", column.name)))?;
        if column.len() != nrows {
            return Err(Error::value(format!(
                "Column '{}' has {} rows, expected {}",
                column.name,
                column.len(),
                nrows
            )));
        }
        *slot = column;
        Ok(())
    }

    /// Remove and return a column.
    pub fn pop(&mut self, name: &str) -> Result<Column> {
        let pos = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::value(format!("Column '{}' not found in dataset", name)))?;
        Ok(self.columns.remove(pos))
    }

    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Frame> {
        let columns = names
            .iter()
            .map(|n| self.get(n.as_ref()).cloned())
            .collect::<Result<Vec<_>>>()?;
        Frame::new(columns)
    }

    /// Rows at `indices`, in that order.
    pub fn take(&self, indices: &[usize]) -> Frame {
        Frame {
            columns: self.columns.iter().map(|c| c.take(indices)).collect(),
        }
    }

    pub fn head(&self, n: usize) -> Frame {
        let indices: Vec<usize> = (0..self.nrows().min(n)).collect();
        self.take(&indices)
    }

    /// Keep the first occurrence of every distinct row.
    pub fn drop_duplicates(&self) -> Frame {
        let mut seen = HashSet::new();
        let keep: Vec<usize> = (0..self.nrows())
            .filter(|&row| {
                let key: Vec<String> = self.columns.iter().map(|c| c.values[row].key()).collect();
                seen.insert(key)
            })
            .collect();
        self.take(&keep)
    }

    /// Drop every row that holds at least one null.
    pub fn drop_nulls(&self) -> Frame {
        let keep: Vec<usize> = (0..self.nrows())
            .filter(|&row| self.columns.iter().all(|c| !c.values[row].is_null()))
            .collect();
        self.take(&keep)
    }

    pub fn has_nulls(&self) -> bool {
        self.columns.iter().any(|c| c.null_count() > 0)
    }

    /// Replace nulls of `name` with `fill`.
    pub fn fill_null(&mut self, name: &str, fill: Value) -> Result<()> {
        let column = self
            .columns
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::value(format!("Column '{}' not found in dataset", name)))?;
        for v in column.values.iter_mut().filter(|v| v.is_null()) {
            *v = fill.clone();
        }
        Ok(())
    }

    /// Stack frames that share the same column names, in order.
    pub fn concat(frames: Vec<Frame>) -> Result<Frame> {
        let mut iter = frames.into_iter();
        let mut out = match iter.next() {
            Some(f) => f,
            None => return Ok(Frame::default()),
        };
        for frame in iter {
            if frame.column_names() != out.column_names() {
                return Err(Error::value(format!(
                    "Cannot concat frames with columns {:?} and {:?}",
                    out.column_names(),
                    frame.column_names()
                )));
            }
            for (dst, src) in out.columns.iter_mut().zip(frame.columns) {
                if dst.dtype != src.dtype {
                    let widened = widen(dst.dtype, src.dtype).ok_or_else(|| {
                        Error::value(format!(
                            "Column '{}' mixes {} and {}",
                            dst.name, dst.dtype, src.dtype
                        ))
                    })?;
                    *dst = dst.cast(widened).map_err(|_| {
                        Error::value(format!("Cannot widen column '{}' to {}", dst.name, widened))
                    })?;
                    let src = src.cast(widened).map_err(|_| {
                        Error::value(format!("Cannot widen column '{}' to {}", dst.name, widened))
                    })?;
                    dst.values.extend(src.values);
                } else {
                    dst.values.extend(src.values);
                }
            }
        }
        Ok(out)
    }

    /// Rows as JSON objects, `limit` rows at most.
    pub fn to_records(&self, limit: Option<usize>) -> serde_json::Value {
        let n = limit.map(|l| l.min(self.nrows())).unwrap_or(self.nrows());
        let rows = (0..n)
            .map(|row| {
                let record = self
                    .columns
                    .iter()
                    .map(|c| (c.name.clone(), c.values[row].to_json()))
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(record)
            })
            .collect();
        serde_json::Value::Array(rows)
    }

    /// `{"columns": [...], "dtypes": [...], "data": [[...], ...]}` layout.
    pub fn to_split_json(&self) -> serde_json::Value {
        let data: Vec<serde_json::Value> = (0..self.nrows())
            .map(|row| {
                serde_json::Value::Array(self.columns.iter().map(|c| c.values[row].to_json()).collect())
            })
            .collect();
        serde_json::json!({
            "columns": self.column_names(),
            "dtypes": self.columns.iter().map(|c| c.dtype.name()).collect::<Vec<_>>(),
            "data": data,
        })
    }

    pub fn from_split_json(raw: &serde_json::Value) -> Result<Frame> {
        let bad = || Error::value("Expected a split-oriented JSON table");
        let names = raw.get("columns").and_then(|v| v.as_array()).ok_or_else(bad)?;
        let dtypes = raw.get("dtypes").and_then(|v| v.as_array()).ok_or_else(bad)?;
        let data = raw.get("data").and_then(|v| v.as_array()).ok_or_else(bad)?;
        let mut columns = names
            .iter()
            .zip(dtypes)
            .map(|(n, d)| {
                let name = n.as_str().ok_or_else(bad)?;
                let dtype = d.as_str().ok_or_else(bad)?.parse::<DType>()?;
                Ok(Column::new(name, dtype, Vec::with_capacity(data.len())))
            })
            .collect::<Result<Vec<_>>>()?;
        for row in data {
            let cells = row.as_array().ok_or_else(bad)?;
            if cells.len() != columns.len() {
                return Err(Error::value("Row width does not match the column count"));
            }
            for (column, cell) in columns.iter_mut().zip(cells) {
                column.values.push(Value::from_json(cell, column.dtype)?);
            }
        }
        Frame::new(columns)
    }
}

fn widen(a: DType, b: DType) -> Option<DType> {
    match (a, b) {
        (DType::Int, DType::Float) | (DType::Float, DType::Int) => Some(DType::Float),
        (_, DType::Str) | (DType::Str, _) => Some(DType::Str),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        Frame::new(vec![
            Column::strings("MERCHANT_NAME", &[Some("A"), Some("A"), None, Some("B")]),
            Column::floats("AMOUNT", &[1.0, 1.0, 2.5, 3.0]),
        ])
        .unwrap()
    }

    #[test]
    fn rejects_ragged_columns() {
        let err = Frame::new(vec![
            Column::floats("a", &[1.0, 2.0]),
            Column::floats("b", &[1.0]),
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn drop_duplicates_keeps_first_occurrence() {
        let frame = sample().drop_duplicates();
        assert_eq!(frame.nrows(), 3);
        assert_eq!(frame.get("AMOUNT").unwrap().values[1], Value::Float(2.5));
    }

    #[test]
    fn drop_nulls_and_fill_null() {
        let mut frame = sample();
        assert_eq!(frame.drop_nulls().nrows(), 3);
        frame.fill_null("MERCHANT_NAME", Value::from("No merchant")).unwrap();
        assert!(!frame.has_nulls());
        assert_eq!(frame.get("MERCHANT_NAME").unwrap().values[2], Value::from("No merchant"));
    }

    #[test]
    fn pop_removes_column() {
        let mut frame = sample();
        let popped = frame.pop("AMOUNT").unwrap();
        assert_eq!(popped.len(), 4);
        assert_eq!(frame.column_names(), vec!["MERCHANT_NAME"]);
        assert!(frame.pop("AMOUNT").is_err());
    }

    #[test]
    fn concat_widens_int_to_float() {
        let a = Frame::new(vec![Column::ints("x", &[1, 2])]).unwrap();
        let b = Frame::new(vec![Column::floats("x", &[0.5])]).unwrap();
        let out = Frame::concat(vec![a, b]).unwrap();
        assert_eq!(out.get("x").unwrap().dtype, DType::Float);
        assert_eq!(out.nrows(), 3);
    }

    #[test]
    fn split_json_restores_the_frame() {
        let frame = sample();
        let restored = Frame::from_split_json(&frame.to_split_json()).unwrap();
        assert_eq!(restored, frame);
    }

    #[test]
    fn parses_common_timestamp_layouts() {
        assert!(parse_datetime("2024-01-02 10:11:12").is_some());
        assert!(parse_datetime("2024-01-02T10:11:12.123").is_some());
        assert!(parse_datetime("2024-01-02").is_some());
        assert!(parse_datetime("yesterday").is_none());
    }
}
