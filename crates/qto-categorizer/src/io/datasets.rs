//! Dataset readers and writers selected by their `KIND` tag.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::frame::{DType, Frame};
use crate::io::catalog::{self, TableRef, WriteMode};
use crate::io::columnar::{self, Compression};
use crate::io::deltalake::{self, DeltaMode};
use crate::io::delimited;
use crate::io::storage::Location;

pub trait Reader {
    fn read(&self) -> Result<Frame>;
}

pub trait Writer {
    fn write(&self, data: &Frame) -> Result<()>;
}

fn default_catalog_id() -> String {
    "123456789".to_string()
}

fn default_warehouse() -> String {
    "warehouse".to_string()
}

fn default_sep() -> String {
    ",".to_string()
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Readers

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ParquetReader {
    /// Local or `s3://` file, or a directory/prefix of part files.
    pub path: String,
}

impl Reader for ParquetReader {
    fn read(&self) -> Result<Frame> {
        columnar::read_dataset(&Location::parse(&self.path)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GlueReader {
    pub table: String,
    pub database: String,
    #[serde(default = "default_catalog_id")]
    pub catalog_id: String,
    #[serde(default = "default_warehouse")]
    pub warehouse: String,
    #[serde(default)]
    pub path: Option<String>,
}

impl Reader for GlueReader {
    fn read(&self) -> Result<Frame> {
        let table = TableRef {
            warehouse: &self.warehouse,
            catalog_id: &self.catalog_id,
            database: &self.database,
            table: &self.table,
        };
        catalog::read_table(&table, self.path.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeltalakeReader {
    pub path: String,
}

impl Reader for DeltalakeReader {
    fn read(&self) -> Result<Frame> {
        deltalake::read_table(&Location::parse(&self.path)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CSVReader {
    pub path: String,
    #[serde(default = "default_sep")]
    pub sep: String,
    /// Column name to dtype name (`string`, `int64`, `float64`, `bool`, ...).
    #[serde(default)]
    pub dtypes: BTreeMap<String, String>,
    #[serde(default)]
    pub parse_dates: Vec<String>,
}

impl Reader for CSVReader {
    fn read(&self) -> Result<Frame> {
        let dtypes = self
            .dtypes
            .iter()
            .map(|(name, dtype)| Ok((name.clone(), dtype.parse::<DType>()?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        delimited::read_csv(&Location::parse(&self.path)?, &self.sep, &dtypes, &self.parse_dates)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "KIND")]
pub enum ReaderKind {
    ParquetReader(ParquetReader),
    GlueReader(GlueReader),
    DeltalakeReader(DeltalakeReader),
    CSVReader(CSVReader),
}

impl Reader for ReaderKind {
    fn read(&self) -> Result<Frame> {
        let frame = match self {
            ReaderKind::ParquetReader(r) => r.read(),
            ReaderKind::GlueReader(r) => r.read(),
            ReaderKind::DeltalakeReader(r) => r.read(),
            ReaderKind::CSVReader(r) => r.read(),
        }?;
        log::debug!("[Reader] loaded {} rows x {} columns", frame.nrows(), frame.ncols());
        Ok(frame)
    }
}

// ---------------------------------------------------------------------------
// Writers

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ParquetWriter {
    pub path: String,
    #[serde(default)]
    pub compression: Compression,
}

impl Writer for ParquetWriter {
    fn write(&self, data: &Frame) -> Result<()> {
        columnar::write_file(data, &Location::parse(&self.path)?, self.compression)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GlueWriter {
    pub table: String,
    pub database: String,
    #[serde(default = "default_catalog_id")]
    pub catalog_id: String,
    #[serde(default = "default_warehouse")]
    pub warehouse: String,
    #[serde(default)]
    pub mode: WriteMode,
    /// Data location used when the table is created.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub partition_cols: Vec<String>,
}

impl Writer for GlueWriter {
    fn write(&self, data: &Frame) -> Result<()> {
        let table = TableRef {
            warehouse: &self.warehouse,
            catalog_id: &self.catalog_id,
            database: &self.database,
            table: &self.table,
        };
        catalog::write_table(&table, self.path.as_deref(), data, self.mode, &self.partition_cols)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeltalakeWriter {
    pub path: String,
    #[serde(default)]
    pub mode: DeltaMode,
}

impl Writer for DeltalakeWriter {
    fn write(&self, data: &Frame) -> Result<()> {
        deltalake::write_table(&Location::parse(&self.path)?, data, self.mode)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CSVWriter {
    pub path: String,
    #[serde(default = "default_sep")]
    pub sep: String,
    #[serde(default = "default_true")]
    pub header: bool,
    #[serde(default)]
    pub index: bool,
}

impl Writer for CSVWriter {
    fn write(&self, data: &Frame) -> Result<()> {
        delimited::write_csv(data, &Location::parse(&self.path)?, &self.sep, self.header, self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "KIND")]
pub enum WriterKind {
    ParquetWriter(ParquetWriter),
    GlueWriter(GlueWriter),
    DeltalakeWriter(DeltalakeWriter),
    CSVWriter(CSVWriter),
}

impl Writer for WriterKind {
    fn write(&self, data: &Frame) -> Result<()> {
        match self {
            WriterKind::ParquetWriter(w) => w.write(data),
            WriterKind::GlueWriter(w) => w.write(data),
            WriterKind::DeltalakeWriter(w) => w.write(data),
            WriterKind::CSVWriter(w) => w.write(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_selected_by_tag() {
        let reader: ReaderKind =
            serde_yaml::from_str("KIND: CSVReader\npath: data/inputs.csv\nparse_dates: [DATE_EMITTED]\n").unwrap();
        match reader {
            ReaderKind::CSVReader(r) => {
                assert_eq!(r.sep, ",");
                assert_eq!(r.parse_dates, vec!["DATE_EMITTED".to_string()]);
            }
            other => panic!("unexpected reader {:?}", other),
        }
        let writer: WriterKind = serde_yaml::from_str("KIND: GlueWriter\ntable: t\ndatabase: d\n").unwrap();
        match writer {
            WriterKind::GlueWriter(w) => {
                assert_eq!(w.catalog_id, "123456789");
                assert_eq!(w.mode, WriteMode::Overwrite);
            }
            other => panic!("unexpected writer {:?}", other),
        }
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let out: std::result::Result<ReaderKind, _> = serde_yaml::from_str("KIND: ParquetReader\npath: x\nengine: y\n");
        assert!(out.is_err());
    }

    #[test]
    fn csv_writer_output_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv").to_string_lossy().into_owned();
        let frame = Frame::new(vec![crate::frame::Column::strings("predicted_class", &[Some("FOOD")])]).unwrap();
        CSVWriter {
            path: path.clone(),
            sep: ",".into(),
            header: true,
            index: false,
        }
        .write(&frame)
        .unwrap();
        let back = CSVReader {
            path,
            sep: ",".into(),
            dtypes: BTreeMap::new(),
            parse_dates: Vec::new(),
        }
        .read()
        .unwrap();
        assert_eq!(back, frame);
    }
}
