//! Catalog tables: parquet part files under a warehouse location, with an
//! optional Hive partition layout.
//!
//! A table `database.table` of catalog `catalog_id` lives at
//! `{warehouse}/{catalog_id}/{database}.db/{table}` unless created with an
//! explicit path; the entry file in the default location then records where
//! the data went.

use std::collections::BTreeMap;

use bytes::Bytes;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::{Frame, Value};
use crate::io::columnar::{self, Compression};
use crate::io::storage::{self, Location};

const ENTRY_FILE: &str = "_catalog_table.json";
const NULL_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Append,
    #[default]
    Overwrite,
    OverwritePartitions,
}

/// What the catalog knows about a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableEntry {
    pub database: String,
    pub table: String,
    pub location: String,
    #[serde(default)]
    pub partition_cols: Vec<String>,
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
}

/// Address of a table in a catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRef<'a> {
    pub warehouse: &'a str,
    pub catalog_id: &'a str,
    pub database: &'a str,
    pub table: &'a str,
}

impl TableRef<'_> {
    pub fn default_location(&self) -> Result<Location> {
        Ok(Location::parse(self.warehouse)?
            .join(self.catalog_id)
            .join(&format!("{}.db", self.database))
            .join(self.table))
    }

    fn entry_location(&self) -> Result<Location> {
        Ok(self.default_location()?.join(ENTRY_FILE))
    }

    pub fn entry(&self) -> Result<Option<TableEntry>> {
        let location = self.entry_location()?;
        if !storage::exists(&location)? {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&storage::read_to_string(&location)?)?))
    }

    /// Data location: explicit `path`, then the catalog entry, then the default.
    pub fn resolve(&self, path: Option<&str>) -> Result<Location> {
        if let Some(path) = path {
            return Location::parse(path);
        }
        match self.entry()? {
            Some(entry) => Location::parse(&entry.location),
            None => self.default_location(),
        }
    }
}

pub fn read_table(table: &TableRef, path: Option<&str>) -> Result<Frame> {
    let location = table.resolve(path)?;
    log::info!("[GlueReader] reading {}.{} from {}", table.database, table.table, location);
    columnar::read_dataset(&location)
}

fn partition_dir(column: &str, value: &Value) -> String {
    let text = match value {
        Value::Null => NULL_PARTITION.to_string(),
        other => other.to_string(),
    };
    format!("{}={}", column, text.replace('/', "%2F"))
}

/// Data files directly or transitively under `location`, metadata excluded.
fn data_files(location: &Location) -> Result<Vec<Location>> {
    Ok(storage::list_files(location)?
        .into_iter()
        .filter(|f| {
            f.relative_to(location)
                .map(|r| columnar::is_data_file(&r))
                .unwrap_or(false)
        })
        .collect())
}

pub fn write_table(
    table: &TableRef,
    path: Option<&str>,
    data: &Frame,
    mode: WriteMode,
    partition_cols: &[String],
) -> Result<()> {
    if mode == WriteMode::OverwritePartitions && partition_cols.is_empty() {
        return Err(Error::config("Mode overwrite_partitions requires partition_cols"));
    }
    let location = table.resolve(path)?;
    if let Some(entry) = table.entry()? {
        if entry.partition_cols != partition_cols && mode != WriteMode::Overwrite {
            return Err(Error::value(format!(
                "Table {}.{} is partitioned by {:?}, got {:?}",
                table.database, table.table, entry.partition_cols, partition_cols
            )));
        }
    }

    // Group rows by their partition values.
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    let keys = partition_cols
        .iter()
        .map(|c| data.get(c))
        .collect::<Result<Vec<_>>>()?;
    for row in 0..data.nrows() {
        let dir = keys
            .iter()
            .map(|c| partition_dir(&c.name, &c.values[row]))
            .collect::<Vec<_>>()
            .join("/");
        groups.entry(dir).or_default().push(row);
    }
    if groups.is_empty() && partition_cols.is_empty() {
        groups.insert(String::new(), Vec::new());
    }

    let mut payload = data.clone();
    for c in partition_cols {
        payload.pop(c)?;
    }

    match mode {
        WriteMode::Overwrite => {
            for file in data_files(&location)? {
                storage::delete(&file)?;
            }
        }
        WriteMode::OverwritePartitions => {
            for dir in groups.keys() {
                for file in data_files(&location.join(dir))? {
                    storage::delete(&file)?;
                }
            }
        }
        WriteMode::Append => {}
    }

    for (dir, rows) in &groups {
        let part = format!("part-{}.snappy.parquet", uuid::Uuid::new_v4().simple());
        let target = if dir.is_empty() {
            location.join(&part)
        } else {
            location.join(dir).join(&part)
        };
        columnar::write_file(&payload.take(rows), &target, Compression::Snappy)?;
    }

    let entry = TableEntry {
        database: table.database.to_string(),
        table: table.table.to_string(),
        location: location.to_string(),
        partition_cols: partition_cols.to_vec(),
        columns: data
            .columns()
            .iter()
            .map(|c| (c.name.clone(), c.dtype.name().to_string()))
            .collect(),
    };
    storage::write_bytes(
        &table.entry_location()?,
        Bytes::from(serde_json::to_vec_pretty(&entry)?),
    )?;
    log::info!(
        "[GlueWriter] wrote {} rows to {}.{} ({:?}, {} partition(s))",
        data.nrows(),
        table.database,
        table.table,
        mode,
        groups.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Column;

    fn frame(sides: &[i64], amounts: &[f64]) -> Frame {
        Frame::new(vec![Column::floats("AMOUNT", amounts), Column::ints("SIDE", sides)]).unwrap()
    }

    #[test]
    fn append_overwrite_and_partition_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = dir.path().to_string_lossy().into_owned();
        let table = TableRef {
            warehouse: &warehouse,
            catalog_id: "123456789",
            database: "db",
            table: "tx",
        };
        let parts = vec!["SIDE".to_string()];

        write_table(&table, None, &frame(&[0, 1], &[1.0, 2.0]), WriteMode::Overwrite, &parts).unwrap();
        write_table(&table, None, &frame(&[1], &[3.0]), WriteMode::Append, &parts).unwrap();
        assert_eq!(read_table(&table, None).unwrap().nrows(), 3);

        write_table(&table, None, &frame(&[1], &[9.0]), WriteMode::OverwritePartitions, &parts).unwrap();
        let out = read_table(&table, None).unwrap();
        assert_eq!(out.nrows(), 2);
        let mut amounts: Vec<f64> = out.get("AMOUNT").unwrap().values.iter().filter_map(|v| v.as_f64()).collect();
        amounts.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(amounts, vec![1.0, 9.0]);

        write_table(&table, None, &frame(&[5], &[7.0]), WriteMode::Overwrite, &parts).unwrap();
        assert_eq!(read_table(&table, None).unwrap().nrows(), 1);
    }

    #[test]
    fn explicit_path_is_remembered_by_the_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = dir.path().join("wh").to_string_lossy().into_owned();
        let custom = dir.path().join("custom").to_string_lossy().into_owned();
        let table = TableRef {
            warehouse: &warehouse,
            catalog_id: "1",
            database: "db",
            table: "t",
        };
        write_table(&table, Some(&custom), &frame(&[0], &[1.0]), WriteMode::Overwrite, &[]).unwrap();
        assert_eq!(table.resolve(None).unwrap(), Location::parse(&custom).unwrap());
        assert_eq!(read_table(&table, None).unwrap().nrows(), 1);
    }

    #[test]
    fn missing_tables_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = dir.path().to_string_lossy().into_owned();
        let table = TableRef {
            warehouse: &warehouse,
            catalog_id: "1",
            database: "db",
            table: "nope",
        };
        assert!(read_table(&table, None).is_err());
    }
}
