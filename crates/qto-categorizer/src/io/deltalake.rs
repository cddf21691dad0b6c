//! Delta tables: parquet data files plus a JSON transaction log.
//!
//! Each commit is `_delta_log/{version:020}.json`, one action per line.
//! Readers replay `add` and `remove` actions to find the live files.
//! Writers create the next commit exclusively and fail if it already exists.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

use crate::error::{Error, Result};
use crate::frame::{Column, DType, Frame};
use crate::io::columnar::{self, Compression};
use crate::io::storage::{self, Location};

const LOG_DIR: &str = "_delta_log";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeltaMode {
    #[default]
    Append,
    Overwrite,
}

/// Live state of a table after replaying its log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub version: Option<u64>,
    pub files: BTreeSet<String>,
    pub schema: Vec<(String, DType)>,
}

fn delta_type(dtype: DType) -> &'static str {
    match dtype {
        DType::Bool => "boolean",
        DType::Int => "long",
        DType::Float => "double",
        DType::Str => "string",
        DType::DateTime => "timestamp",
    }
}

fn frame_type(name: &str) -> DType {
    match name {
        "boolean" => DType::Bool,
        "long" | "integer" | "short" | "byte" => DType::Int,
        "double" | "float" => DType::Float,
        "timestamp" | "timestamp_ntz" | "date" => DType::DateTime,
        _ => DType::Str,
    }
}

fn schema_string(frame: &Frame) -> Result<String> {
    let fields: Vec<Json> = frame
        .columns()
        .iter()
        .map(|c| json!({ "name": c.name, "type": delta_type(c.dtype), "nullable": true, "metadata": {} }))
        .collect();
    Ok(serde_json::to_string(&json!({ "type": "struct", "fields": fields }))?)
}

fn parse_schema(raw: &str) -> Result<Vec<(String, DType)>> {
    let schema: Json = serde_json::from_str(raw)?;
    let fields = schema
        .get("fields")
        .and_then(Json::as_array)
        .ok_or_else(|| Error::value("Delta schema without fields"))?;
    fields
        .iter()
        .map(|f| {
            let name = f
                .get("name")
                .and_then(Json::as_str)
                .ok_or_else(|| Error::value("Delta schema field without name"))?;
            let dtype = f.get("type").and_then(Json::as_str).map(frame_type).unwrap_or(DType::Str);
            Ok((name.to_string(), dtype))
        })
        .collect()
}

fn commit_location(table: &Location, version: u64) -> Location {
    table.join(LOG_DIR).join(&format!("{:020}.json", version))
}

/// Replay the transaction log of `table`.
pub fn snapshot(table: &Location) -> Result<Snapshot> {
    let log_dir = table.join(LOG_DIR);
    let mut commits: Vec<(u64, Location)> = storage::list_files(&log_dir)?
        .into_iter()
        .filter_map(|file| {
            let name = file.file_name()?;
            let stem = name.strip_suffix(".json")?;
            if stem.len() != 20 {
                return None;
            }
            stem.parse::<u64>().ok().map(|v| (v, file))
        })
        .collect();
    commits.sort_by_key(|(v, _)| *v);

    let mut snap = Snapshot::default();
    if let Some((first, _)) = commits.first() {
        if *first != 0 {
            return Err(Error::value(format!(
                "Delta log of {} starts at version {}; checkpoints are not supported",
                table, first
            )));
        }
    }
    for (version, file) in commits {
        let text = storage::read_to_string(&file)?;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let action: Json = serde_json::from_str(line)?;
            if let Some(add) = action.get("add") {
                if let Some(path) = add.get("path").and_then(Json::as_str) {
                    snap.files.insert(path.to_string());
                }
            } else if let Some(remove) = action.get("remove") {
                if let Some(path) = remove.get("path").and_then(Json::as_str) {
                    snap.files.remove(path);
                }
            } else if let Some(meta) = action.get("metaData") {
                if let Some(raw) = meta.get("schemaString").and_then(Json::as_str) {
                    snap.schema = parse_schema(raw)?;
                }
            }
        }
        snap.version = Some(version);
    }
    Ok(snap)
}

pub fn read_table(table: &Location) -> Result<Frame> {
    let snap = snapshot(table)?;
    let version = snap
        .version
        .ok_or_else(|| Error::value(format!("{} is not a Delta table", table)))?;
    log::info!(
        "[DeltalakeReader] reading {} file(s) of {} at version {}",
        snap.files.len(),
        table,
        version
    );
    if snap.files.is_empty() {
        let columns = snap
            .schema
            .iter()
            .map(|(name, dtype)| Column::new(name.clone(), *dtype, Vec::new()))
            .collect();
        return Frame::new(columns);
    }
    let frames = snap
        .files
        .iter()
        .map(|path| columnar::decode(storage::read_bytes(&table.join(path))?))
        .collect::<Result<Vec<_>>>()?;
    Frame::concat(frames)
}

pub fn write_table(table: &Location, data: &Frame, mode: DeltaMode) -> Result<u64> {
    let snap = snapshot(table)?;
    let schema: Vec<(String, DType)> = data
        .columns()
        .iter()
        .map(|c| (c.name.clone(), c.dtype))
        .collect();
    if mode == DeltaMode::Append && snap.version.is_some() && snap.schema != schema {
        return Err(Error::value(format!(
            "Schema of the appended data {:?} does not match the table schema {:?}",
            schema, snap.schema
        )));
    }

    let now = chrono::Utc::now().timestamp_millis();
    let part = format!("part-00000-{}-c000.snappy.parquet", uuid::Uuid::new_v4());
    let encoded = columnar::encode(data, Compression::Snappy)?;
    let size = encoded.len();
    storage::write_bytes(&table.join(&part), encoded)?;

    let mut actions: Vec<Json> = Vec::new();
    if snap.version.is_none() {
        actions.push(json!({ "protocol": { "minReaderVersion": 1, "minWriterVersion": 2 } }));
    }
    if snap.version.is_none() || mode == DeltaMode::Overwrite {
        actions.push(json!({
            "metaData": {
                "id": uuid::Uuid::new_v4().to_string(),
                "format": { "provider": "parquet", "options": {} },
                "schemaString": schema_string(data)?,
                "partitionColumns": [],
                "configuration": {},
                "createdTime": now,
            }
        }));
    }
    if mode == DeltaMode::Overwrite {
        for path in &snap.files {
            actions.push(json!({
                "remove": { "path": path, "deletionTimestamp": now, "dataChange": true }
            }));
        }
    }
    actions.push(json!({
        "add": {
            "path": part,
            "partitionValues": BTreeMap::<String, String>::new(),
            "size": size,
            "modificationTime": now,
            "dataChange": true,
        }
    }));
    let operation_mode = match mode {
        DeltaMode::Append => "Append",
        DeltaMode::Overwrite => "Overwrite",
    };
    actions.push(json!({
        "commitInfo": {
            "timestamp": now,
            "operation": "WRITE",
            "operationParameters": { "mode": operation_mode },
        }
    }));

    let body = actions
        .iter()
        .map(serde_json::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?
        .join("\n");
    let version = snap.version.map(|v| v + 1).unwrap_or(0);
    if !storage::write_new(&commit_location(table, version), Bytes::from(body + "\n"))? {
        storage::delete(&table.join(&part))?;
        return Err(Error::value(format!(
            "Version {} of {} was committed concurrently",
            version, table
        )));
    }
    log::info!(
        "[DeltalakeWriter] committed version {} of {} ({} rows, {})",
        version,
        table,
        data.nrows(),
        operation_mode
    );
    Ok(version)
}
